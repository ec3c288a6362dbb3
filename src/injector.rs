//! Splices hot-reload hooks into a freshly compiled artifact (§4.6).
//!
//! Grounded on the teacher's `core.rs` `Hash32` (BLAKE3 content hashing used
//! there for cache keys and asset filenames) — the same hashing idiom names
//! our diagnostic files when a splice fails.

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{InjectError, WriteReason};

/// One probe-then-replace operation: `probe` must match somewhere in the
/// source for this operation to apply at all; `replace` is the pattern
/// actually substituted. Splitting the two lets an operation report
/// precisely "found the landmark but not the exact hook" rather than a
/// blanket not-found.
pub struct SpliceOperation {
    pub name: &'static str,
    pub probe: regex::Regex,
    pub replace: regex::Regex,
    pub replacement: &'static str,
}

/// The fixed set of search-and-replace operations that make a compiled
/// artifact hot-reloadable. Patterns are illustrative placeholders for the
/// handful of well-known landmarks the real compiler's output contains
/// (the program registration call, the `_Platform_initialize` call site,
/// and the top-level `this.Elm = ...` export); the Injector's contract
/// (§4.6) is about the splice *procedure*, not these specific regexes.
pub fn default_operations() -> Vec<SpliceOperation> {
    vec![
        SpliceOperation {
            name: "program_init_hook",
            probe: regex::Regex::new(r"_Platform_initialize").unwrap(),
            replace: regex::Regex::new(r"var (\w+) = _Platform_initialize").unwrap(),
            replacement: "var $1 = __hot_onInit(_Platform_initialize",
        },
        SpliceOperation {
            name: "export_hook",
            probe: regex::Regex::new(r"this\.Elm").unwrap(),
            replace: regex::Regex::new(r"this\.Elm\s*=").unwrap(),
            replacement: "this.Elm = (globalThis.__hot_register(this.Elm = ",
        },
    ]
}

pub struct Injector {
    operations: Vec<SpliceOperation>,
}

impl Injector {
    pub fn new() -> Self {
        Self {
            operations: default_operations(),
        }
    }

    /// Runs the five-step algorithm against `artifact_path`:
    /// 1. read bytes (`ReadOutputError` on failure)
    /// 2. run each probe/replace operation
    /// 3. on a probe-hit/replace-miss, write a diagnostic file and fail
    /// 4. write transformed bytes back
    /// 5. (proxy stubs are [`Injector::write_proxy_stub`], a separate entry
    ///    point — they never go through the splice operations at all)
    pub fn inject(
        &self,
        artifact_path: &Utf8Path,
        write_reason: WriteReason,
    ) -> Result<(), InjectError> {
        let bytes = std::fs::read(artifact_path).map_err(|err| InjectError::ReadFailed {
            message: err.to_string(),
        })?;
        let mut source = String::from_utf8_lossy(&bytes).into_owned();

        for op in &self.operations {
            if !op.probe.is_match(&source) {
                continue;
            }
            if !op.replace.is_match(&source) {
                let diagnostic_path = diagnostic_path_for(artifact_path, source.as_bytes());
                std::fs::write(&diagnostic_path, &source).ok();
                return Err(InjectError::SearchAndReplaceNotFound { diagnostic_path });
            }
            source = op.replace.replace(&source, op.replacement).into_owned();
        }

        std::fs::write(artifact_path, source.as_bytes()).map_err(|err| InjectError::WriteFailed {
            reason: write_reason,
            message: err.to_string(),
        })?;
        Ok(())
    }

    /// §4.6 step 5: for disabled targets or pre-first-build sessions, write
    /// a small stub that reconnects and forces a full reload once the real
    /// build lands.
    pub fn write_proxy_stub(&self, artifact_path: &Utf8Path) -> std::io::Result<()> {
        const PROXY_STUB: &str = r#"
(function () {
  var socket = new WebSocket(window.location.href.replace(/^http/, "ws"));
  socket.addEventListener("message", function () {
    window.location.reload();
  });
})();
"#;
        std::fs::write(artifact_path, PROXY_STUB)
    }
}

impl Default for Injector {
    fn default() -> Self {
        Self::new()
    }
}

/// `<artifact>.inject-failed.<hash>.js`, content-addressed the same way the
/// teacher names cache-keyed assets.
fn diagnostic_path_for(artifact_path: &Utf8Path, content: &[u8]) -> Utf8PathBuf {
    let hash = blake3::hash(content).to_hex();
    let stem = artifact_path.file_stem().unwrap_or("artifact");
    let dir = artifact_path.parent().unwrap_or(Utf8Path::new("."));
    dir.join(format!("{stem}.inject-failed.{}.js", &hash[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splices_known_landmarks() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let artifact = root.join("out.js");
        std::fs::write(
            &artifact,
            "var app = _Platform_initialize(x, y, z);\nthis.Elm = {};",
        )
        .unwrap();

        let injector = Injector::new();
        injector.inject(&artifact, WriteReason::FirstWrite).unwrap();

        let result = std::fs::read_to_string(&artifact).unwrap();
        assert!(result.contains("__hot_onInit"));
        assert!(result.contains("__hot_register"));
    }

    #[test]
    fn probe_without_replace_writes_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let artifact = root.join("out.js");
        // Matches the probe ("_Platform_initialize" appears) but not the
        // capturing replace pattern (no `var NAME = ` prefix).
        std::fs::write(&artifact, "_Platform_initialize(x, y, z);").unwrap();

        let injector = Injector::new();
        let err = injector
            .inject(&artifact, WriteReason::FirstWrite)
            .unwrap_err();

        match err {
            InjectError::SearchAndReplaceNotFound { diagnostic_path } => {
                assert!(diagnostic_path.is_file());
            }
            other => panic!("expected SearchAndReplaceNotFound, got {other:?}"),
        }
    }

    #[test]
    fn read_failure_reports_read_failed() {
        let injector = Injector::new();
        let missing = Utf8Path::new("/nonexistent/path/to/artifact.js");
        let err = injector.inject(missing, WriteReason::FirstWrite).unwrap_err();
        assert!(matches!(err, InjectError::ReadFailed { .. }));
    }

    #[test]
    #[cfg(unix)]
    fn write_failure_reports_write_failed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let artifact = root.join("out.js");
        std::fs::write(&artifact, "no landmarks here").unwrap();

        let mut perms = std::fs::metadata(&artifact).unwrap().permissions();
        perms.set_mode(0o444);
        std::fs::set_permissions(&artifact, perms).unwrap();

        let injector = Injector::new();
        let err = injector
            .inject(&artifact, WriteReason::Overwrite)
            .unwrap_err();

        match err {
            InjectError::WriteFailed { reason, .. } => assert_eq!(reason, WriteReason::Overwrite),
            other => panic!("expected WriteFailed, got {other:?}"),
        }

        let mut perms = std::fs::metadata(&artifact).unwrap().permissions();
        perms.set_mode(0o644);
        std::fs::set_permissions(&artifact, perms).unwrap();
    }

    #[test]
    fn proxy_stub_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let artifact = root.join("proxy.js");

        let injector = Injector::new();
        injector.write_proxy_stub(&artifact).unwrap();

        let contents = std::fs::read_to_string(&artifact).unwrap();
        assert!(contents.contains("WebSocket"));
    }
}
