//! Watch configuration (§6.1) and persisted preferences (§6.2).
//!
//! Grounded on the teacher's serde/serde_json usage throughout (frontmatter
//! and cache (de)serialization) — plain `#[derive(Deserialize)]` structs with
//! `#[serde(default)]` for optional fields, no custom `Deserialize` impls.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::HotError;

/// `{targets: {name: {inputs: [...], output: ...}}, postprocess?: [...]}`
/// (§6.1). Paths are relative to the file's directory; resolved against it
/// downstream in [`crate::project::ProjectResolver`].
#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    pub targets: BTreeMap<String, TargetConfig>,
    #[serde(default)]
    pub postprocess: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub inputs: Vec<String>,
    pub output: String,
}

impl WatchConfig {
    /// Reads and parses the watch configuration file. I/O and parse
    /// failures are Fatal (§7) — there is no target to attribute them to.
    pub fn load(path: &Utf8Path) -> Result<Self, HotError> {
        if !path.is_file() {
            return Err(HotError::ConfigNotFound(path.to_path_buf()));
        }

        let text = std::fs::read_to_string(path).map_err(|source| HotError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&text).map_err(|source| HotError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// `{port, targets: {name: {compilationMode}}}` (§6.2), persisted at a
/// well-known path under the manifest tree. On corruption, callers should
/// ignore the error and start fresh — this type does not retry internally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetPreferences>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TargetPreferences {
    pub compilation_mode: Option<CompilationMode>,
}

/// One of `{debug, standard, optimize}` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilationMode {
    Debug,
    Standard,
    Optimize,
}

impl Default for CompilationMode {
    fn default() -> Self {
        CompilationMode::Standard
    }
}

pub const PREFERENCES_FILE_NAME: &str = ".hot-preferences.json";

impl Preferences {
    /// Loads preferences from `manifest_dir/.hot-preferences.json`. Any
    /// failure (missing file, unreadable, malformed JSON) is treated as "no
    /// preferences yet" per §6.2.
    pub fn load(manifest_dir: &Utf8Path) -> Self {
        let path = manifest_dir.join(PREFERENCES_FILE_NAME);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, manifest_dir: &Utf8Path) -> std::io::Result<()> {
        let path = manifest_dir.join(PREFERENCES_FILE_NAME);
        let text = serde_json::to_string_pretty(self).unwrap_or_default();
        std::fs::write(path, text)
    }
}

/// Reads `MAX_PARALLEL` (positive integer, §4.1 step 8 / §6.5), defaulting
/// to the number of available CPUs, clamped to at least 1.
pub fn max_parallel_from_env() -> usize {
    std::env::var("MAX_PARALLEL")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&v| v > 0)
        .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
        .max(1)
}

/// Reads `WORKER_LIMIT_TIMEOUT_MS` (non-negative integer, §4.5 / §5),
/// defaulting to 10 seconds.
pub fn worker_idle_timeout_from_env() -> std::time::Duration {
    let ms = std::env::var("WORKER_LIMIT_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(10_000);
    std::time::Duration::from_millis(ms)
}

/// The compiler binary the driver shells out to (§1 Non-goals: "the
/// compiler invocation itself" is an external collaborator; only its name
/// is ours to configure). Overridable via `COMPILER_BIN` for testing
/// against a stand-in executable.
pub fn compiler_binary_from_env() -> String {
    std::env::var("COMPILER_BIN").unwrap_or_else(|_| "elm".to_string())
}

/// The runtime used to load and invoke a post-process script's default
/// export (§4.5). Overridable via `POSTPROCESS_RUNTIME`.
pub fn postprocess_runtime_from_env() -> String {
    std::env::var("POSTPROCESS_RUNTIME").unwrap_or_else(|_| "node".to_string())
}

/// Port the websocket/http server binds (§6.3). Overridable via `PORT`.
pub fn server_port_from_env() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8000)
}

/// Resolves the port to bind at startup (§6.2, §6.5): `PORT` wins if set,
/// otherwise the persisted preference, otherwise the default.
pub fn resolve_port(preferences: &Preferences) -> u16 {
    match std::env::var("PORT") {
        Ok(_) => server_port_from_env(),
        Err(_) => preferences.port.unwrap_or(8000),
    }
}

#[derive(Debug)]
pub struct WatchConfigPath {
    pub path: Utf8PathBuf,
    pub dir: Utf8PathBuf,
}

impl WatchConfigPath {
    pub fn new(path: Utf8PathBuf) -> Self {
        let dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| Utf8PathBuf::from("."));
        Self { path, dir }
    }
}
