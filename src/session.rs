//! Per-client browser session state machine (§4.7).
//!
//! The connect handshake, message taxonomy, and reload-verdict algorithm are
//! pure logic here; `server.rs` (grounded on the teacher's
//! `engine/runner/http.rs`) is what actually terminates an axum
//! `WebSocketUpgrade` and drives this state machine from real frames.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::CompilationMode;
use crate::error::SessionError;
use crate::project::Project;

/// Query parameters the client sends on connect (§4.7, §6.3).
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub target_name: String,
    pub compiled_at: u64,
    pub tool_version: String,
}

impl ConnectParams {
    /// Decodes from the raw query string values axum's `Query` extractor
    /// would have already split out; kept as a free function so `server.rs`
    /// can hand it whatever it received without this module knowing about
    /// axum's extractor types.
    pub fn decode(
        target_name: Option<String>,
        compiled_at: Option<String>,
        tool_version: Option<String>,
    ) -> Result<Self, SessionError> {
        let target_name = target_name.ok_or(SessionError::BadUrl)?;
        let tool_version = tool_version.ok_or(SessionError::BadUrl)?;
        let compiled_at = compiled_at
            .ok_or(SessionError::BadUrl)?
            .parse::<u64>()
            .map_err(|_| SessionError::ParamsDecodeError("compiledAt must be numeric".to_string()))?;

        Ok(Self {
            target_name,
            compiled_at,
            tool_version,
        })
    }
}

/// Validates the connect handshake against the running project and this
/// binary's own version (§4.7 connect handshake, §6.5 `toolVersion`).
pub fn validate_connect(
    params: &ConnectParams,
    project: &Project,
    server_version: &str,
) -> Result<(), SessionError> {
    if params.tool_version != server_version {
        return Err(SessionError::WrongVersion {
            client: params.tool_version.clone(),
            server: server_version.to_string(),
        });
    }

    if project.find_output(&params.target_name).is_some() {
        return Ok(());
    }

    let disabled = project.disabled_target_names();
    if disabled.iter().any(|d| d == &params.target_name) {
        return Err(SessionError::TargetDisabled(params.target_name.clone()));
    }

    Err(SessionError::TargetNotFound {
        target: params.target_name.clone(),
        enabled: project.enabled_target_names(),
        disabled,
    })
}

/// Client -> server messages (§4.7 message taxonomy).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "tag")]
pub enum ClientMessage {
    ChangedCompilationMode { mode: CompilationMode },
    FocusedTab,
    ExitRequested,
    /// The patch-runtime's own hot-apply attempt raised an exception (§9
    /// "exception-as-control-flow in hot-patch failures") — the server can
    /// only learn this from the browser, never from comparing two artifact
    /// signatures.
    HotReloadFailed { error: String },
}

pub fn parse_client_message(raw: &str) -> Result<ClientMessage, SessionError> {
    serde_json::from_str(raw).map_err(|_| SessionError::BadJson(raw.to_string()))
}

/// Server -> client status updates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "tag")]
pub enum StatusUpdate {
    Connecting,
    WaitingForCompilation,
    SuccessfullyCompiled,
    CompilationError { message: String },
    UnexpectedError { message: String },
}

/// Server -> client delivery of a compiled artifact.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactDelivery {
    pub bytes: Vec<u8>,
    pub compiled_at: u64,
    pub record_fields: Option<HashSet<String>>,
}

/// The reason attached to a `FullReload` directive (§4.7 steps 1, 2, 3, 4,
/// 5, 6, plus the §9 open-question `TargetDisabled` resolution).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason")]
pub enum ReloadReason {
    FlagsTypeChanged,
    ProgramTypeChanged,
    DebugMetadataChanged,
    OptimizeFieldsChanged,
    InitChanged,
    HotReloadFailed { error: String },
    TargetDisabled,
}

/// The three kinds of server -> client frame (§4.7): a status update, an
/// artifact delivery, or a reload directive.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "tag")]
pub enum ServerMessage {
    Status(StatusUpdate),
    Artifact(ArtifactDelivery),
    FullReload { reason: ReloadReason },
    /// Ports added since the last patch (advisory, not a reload).
    PortsAdded { names: Vec<String> },
}

/// Top-level program constructor shape, compared at reload-verdict step 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramKind {
    Sandbox,
    Element,
    Document,
    Application,
}

/// Everything the reload-verdict algorithm needs about one compiled
/// artifact. Computing these fields is the compiler driver/Injector's job
/// (reading the artifact's metadata); this module only compares them.
#[derive(Debug, Clone)]
pub struct ArtifactSignature {
    pub flags_decoder_hash: Option<String>,
    pub program_kind: ProgramKind,
    pub debug_metadata_hash: Option<String>,
    pub record_fields: Option<HashSet<String>>,
    pub init_model_hash: String,
    pub ports: HashSet<String>,
}

/// Whether the previously supplied flags still decode against the new
/// artifact's flags decoder — supplied by the caller since only the
/// compiler driver can actually run the decoder.
pub struct ReloadContext {
    pub previous_flags_still_decode: bool,
    pub mode: CompilationMode,
}

/// Best-effort landmark scan of a freshly injected artifact, producing the
/// [`ArtifactSignature`] the reload-verdict algorithm compares. Like
/// `injector::default_operations`'s patterns, these are illustrative
/// stand-ins for the handful of well-known constructs the real compiler's
/// output contains — the §4.7 contract is the seven-step comparison, not
/// these specific markers. Fields we can't reliably isolate without the
/// compiler's actual structure (`flags_decoder_hash`, `debug_metadata_hash`)
/// fall back to the whole-artifact hash, which is conservative: any edit at
/// all is treated as a potential signature change rather than silently
/// assumed unchanged.
pub fn derive_signature(bytes: &[u8], mode: CompilationMode) -> ArtifactSignature {
    let source = String::from_utf8_lossy(bytes);
    let whole_hash = blake3::hash(bytes).to_hex().to_string();

    let program_kind = if source.contains("_Platform_worker") {
        ProgramKind::Sandbox
    } else if source.contains("_Browser_application") {
        ProgramKind::Application
    } else if source.contains("_Browser_document") {
        ProgramKind::Document
    } else {
        ProgramKind::Element
    };

    let ports = port_names_re()
        .captures_iter(&source)
        .map(|c| c[1].to_string())
        .collect();

    let record_fields = if mode == CompilationMode::Optimize {
        Some(
            mangled_field_re()
                .captures_iter(&source)
                .map(|c| c[1].to_string())
                .collect(),
        )
    } else {
        None
    };

    ArtifactSignature {
        flags_decoder_hash: Some(whole_hash.clone()),
        program_kind,
        debug_metadata_hash: (mode == CompilationMode::Debug).then(|| whole_hash.clone()),
        record_fields,
        init_model_hash: whole_hash,
        ports,
    }
}

fn port_names_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r#"ports\[["']([A-Za-z_][A-Za-z0-9_]*)["']\]"#).unwrap())
}

fn mangled_field_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\.([a-zA-Z]{1,2})\b").unwrap())
}

/// Implements §4.7's seven-step reload verdict algorithm. Returns the
/// reload reason if a full reload is required, or `None` for an in-place
/// patch (step 7). Also returns the set of newly added port names
/// regardless of verdict (the advisory is independent of the reload
/// decision).
pub fn reload_verdict(
    previous: &ArtifactSignature,
    current: &ArtifactSignature,
    ctx: &ReloadContext,
) -> (Option<ReloadReason>, Vec<String>) {
    let added_ports: Vec<String> = current
        .ports
        .difference(&previous.ports)
        .cloned()
        .collect();

    // Step 1
    if previous.flags_decoder_hash != current.flags_decoder_hash
        && !ctx.previous_flags_still_decode
    {
        return (Some(ReloadReason::FlagsTypeChanged), added_ports);
    }

    // Step 2
    if previous.program_kind != current.program_kind {
        return (Some(ReloadReason::ProgramTypeChanged), added_ports);
    }

    // Step 3
    if ctx.mode == CompilationMode::Debug
        && previous.debug_metadata_hash != current.debug_metadata_hash
    {
        return (Some(ReloadReason::DebugMetadataChanged), added_ports);
    }

    // Step 4
    if ctx.mode == CompilationMode::Optimize && previous.record_fields != current.record_fields {
        return (Some(ReloadReason::OptimizeFieldsChanged), added_ports);
    }

    // Step 5
    if previous.init_model_hash != current.init_model_hash {
        return (Some(ReloadReason::InitChanged), added_ports);
    }

    // Step 6 (hot-patch runtime failure) is reported later, from the
    // client's own `HotReloadFailed` signal after the patch was attempted;
    // it is not decidable from two signatures alone.

    (None, added_ports)
}

/// Bidirectional registry (§9): target name -> session ids, and session id
/// -> target name, with no strong back-links through shared data
/// structures. Both sides are updated together on connect/disconnect.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions_by_target: HashMap<String, HashSet<u64>>,
    target_by_session: HashMap<u64, String>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, session_id: u64, target_name: String) {
        self.sessions_by_target
            .entry(target_name.clone())
            .or_default()
            .insert(session_id);
        self.target_by_session.insert(session_id, target_name);
    }

    pub fn disconnect(&mut self, session_id: u64) {
        if let Some(target) = self.target_by_session.remove(&session_id) {
            if let Some(sessions) = self.sessions_by_target.get_mut(&target) {
                sessions.remove(&session_id);
                if sessions.is_empty() {
                    self.sessions_by_target.remove(&target);
                }
            }
        }
    }

    pub fn sessions_for(&self, target_name: &str) -> impl Iterator<Item = u64> + '_ {
        self.sessions_by_target
            .get(target_name)
            .into_iter()
            .flatten()
            .copied()
    }

    pub fn targets_with_sessions(&self) -> HashSet<String> {
        self.sessions_by_target.keys().cloned().collect()
    }

    pub fn target_of(&self, session_id: u64) -> Option<&str> {
        self.target_by_session.get(&session_id).map(|s| s.as_str())
    }
}

/// §4.7 backpressure: on reconnect the client presents its own
/// `compiledAt`; a fresh delivery is only needed if it's older than the
/// target's current `Success`.
pub fn needs_redelivery(client_compiled_at: u64, current_compiled_at: u64) -> bool {
    client_compiled_at < current_compiled_at
}

/// The proxy-stub-then-disabled race (§9 open question, resolved in
/// DESIGN.md): emit `FullReload{TargetDisabled}` and close the session.
pub fn target_disabled_reload() -> ServerMessage {
    ServerMessage::FullReload {
        reason: ReloadReason::TargetDisabled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature() -> ArtifactSignature {
        ArtifactSignature {
            flags_decoder_hash: Some("f1".to_string()),
            program_kind: ProgramKind::Element,
            debug_metadata_hash: Some("d1".to_string()),
            record_fields: None,
            init_model_hash: "m1".to_string(),
            ports: HashSet::new(),
        }
    }

    #[test]
    fn identical_signatures_patch_in_place() {
        let sig = signature();
        let ctx = ReloadContext {
            previous_flags_still_decode: true,
            mode: CompilationMode::Standard,
        };
        let (verdict, ports) = reload_verdict(&sig, &sig, &ctx);
        assert_eq!(verdict, None);
        assert!(ports.is_empty());
    }

    #[test]
    fn program_kind_change_forces_full_reload() {
        let previous = signature();
        let mut current = signature();
        current.program_kind = ProgramKind::Sandbox;
        let ctx = ReloadContext {
            previous_flags_still_decode: true,
            mode: CompilationMode::Standard,
        };
        let (verdict, _) = reload_verdict(&previous, &current, &ctx);
        assert_eq!(verdict, Some(ReloadReason::ProgramTypeChanged));
    }

    #[test]
    fn optimize_record_fields_change_forces_reload_only_in_optimize_mode() {
        let mut previous = signature();
        previous.record_fields = Some(HashSet::from(["a".to_string()]));
        let mut current = signature();
        current.record_fields = Some(HashSet::from(["b".to_string()]));

        let standard_ctx = ReloadContext {
            previous_flags_still_decode: true,
            mode: CompilationMode::Standard,
        };
        assert_eq!(reload_verdict(&previous, &current, &standard_ctx).0, None);

        let optimize_ctx = ReloadContext {
            previous_flags_still_decode: true,
            mode: CompilationMode::Optimize,
        };
        assert_eq!(
            reload_verdict(&previous, &current, &optimize_ctx).0,
            Some(ReloadReason::OptimizeFieldsChanged)
        );
    }

    #[test]
    fn flags_change_only_forces_reload_if_old_flags_stop_decoding() {
        let previous = signature();
        let mut current = signature();
        current.flags_decoder_hash = Some("f2".to_string());

        let still_decodes_ctx = ReloadContext {
            previous_flags_still_decode: true,
            mode: CompilationMode::Standard,
        };
        assert_eq!(reload_verdict(&previous, &current, &still_decodes_ctx).0, None);

        let broken_ctx = ReloadContext {
            previous_flags_still_decode: false,
            mode: CompilationMode::Standard,
        };
        assert_eq!(
            reload_verdict(&previous, &current, &broken_ctx).0,
            Some(ReloadReason::FlagsTypeChanged)
        );
    }

    #[test]
    fn added_ports_are_reported_regardless_of_verdict() {
        let previous = signature();
        let mut current = signature();
        current.ports.insert("toJs".to_string());

        let ctx = ReloadContext {
            previous_flags_still_decode: true,
            mode: CompilationMode::Standard,
        };
        let (verdict, ports) = reload_verdict(&previous, &current, &ctx);
        assert_eq!(verdict, None);
        assert_eq!(ports, vec!["toJs".to_string()]);
    }

    #[test]
    fn session_table_tracks_both_directions() {
        let mut table = SessionTable::new();
        table.connect(1, "Html".to_string());
        table.connect(2, "Html".to_string());

        assert_eq!(table.sessions_for("Html").count(), 2);
        assert_eq!(table.target_of(1), Some("Html"));

        table.disconnect(1);
        assert_eq!(table.sessions_for("Html").count(), 1);
        assert_eq!(table.target_of(1), None);
    }

    #[test]
    fn derive_signature_detects_program_kind_and_ports() {
        let source = br#"var app = _Browser_application(x); ports["toJs"];"#;
        let sig = derive_signature(source, CompilationMode::Standard);
        assert_eq!(sig.program_kind, ProgramKind::Application);
        assert!(sig.ports.contains("toJs"));
        assert!(sig.record_fields.is_none());
    }

    #[test]
    fn parses_hot_reload_failed_message() {
        let raw = r#"{"tag":"HotReloadFailed","error":"TypeError: x is not a function"}"#;
        let message = parse_client_message(raw).unwrap();
        match message {
            ClientMessage::HotReloadFailed { error } => {
                assert_eq!(error, "TypeError: x is not a function");
            }
            other => panic!("expected HotReloadFailed, got {other:?}"),
        }
    }

    #[test]
    fn redelivery_only_when_client_is_stale() {
        assert!(needs_redelivery(5, 10));
        assert!(!needs_redelivery(10, 10));
        assert!(!needs_redelivery(15, 10));
    }
}
