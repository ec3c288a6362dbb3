use camino::Utf8PathBuf;
use thiserror::Error;

/// Fatal errors terminate the process. This is the only tier that
/// surfaces as a top-level `Result::Err` out of `main`.
#[derive(Debug, Error)]
pub enum HotError {
    #[error("watch configuration not found at {0}")]
    ConfigNotFound(Utf8PathBuf),

    #[error("failed to read watch configuration {path}: {source}")]
    ConfigRead {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse watch configuration {path}: {source}")]
    ConfigParse {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("two or more targets resolve to the same output: {0:?}")]
    DuplicateOutputs(Vec<Utf8PathBuf>),

    #[error("no common ancestor directory across the watch configuration and its manifests")]
    NoCommonRoot,

    #[error("failed to bind websocket/http server: {0}")]
    Bind(#[source] std::io::Error),

    #[error("filesystem watcher failed: {0}")]
    Watch(#[from] notify::Error),
}

/// Per-target resolution errors. These accumulate into
/// `Project::resolution_errors`; they never abort the whole run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("input(s) not found: {0:?}")]
    InputsNotFound(Vec<String>),

    #[error("input(s) failed to resolve: {0:?}")]
    InputsFailedToResolve(Vec<String>),

    #[error("duplicate inputs referencing the same physical file: {0:?}")]
    DuplicateInputs(Vec<String>),

    #[error("no manifest found for input {0}")]
    ManifestNotFound(String),

    #[error("inputs for this target span more than one manifest: {0:?}")]
    NonUniqueManifests(Vec<Utf8PathBuf>),
}

/// Distinguishes the very first write for a target from a subsequent
/// overwrite, so `WriteOutputError` can name which one failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteReason {
    FirstWrite,
    Overwrite,
}

/// Structured failure from the Injector's search-and-replace pass (§4.6).
/// Read and write failures are distinct from a probe/replace mismatch so
/// callers can surface `ReadOutputError`/`WriteOutputError` instead of a
/// blanket inject error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InjectError {
    #[error("failed to read compiled artifact: {message}")]
    ReadFailed { message: String },

    #[error(
        "hot-reload hook pattern not found after splice, diagnostic written to {diagnostic_path}"
    )]
    SearchAndReplaceNotFound { diagnostic_path: Utf8PathBuf },

    #[error("failed to write injected artifact ({reason:?}): {message}")]
    WriteFailed {
        reason: WriteReason,
        message: String,
    },
}

/// Failures returned by a post-processor worker (§4.5).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PostprocessError {
    #[error("failed to import post-process script {0}")]
    ImportError(Utf8PathBuf),

    #[error("post-process script's default export is not callable")]
    DefaultExportNotFunction,

    #[error("post-process script raised an error: {0}")]
    RunError(String),

    #[error("post-process script returned a non-text value")]
    BadReturnValue,

    #[error("post-process script not found: {0}")]
    MissingScript(Utf8PathBuf),

    #[error("post-process run was interrupted")]
    Interrupted,
}

/// Errors the browser session protocol's connect handshake can report
/// (§4.7). These never abort the supervisor; they close one session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("unexpected websocket path, expected \"/\"")]
    BadUrl,

    #[error("failed to decode connection parameters: {0}")]
    ParamsDecodeError(String),

    #[error("tool version mismatch: client {client}, server {server}")]
    WrongVersion { client: String, server: String },

    #[error("unknown target {target}, enabled: {enabled:?}, disabled: {disabled:?}")]
    TargetNotFound {
        target: String,
        enabled: Vec<String>,
        disabled: Vec<String>,
    },

    #[error("target {0} is disabled")]
    TargetDisabled(String),

    #[error("message tag not recognized: {0}")]
    BadJson(String),
}
