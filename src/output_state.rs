//! Per-target mutable build record and its status machine (§3, §4.2).
//!
//! Grounded on the teacher's `core.rs` (`Mode`/`Environment` — small, plain
//! data carried through the build) and `engine/runner.rs`'s `TaskExecution`
//! (`{start, duration}` pairs recorded per completed unit of work), extended
//! here into the ordered `durations` list §4.2 calls for.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;

use crate::config::CompilationMode;
use crate::error::{InjectError, PostprocessError, WriteReason};
use crate::project::InputPath;

/// A cooperative cancellation flag shared between the supervisor and a
/// long-running build/postprocess worker. Mirrors the teacher's treatment
/// of cancellation as "send a signal, treat the eventual exit as benign"
/// (§5) rather than forcibly unwinding the worker thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One tagged span of §4.2's duration accounting. `elapsed` is frozen at
/// the moment the span's state is exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationSpan {
    pub tag: DurationTag,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationTag {
    Queued,
    Build,
    TypecheckOnly,
    SourceWalk,
    Inject,
    Postprocess,
}

/// The tagged status variant of §4.2. Error leaves carry enough context to
/// explain themselves to both the terminal renderer and a subscribed
/// session's `CompilationError`/`UnexpectedError` message.
#[derive(Debug, Clone)]
pub enum OutputStatus {
    NotWrittenToDisk,
    QueuedForBuild {
        start_timestamp: Instant,
    },
    Building {
        mode: CompilationMode,
        durations: Vec<DurationSpan>,
        cancel: CancelToken,
    },
    TypecheckOnly {
        durations: Vec<DurationSpan>,
        cancel: CancelToken,
    },
    QueuedForPostprocess {
        argv: Vec<String>,
        payload: Vec<u8>,
        compiled_at: Instant,
        record_fields: Option<HashSet<String>>,
        durations: Vec<DurationSpan>,
    },
    Postprocessing {
        cancel: CancelToken,
        durations: Vec<DurationSpan>,
    },
    Success {
        artifact_size: u64,
        final_size: u64,
        compiled_at: Instant,
        durations: Vec<DurationSpan>,
    },
    Interrupted,
    ParseError(String),
    InjectError(InjectError),
    ReadOutputError(String),
    WriteOutputError {
        reason: WriteReason,
        message: String,
    },
    WriteProxyOutputError(String),
    CompilerError(String),
    PostprocessError(PostprocessError),
    WalkSourcesError(String),
}

impl OutputStatus {
    /// Whether this status represents an in-flight, cancellable operation
    /// (§5 Cancellation).
    pub fn cancel_token(&self) -> Option<&CancelToken> {
        match self {
            OutputStatus::Building { cancel, .. } => Some(cancel),
            OutputStatus::TypecheckOnly { cancel, .. } => Some(cancel),
            OutputStatus::Postprocessing { cancel, .. } => Some(cancel),
            _ => None,
        }
    }

    pub fn is_error_leaf(&self) -> bool {
        matches!(
            self,
            OutputStatus::ParseError(_)
                | OutputStatus::InjectError(_)
                | OutputStatus::ReadOutputError(_)
                | OutputStatus::WriteOutputError { .. }
                | OutputStatus::WriteProxyOutputError(_)
                | OutputStatus::CompilerError(_)
                | OutputStatus::PostprocessError(_)
                | OutputStatus::WalkSourcesError(_)
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.is_error_leaf() || matches!(self, OutputStatus::Success { .. } | OutputStatus::Interrupted)
    }

    pub fn label(&self) -> &'static str {
        match self {
            OutputStatus::NotWrittenToDisk => "not_written_to_disk",
            OutputStatus::QueuedForBuild { .. } => "queued_for_build",
            OutputStatus::Building { .. } => "building",
            OutputStatus::TypecheckOnly { .. } => "typecheck_only",
            OutputStatus::QueuedForPostprocess { .. } => "queued_for_postprocess",
            OutputStatus::Postprocessing { .. } => "postprocessing",
            OutputStatus::Success { .. } => "success",
            OutputStatus::Interrupted => "interrupted",
            OutputStatus::ParseError(_) => "parse_error",
            OutputStatus::InjectError(_) => "inject_error",
            OutputStatus::ReadOutputError(_) => "read_output_error",
            OutputStatus::WriteOutputError { .. } => "write_output_error",
            OutputStatus::WriteProxyOutputError(_) => "write_proxy_output_error",
            OutputStatus::CompilerError(_) => "compiler_error",
            OutputStatus::PostprocessError(_) => "postprocess_error",
            OutputStatus::WalkSourcesError(_) => "walk_sources_error",
        }
    }
}

/// Per-target mutable build record (§3 "OutputState"). Created once at
/// startup by the `ProjectResolver` and never destroyed; only the fields
/// below evolve over the life of the run.
#[derive(Debug, Clone)]
pub struct OutputState {
    /// Carried for diagnostics/session lookups; not itself part of the
    /// spec's `OutputState` fields, but every consumer needs to name the
    /// target its record belongs to.
    pub name: String,
    pub inputs: Vec<InputPath>,
    pub compilation_mode: CompilationMode,
    pub status: OutputStatus,
    pub all_related_source_paths: HashSet<Utf8PathBuf>,
    pub record_fields: Option<HashSet<String>>,
    pub dirty: bool,
    /// Set when the browser reports a hot-patch it was just handed failed to
    /// apply (§4.7 step 6); consulted and cleared by the next successful
    /// build's reload-verdict (step 1), since a browser that just failed to
    /// decode a patch is the only real signal we have that the previous
    /// flags value might not survive the next one either.
    pub last_patch_failed: bool,
}

impl OutputState {
    pub fn new(name: String, inputs: Vec<InputPath>, compilation_mode: CompilationMode) -> Self {
        Self {
            name,
            inputs,
            compilation_mode,
            status: OutputStatus::NotWrittenToDisk,
            all_related_source_paths: HashSet::new(),
            record_fields: None,
            dirty: false,
            last_patch_failed: false,
        }
    }

    /// §4.2: "Any in-flight state receiving a fresh dirty signal
    /// transitions to `Interrupted`, cancels the underlying work... and
    /// re-enters `QueuedForBuild`."
    pub fn mark_dirty(&mut self, now: Instant) {
        if let Some(cancel) = self.status.cancel_token() {
            cancel.cancel();
            self.status = OutputStatus::Interrupted;
        }
        self.dirty = true;
        self.status = OutputStatus::QueuedForBuild {
            start_timestamp: now,
        };
    }

    pub fn is_source_related(&self, path: &camino::Utf8Path) -> bool {
        self.all_related_source_paths.contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_dirty_cancels_inflight_and_requeues() {
        let mut state = OutputState::new("Html".to_string(), vec![], CompilationMode::Standard);
        let cancel = CancelToken::new();
        state.status = OutputStatus::Building {
            mode: CompilationMode::Standard,
            durations: vec![],
            cancel: cancel.clone(),
        };

        state.mark_dirty(Instant::now());

        assert!(cancel.is_cancelled());
        assert!(matches!(state.status, OutputStatus::QueuedForBuild { .. }));
        assert!(state.dirty);
    }

    #[test]
    fn mark_dirty_from_rest_state_just_queues() {
        let mut state = OutputState::new("Html".to_string(), vec![], CompilationMode::Standard);
        state.mark_dirty(Instant::now());
        assert!(matches!(state.status, OutputStatus::QueuedForBuild { .. }));
    }

    #[test]
    fn error_leaf_classification() {
        assert!(OutputStatus::CompilerError("x".into()).is_error_leaf());
        assert!(!OutputStatus::Success {
            artifact_size: 0,
            final_size: 0,
            compiled_at: Instant::now(),
            durations: vec![],
        }
        .is_error_leaf());
        assert!(OutputStatus::Success {
            artifact_size: 0,
            final_size: 0,
            compiled_at: Instant::now(),
            durations: vec![],
        }
        .is_terminal());
    }
}
