//! Drives one compiler invocation (typecheck-only or build), tracks its
//! duration, and supports interruption (§4.1 table "Compiler driver", §5
//! Cancellation "Build" case).
//!
//! The compiler binary itself is an external collaborator (§1 Non-goals);
//! this module only knows how to build its argv, spawn it, and interpret
//! its exit status and JSON error report. Grounded on the teacher's
//! subprocess-shelling pattern in `plugin/svelte.rs` (`Command::new(..).
//! stdin(Stdio::piped()).stdout(Stdio::piped())`, a dedicated thread reading
//! `wait_with_output`), generalized from "panic on failure" to structured
//! `Result`s per the teacher's own `error.rs` conventions.

use std::io;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::config::CompilationMode;
use crate::output_state::CancelToken;

/// One compiler problem as reported in its `--report=json`-style output.
/// The exact schema is the external compiler's; we only read the fields the
/// session protocol and terminal renderer need.
#[derive(Debug, Clone, Deserialize)]
pub struct CompilerProblem {
    pub path: Option<Utf8PathBuf>,
    pub title: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompilerReport {
    #[serde(default)]
    pub errors: Vec<CompilerProblem>,
}

/// Result of one completed or aborted invocation.
#[derive(Debug, Clone)]
pub enum CompilerOutcome {
    /// Exit code 0; the artifact at `artifact_path` is ready for the
    /// Injector.
    Success { artifact_path: Utf8PathBuf },
    /// Non-zero exit with a JSON report the compiler emitted on stderr.
    CompilerError(CompilerReport),
    /// Non-zero exit whose stderr didn't parse as a report at all.
    ParseError(String),
    /// Cancelled before the process exited (§5).
    Interrupted,
}

/// Builds the compiler's argv for a given target. `--output` is omitted for
/// typecheck-only mode (policy 3): the compiler is asked only to validate.
pub fn build_argv(
    manifest_dir: &Utf8Path,
    entry_points: &[Utf8PathBuf],
    artifact_path: &Utf8Path,
    mode: CompilationMode,
    typecheck_only: bool,
) -> Vec<String> {
    let mut argv = vec!["make".to_string()];
    argv.extend(entry_points.iter().map(|p| p.to_string()));

    if typecheck_only {
        argv.push("--report=json".to_string());
        return argv;
    }

    argv.push(format!("--output={artifact_path}"));
    match mode {
        CompilationMode::Debug => argv.push("--debug".to_string()),
        CompilationMode::Optimize => argv.push("--optimize".to_string()),
        CompilationMode::Standard => {}
    }
    argv.push("--report=json".to_string());
    let _ = manifest_dir;
    argv
}

/// A spawned, in-progress compiler invocation. Holds the child behind a
/// mutex so the supervisor thread can call [`kill`](Self::kill) while a
/// separate waiter thread blocks on its exit. Cheaply `Clone`: the
/// supervisor keeps one handle to kill on a fresh dirty signal while handing
/// the other to the waiter thread that calls [`wait`](Self::wait).
#[derive(Clone)]
pub struct RunningInvocation {
    child: Arc<Mutex<Child>>,
    cancel: CancelToken,
    started_at: Instant,
}

impl RunningInvocation {
    pub fn spawn(
        compiler_binary: &str,
        argv: &[String],
        cwd: &Utf8Path,
        cancel: CancelToken,
    ) -> io::Result<Self> {
        let child = Command::new(compiler_binary)
            .args(argv)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            cancel,
            started_at: Instant::now(),
        })
    }

    /// §5: "send a termination signal to the compiler process; treat its
    /// eventual exit as benign." The waiter thread observes this through
    /// `cancel` and reports `Interrupted` regardless of the exit status
    /// `kill` produces.
    pub fn kill(&self) {
        self.cancel.cancel();
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Blocks until the process exits. Meant to be called from a dedicated
    /// waiter thread, not the supervisor thread itself (§5 "Suspension
    /// points").
    pub fn wait(self, artifact_path: Utf8PathBuf) -> CompilerOutcome {
        let output = {
            let mut child = match self.child.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            child.wait()
        };

        let exit_status = match output {
            Ok(status) => status,
            Err(_) if self.cancel.is_cancelled() => return CompilerOutcome::Interrupted,
            Err(err) => {
                return CompilerOutcome::ParseError(format!("failed to wait on compiler: {err}"))
            }
        };

        if self.cancel.is_cancelled() {
            return CompilerOutcome::Interrupted;
        }

        if exit_status.success() {
            return CompilerOutcome::Success { artifact_path };
        }

        let stderr = read_remaining_stderr(&self.child);
        match serde_json::from_str::<CompilerReport>(&stderr) {
            Ok(report) => CompilerOutcome::CompilerError(report),
            Err(_) => CompilerOutcome::ParseError(stderr),
        }
    }
}

fn read_remaining_stderr(child: &Arc<Mutex<Child>>) -> String {
    use std::io::Read;

    let mut buf = String::new();
    if let Ok(mut child) = child.lock() {
        if let Some(stderr) = child.stderr.as_mut() {
            let _ = stderr.read_to_string(&mut buf);
        }
    }
    buf
}
