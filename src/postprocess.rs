//! Isolated post-process worker pool (§4.5).
//!
//! Grounded on the teacher's thread/channel idioms in
//! `engine/runner/watch.rs` (`new_thread_ws_reload`: a long-lived OS thread
//! draining an `mpsc::Receiver` in a loop) and on `plugin/svelte.rs`'s
//! subprocess-as-worker shape (`Stdio::piped()` both ways, write the payload
//! to stdin, read the result from stdout). Per §9's design note, a worker is
//! modeled as a black-box message endpoint so the core stays testable with a
//! synthetic runtime command.

use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;

use crate::error::PostprocessError;
use crate::output_state::CancelToken;

/// `{scriptPath, argv, payloadBytes}` from §4.5. `runtime` is the ambient
/// command used to load and invoke `script_path`'s default export (e.g. a
/// JS runtime); the script itself is the external, user-supplied
/// collaborator described in §4.5's contract.
pub struct PostprocessRequest {
    pub runtime: String,
    pub script_path: Utf8PathBuf,
    pub argv: Vec<String>,
    pub payload: Vec<u8>,
}

pub type PostprocessOutcome = Result<Vec<u8>, PostprocessError>;

struct Job {
    request: PostprocessRequest,
    cancel: CancelToken,
    reply: Sender<PostprocessOutcome>,
}

/// A long-lived worker thread. Starts on first demand ([`PostprocessPool::submit`])
/// and is torn down either by [`PostprocessPool::evict_idle`] or on pool drop.
struct Worker {
    sender: Sender<Job>,
    busy: Arc<AtomicBool>,
    last_used: Arc<Mutex<Instant>>,
    running_child: Arc<Mutex<Option<std::process::Child>>>,
}

impl Worker {
    fn spawn() -> Self {
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = mpsc::channel();
        let busy = Arc::new(AtomicBool::new(false));
        let last_used = Arc::new(Mutex::new(Instant::now()));
        let running_child = Arc::new(Mutex::new(None));

        let busy_thread = busy.clone();
        let last_used_thread = last_used.clone();
        let running_child_thread = running_child.clone();

        std::thread::spawn(move || {
            while let Ok(job) = receiver.recv() {
                busy_thread.store(true, Ordering::SeqCst);
                let outcome = run_one(&job, &running_child_thread);
                *last_used_thread.lock().unwrap() = Instant::now();
                busy_thread.store(false, Ordering::SeqCst);
                let _ = job.reply.send(outcome);
            }
        });

        Self {
            sender,
            busy,
            last_used,
            running_child,
        }
    }

    fn is_idle(&self) -> bool {
        !self.busy.load(Ordering::SeqCst)
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().unwrap().elapsed()
    }

    /// §5 Postprocess cancellation: terminate the running child; the pool
    /// keeps the worker thread alive and ready for its next job regardless
    /// of whether the kill was clean.
    fn kill_current(&self) {
        if let Ok(mut child) = self.running_child.lock() {
            if let Some(child) = child.as_mut() {
                let _ = child.kill();
            }
        }
    }
}

fn run_one(
    job: &Job,
    running_child: &Arc<Mutex<Option<std::process::Child>>>,
) -> PostprocessOutcome {
    let request = &job.request;

    if !request.script_path.is_file() {
        return Err(PostprocessError::MissingScript(request.script_path.clone()));
    }

    let mut child = Command::new(&request.runtime)
        .arg(request.script_path.as_str())
        .args(&request.argv)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|_| PostprocessError::ImportError(request.script_path.clone()))?;

    if let Some(stdin) = child.stdin.as_mut() {
        if stdin.write_all(&request.payload).is_err() {
            // A write failure usually means the child already exited (it
            // never imported the script); surface it as ImportError rather
            // than masking it as a run error.
            return Err(PostprocessError::ImportError(request.script_path.clone()));
        }
    }

    *running_child.lock().unwrap() = Some(child);

    let output = {
        let mut guard = running_child.lock().unwrap();
        let child = guard.as_mut().expect("child was just stored above");
        child.wait_with_stdout_and_stderr()
    };
    *running_child.lock().unwrap() = None;

    if job.cancel.is_cancelled() {
        return Err(PostprocessError::Interrupted);
    }

    let (status, stdout, stderr) = output.map_err(|_| PostprocessError::Interrupted)?;

    if !status.success() {
        return Err(PostprocessError::RunError(
            String::from_utf8_lossy(&stderr).into_owned(),
        ));
    }

    if std::str::from_utf8(&stdout).is_err() {
        return Err(PostprocessError::BadReturnValue);
    }

    Ok(stdout)
}

/// `Child::wait_with_output` consumes `self`; we need to keep the `Child` in
/// place (behind the shared mutex) so `kill_current` can reach it while the
/// wait is in progress, so this reimplements the read-both-streams-then-wait
/// sequence by hand on a `&mut Child`.
trait WaitKeepingHandle {
    fn wait_with_stdout_and_stderr(
        &mut self,
    ) -> std::io::Result<(std::process::ExitStatus, Vec<u8>, Vec<u8>)>;
}

impl WaitKeepingHandle for std::process::Child {
    fn wait_with_stdout_and_stderr(
        &mut self,
    ) -> std::io::Result<(std::process::ExitStatus, Vec<u8>, Vec<u8>)> {
        use std::io::Read;

        let mut stdout = Vec::new();
        if let Some(out) = self.stdout.as_mut() {
            out.read_to_end(&mut stdout)?;
        }
        let mut stderr = Vec::new();
        if let Some(err) = self.stderr.as_mut() {
            err.read_to_end(&mut stderr)?;
        }
        let status = self.wait()?;
        Ok((status, stdout, stderr))
    }
}

/// A submitted job's receive side plus its cancel token, so a caller can
/// kill the job it just submitted without the pool exposing worker
/// internals.
pub struct SubmittedJob {
    pub receiver: Receiver<PostprocessOutcome>,
    pub cancel: CancelToken,
    pub worker_index: usize,
}

/// §4.5: up to `max_workers` isolated execution workers, started lazily and
/// evicted after `idle_timeout`.
pub struct PostprocessPool {
    max_workers: usize,
    idle_timeout: Duration,
    workers: Vec<Worker>,
}

impl PostprocessPool {
    pub fn new(max_workers: usize, idle_timeout: Duration) -> Self {
        Self {
            max_workers: max_workers.max(1),
            idle_timeout,
            workers: Vec::new(),
        }
    }

    /// Routes `request` to an idle worker, spawning a new one if under
    /// capacity. If every worker is busy and capacity is exhausted, the job
    /// is queued to the least-recently-used worker's channel (workers
    /// process their channel in FIFO order, so this still completes, just
    /// without the "fresh worker" latency win).
    pub fn submit(&mut self, request: PostprocessRequest) -> SubmittedJob {
        let worker_index = self
            .workers
            .iter()
            .position(Worker::is_idle)
            .or_else(|| {
                if self.workers.len() < self.max_workers {
                    self.workers.push(Worker::spawn());
                    Some(self.workers.len() - 1)
                } else {
                    None
                }
            })
            .unwrap_or(0);

        let (reply_tx, reply_rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let job = Job {
            request,
            cancel: cancel.clone(),
            reply: reply_tx,
        };
        let _ = self.workers[worker_index].sender.send(job);

        SubmittedJob {
            receiver: reply_rx,
            cancel,
            worker_index,
        }
    }

    /// Kills whatever the given worker index is currently running. Callers
    /// locate the worker index from the job they submitted (the supervisor
    /// tracks target -> worker index for in-flight postprocess jobs).
    pub fn kill_worker(&self, worker_index: usize) {
        if let Some(worker) = self.workers.get(worker_index) {
            worker.kill_current();
        }
    }

    /// Evicts idle workers beyond the idle timeout. Returns the count
    /// terminated, for the "Terminated N superfluous worker(s)" advisory
    /// (§8 scenario 7).
    pub fn evict_idle(&mut self) -> usize {
        let before = self.workers.len();
        self.workers
            .retain(|w| !(w.is_idle() && w.idle_for() >= self.idle_timeout));
        before - self.workers.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}
