//! Single supervisor message loop (§5): one OS thread owns the [`Project`],
//! the [`SessionTable`], and the [`PostprocessPool`], so none of their
//! mutations need synchronization. Every other subsystem — the watcher, the
//! websocket server, compiler/post-process waiter threads — only ever talks
//! to this loop through [`SupervisorMessage`]s.
//!
//! Grounded on the teacher's `engine/runner.rs` control loop: react to one
//! event at a time, then re-run admission. We generalize it from a one-shot
//! task-DAG drain to a long-running loop that never terminates on its own
//! (it exits only on `ConfigChanged`, bubbling a restart request to
//! `main.rs`, or on the process being asked to exit).

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};

use crate::compiler::{self, CompilerOutcome, RunningInvocation};
use crate::config::{compiler_binary_from_env, postprocess_runtime_from_env, Preferences};
use crate::error::{InjectError, PostprocessError, WriteReason};
use crate::injector::Injector;
use crate::output_state::{CancelToken, DurationSpan, DurationTag, OutputStatus};
use crate::postprocess::{PostprocessOutcome, PostprocessPool, PostprocessRequest};
use crate::project::{self, Project, SOURCE_SUFFIX};
use crate::scheduler::{self, SchedulerInputs};
use crate::server::{ArtifactSnapshot, ServerEvent};
use crate::session::{self, ArtifactSignature, ReloadContext, ServerMessage, SessionTable, StatusUpdate};
use crate::watcher::{DirtySignal, EventClassifier};

/// The aggregated event type every producer thread (watcher, server,
/// compiler/postprocess waiters, the idle-eviction ticker) sends into the
/// supervisor's single channel.
pub enum SupervisorMessage {
    Dirty(Vec<Utf8PathBuf>),
    Server(ServerEvent),
    CompilerDone {
        target: String,
        outcome: CompilerOutcome,
    },
    PostprocessDone {
        target: String,
        outcome: PostprocessOutcome,
    },
    EvictTick,
}

/// Returned by [`Supervisor::run`] so `main.rs` knows whether to re-resolve
/// the project and start over (§4.4 "config changed: abort and re-resolve")
/// or exit the process.
pub enum SupervisorExit {
    Restart,
    Shutdown,
}

/// Everything the running loop needs beyond the channel it reads from.
pub struct Supervisor {
    project: Project,
    config_path: Utf8PathBuf,
    server_version: String,
    compiler_binary: String,
    postprocess_runtime: String,
    sender: Sender<SupervisorMessage>,
    sessions: SessionTable,
    outboxes: HashMap<u64, tokio::sync::mpsc::UnboundedSender<ServerMessage>>,
    postprocess: PostprocessPool,
    postprocess_worker_of: HashMap<String, usize>,
    running_invocations: HashMap<String, RunningInvocation>,
    artifacts: HashMap<String, Vec<u8>>,
    artifact_snapshot: ArtifactSnapshot,
    signatures: HashMap<String, ArtifactSignature>,
    /// Epoch for turning `Instant`s into the monotonically increasing
    /// millisecond counter §4.7's `compiledAt` staleness comparison needs.
    started_at: Instant,
}

impl Supervisor {
    pub fn new(
        project: Project,
        config_path: Utf8PathBuf,
        server_version: String,
        sender: Sender<SupervisorMessage>,
        postprocess: PostprocessPool,
        artifact_snapshot: ArtifactSnapshot,
    ) -> Self {
        Self {
            project,
            config_path,
            server_version,
            compiler_binary: compiler_binary_from_env(),
            postprocess_runtime: postprocess_runtime_from_env(),
            sender,
            sessions: SessionTable::new(),
            outboxes: HashMap::new(),
            postprocess,
            postprocess_worker_of: HashMap::new(),
            running_invocations: HashMap::new(),
            artifacts: HashMap::new(),
            artifact_snapshot,
            signatures: HashMap::new(),
            started_at: Instant::now(),
        }
    }

    /// Drains `receiver` until a restart or shutdown is requested. Admission
    /// (`scheduler::schedule`) re-runs after every message, since any of them
    /// can change which targets are eligible to build (§4.3).
    pub fn run(mut self, receiver: Receiver<SupervisorMessage>) -> SupervisorExit {
        self.queue_all_outputs();
        self.admit_and_start_builds();

        for message in receiver.iter() {
            match message {
                SupervisorMessage::Dirty(paths) => {
                    if self.handle_dirty(&paths) {
                        return SupervisorExit::Restart;
                    }
                }
                SupervisorMessage::Server(event) => self.handle_server_event(event),
                SupervisorMessage::CompilerDone { target, outcome } => {
                    self.handle_compiler_done(&target, outcome)
                }
                SupervisorMessage::PostprocessDone { target, outcome } => {
                    self.handle_postprocess_done(&target, outcome)
                }
                SupervisorMessage::EvictTick => {
                    let evicted = self.postprocess.evict_idle();
                    if evicted > 0 {
                        tracing::info!(evicted, "terminated superfluous post-process worker(s)");
                    }
                }
            }
            self.admit_and_start_builds();
        }

        SupervisorExit::Shutdown
    }

    /// Every freshly resolved target starts in `NotWrittenToDisk`, which the
    /// scheduler never admits (§4.3 only considers `QueuedForBuild`); this is
    /// what actually kicks off each target's very first build (§4.4 "initial
    /// build"), mirroring what `mark_dirty` does for every subsequent edit.
    fn queue_all_outputs(&mut self) {
        let now = Instant::now();
        for state in self.project.all_outputs_mut() {
            state.mark_dirty(now);
        }
    }

    /// Classifies each raw path and applies its effect. Returns `true` if a
    /// config change was seen, signalling the caller to abort this run.
    fn handle_dirty(&mut self, paths: &[Utf8PathBuf]) -> bool {
        let manifests: Vec<Utf8PathBuf> = self
            .project
            .groups
            .iter()
            .map(|(manifest, _)| manifest.clone())
            .collect();

        for path in paths {
            let outputs_related = |candidate: &Utf8Path| {
                self.project
                    .all_outputs()
                    .any(|state| state.is_source_related(candidate))
            };
            let classifier = EventClassifier {
                config_path: &self.config_path,
                manifests: &manifests,
                related_source_paths: &outputs_related,
                source_suffix: SOURCE_SUFFIX,
            };

            match classifier.classify(path) {
                DirtySignal::ConfigChanged => {
                    tracing::info!("watch configuration changed, restarting");
                    return true;
                }
                DirtySignal::ManifestChanged { manifest } => {
                    let names: Vec<String> = self
                        .project
                        .outputs_in_group(&manifest)
                        .map(|state| state.name.clone())
                        .collect();
                    for name in names {
                        self.mark_target_dirty(&name);
                    }
                }
                DirtySignal::SourceChanged { path } => {
                    let names: Vec<String> = self
                        .project
                        .all_outputs()
                        .filter(|state| state.is_source_related(&path))
                        .map(|state| state.name.clone())
                        .collect();
                    for name in names {
                        self.mark_target_dirty(&name);
                    }
                }
                DirtySignal::Unwatched { path } => {
                    tracing::debug!(%path, "change not imported by any enabled target");
                }
            }
        }

        false
    }

    /// §4.2: cancels whatever in-flight compiler/post-process work is
    /// running for `name`, actually terminating the subprocess (not just
    /// flipping the cooperative flag), then re-queues.
    fn mark_target_dirty(&mut self, name: &str) {
        if let Some(invocation) = self.running_invocations.remove(name) {
            invocation.kill();
        }
        if let Some(worker_index) = self.postprocess_worker_of.remove(name) {
            self.postprocess.kill_worker(worker_index);
        }
        if let Some(state) = self.project.find_output_mut(name) {
            state.mark_dirty(Instant::now());
        }
    }

    fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected {
                session_id,
                params,
                outbox,
            } => {
                if let Err(error) =
                    session::validate_connect(&params, &self.project, &self.server_version)
                {
                    let _ = outbox.send(ServerMessage::Status(StatusUpdate::UnexpectedError {
                        message: error.to_string(),
                    }));
                    return;
                }

                self.sessions.connect(session_id, params.target_name.clone());
                self.outboxes.insert(session_id, outbox.clone());

                let initial = match self.project.find_output(&params.target_name) {
                    Some(state) => match &state.status {
                        OutputStatus::Success { compiled_at, .. } => {
                            let current_compiled_at = self.millis_since_start(*compiled_at);
                            if session::needs_redelivery(params.compiled_at, current_compiled_at) {
                                self.artifact_message_for(&params.target_name, current_compiled_at)
                            } else {
                                ServerMessage::Status(StatusUpdate::SuccessfullyCompiled)
                            }
                        }
                        status if status.is_error_leaf() => {
                            ServerMessage::Status(StatusUpdate::CompilationError {
                                message: status.label().to_string(),
                            })
                        }
                        _ => ServerMessage::Status(StatusUpdate::WaitingForCompilation),
                    },
                    None => session::target_disabled_reload(),
                };
                let _ = outbox.send(initial);
            }
            ServerEvent::ClientMessage { session_id, message } => {
                self.handle_client_message(session_id, message)
            }
            ServerEvent::Disconnected { session_id } => {
                self.sessions.disconnect(session_id);
                self.outboxes.remove(&session_id);
            }
            ServerEvent::HandshakeRejected { error } => {
                tracing::warn!(%error, "rejected websocket handshake");
            }
        }
    }

    fn handle_client_message(&mut self, session_id: u64, message: session::ClientMessage) {
        let Some(target_name) = self.sessions.target_of(session_id).map(str::to_string) else {
            return;
        };

        match message {
            session::ClientMessage::ChangedCompilationMode { mode } => {
                if let Some(state) = self.project.find_output_mut(&target_name) {
                    state.compilation_mode = mode;
                }
                self.persist_compilation_mode(&target_name, mode);
                self.mark_target_dirty(&target_name);
            }
            session::ClientMessage::FocusedTab => {
                // Session-preference is read live from `SessionTable` by the
                // scheduler (policy 2); nothing to record here.
            }
            session::ClientMessage::ExitRequested => {
                self.sessions.disconnect(session_id);
                self.outboxes.remove(&session_id);
            }
            session::ClientMessage::HotReloadFailed { error } => {
                if let Some(state) = self.project.find_output_mut(&target_name) {
                    state.last_patch_failed = true;
                }
                self.broadcast(
                    &target_name,
                    ServerMessage::FullReload {
                        reason: session::ReloadReason::HotReloadFailed { error },
                    },
                );
            }
        }
    }

    /// §6.2: persists the just-changed compilation mode under the target's
    /// manifest directory, merging it into whatever preferences are already
    /// on disk there rather than clobbering other targets' saved modes.
    fn persist_compilation_mode(&self, target_name: &str, mode: crate::config::CompilationMode) {
        let Some(manifest) = self.project.manifest_of(target_name) else {
            return;
        };
        let manifest_dir = manifest.parent().unwrap_or(manifest);
        let mut preferences = Preferences::load(manifest_dir);
        preferences
            .targets
            .entry(target_name.to_string())
            .or_default()
            .compilation_mode = Some(mode);
        if let Err(err) = preferences.save(manifest_dir) {
            tracing::warn!(target = target_name, %err, "failed to persist compilation mode preference");
        }
    }

    fn handle_compiler_done(&mut self, target: &str, outcome: CompilerOutcome) {
        let Some(state) = self.project.find_output_mut(target) else {
            return;
        };

        // A later dirty signal may have already requeued this target (and
        // possibly started a fresh invocation under the same key) while the
        // waiter thread was still blocked on `wait()`; that newer state must
        // not be clobbered by this stale outcome, and `running_invocations`
        // must not be cleared out from under the fresh invocation.
        if !matches!(
            state.status,
            OutputStatus::Building { .. } | OutputStatus::TypecheckOnly { .. }
        ) {
            return;
        }
        self.running_invocations.remove(target);

        let durations = match &state.status {
            OutputStatus::Building { durations, .. } => durations.clone(),
            OutputStatus::TypecheckOnly { durations, .. } => durations.clone(),
            _ => unreachable!("checked above"),
        };
        let compilation_mode = state.compilation_mode;

        match outcome {
            CompilerOutcome::Success { artifact_path } => {
                let write_reason = if self.artifacts.contains_key(target) {
                    WriteReason::Overwrite
                } else {
                    WriteReason::FirstWrite
                };
                let injector = Injector::new();
                match injector.inject(&artifact_path, write_reason) {
                    Ok(()) => self.finish_build(target, &artifact_path, compilation_mode, durations),
                    Err(InjectError::ReadFailed { message }) => {
                        if let Some(state) = self.project.find_output_mut(target) {
                            state.status = OutputStatus::ReadOutputError(message);
                        }
                    }
                    Err(InjectError::WriteFailed { reason, message }) => {
                        if let Some(state) = self.project.find_output_mut(target) {
                            state.status = OutputStatus::WriteOutputError { reason, message };
                        }
                    }
                    Err(error @ InjectError::SearchAndReplaceNotFound { .. }) => {
                        if let Some(state) = self.project.find_output_mut(target) {
                            state.status = OutputStatus::InjectError(error);
                        }
                    }
                }
            }
            CompilerOutcome::CompilerError(report) => {
                let message = report
                    .errors
                    .first()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "compilation failed".to_string());
                if let Some(state) = self.project.find_output_mut(target) {
                    state.status = OutputStatus::CompilerError(message.clone());
                }
                self.broadcast(target, ServerMessage::Status(StatusUpdate::CompilationError { message }));
            }
            CompilerOutcome::ParseError(raw) => {
                if let Some(state) = self.project.find_output_mut(target) {
                    state.status = OutputStatus::ParseError(raw.clone());
                }
                self.broadcast(
                    target,
                    ServerMessage::Status(StatusUpdate::UnexpectedError { message: raw }),
                );
            }
            CompilerOutcome::Interrupted => {
                // `mark_dirty` already moved this target back to
                // `QueuedForBuild`; nothing further to do.
            }
        }
    }

    /// After a successful inject, either hands the artifact to the
    /// post-process pool (policy 4: postprocess scheduling is unbounded,
    /// separate from the build-parallelism fence) or marks `Success`
    /// directly.
    fn finish_build(
        &mut self,
        target: &str,
        artifact_path: &Utf8Path,
        mode: crate::config::CompilationMode,
        mut durations: Vec<DurationSpan>,
    ) {
        let bytes = match std::fs::read(artifact_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                if let Some(state) = self.project.find_output_mut(target) {
                    state.status = OutputStatus::ReadOutputError(err.to_string());
                }
                return;
            }
        };

        if !self.walk_sources_for(target, &mut durations) {
            return;
        }

        if let Some(postprocess) = self.project.postprocess.clone() {
            let record_fields = self
                .project
                .find_output(target)
                .and_then(|s| s.record_fields.clone());
            if let Some(state) = self.project.find_output_mut(target) {
                state.status = OutputStatus::QueuedForPostprocess {
                    argv: postprocess.argv.clone(),
                    payload: bytes.clone(),
                    compiled_at: Instant::now(),
                    record_fields,
                    durations: durations.clone(),
                };
            }
            self.submit_postprocess(target, postprocess.argv, bytes, durations);
            return;
        }

        durations.push(DurationSpan {
            tag: DurationTag::Inject,
            elapsed: std::time::Duration::ZERO,
        });
        let artifact_size = bytes.len() as u64;
        self.deliver_success(target, bytes, mode, artifact_size, durations);
    }

    /// §4.2's `SourceWalk` span: after a fresh artifact lands, re-derives the
    /// target's `allRelatedSourcePaths` by following its entry points'
    /// imports, so the next edit to any of those files actually reaches
    /// `is_source_related` (§4.4) instead of being classified `Unwatched`.
    /// Returns `false` (having already set `WalkSourcesError`) on failure, so
    /// the caller can bail out of the rest of the delivery pipeline.
    fn walk_sources_for(&mut self, target: &str, durations: &mut Vec<DurationSpan>) -> bool {
        let Some(manifest) = self.project.manifest_of(target).map(|p| p.to_path_buf()) else {
            return false;
        };
        let entry_points: Vec<Utf8PathBuf> = self
            .project
            .find_output(target)
            .map(|state| {
                state
                    .inputs
                    .iter()
                    .map(|input| input.configured.as_path().to_path_buf())
                    .collect()
            })
            .unwrap_or_default();

        let start = Instant::now();
        match project::walk_sources(&manifest, &entry_points) {
            Ok(related) => {
                durations.push(DurationSpan {
                    tag: DurationTag::SourceWalk,
                    elapsed: start.elapsed(),
                });
                if let Some(state) = self.project.find_output_mut(target) {
                    state.all_related_source_paths = related;
                }
                true
            }
            Err(message) => {
                if let Some(state) = self.project.find_output_mut(target) {
                    state.status = OutputStatus::WalkSourcesError(message);
                }
                false
            }
        }
    }

    fn submit_postprocess(
        &mut self,
        target: &str,
        argv: Vec<String>,
        payload: Vec<u8>,
        durations: Vec<DurationSpan>,
    ) {
        if let Some(state) = self.project.find_output_mut(target) {
            let cancel = CancelToken::new();
            state.status = OutputStatus::Postprocessing {
                cancel,
                durations: durations.clone(),
            };
        }

        let Some((script_path, script_argv)) = argv.split_first() else {
            if let Some(state) = self.project.find_output_mut(target) {
                state.status =
                    OutputStatus::PostprocessError(PostprocessError::MissingScript(Utf8PathBuf::new()));
            }
            return;
        };

        let submitted = self.postprocess.submit(PostprocessRequest {
            runtime: self.postprocess_runtime.clone(),
            script_path: Utf8PathBuf::from(script_path.as_str()),
            argv: script_argv.to_vec(),
            payload,
        });
        self.postprocess_worker_of
            .insert(target.to_string(), submitted.worker_index);

        let target = target.to_string();
        let sender = self.sender.clone();
        std::thread::spawn(move || {
            let outcome = submitted
                .receiver
                .recv()
                .unwrap_or(Err(PostprocessError::Interrupted));
            let _ = sender.send(SupervisorMessage::PostprocessDone { target, outcome });
        });
    }

    fn handle_postprocess_done(&mut self, target: &str, outcome: PostprocessOutcome) {
        self.postprocess_worker_of.remove(target);

        let Some(state) = self.project.find_output_mut(target) else {
            return;
        };
        let (durations, mode) = match &state.status {
            OutputStatus::Postprocessing { durations, .. } => {
                (durations.clone(), state.compilation_mode)
            }
            _ => return, // superseded by a newer dirty signal
        };

        match outcome {
            Ok(bytes) => {
                let artifact_size = bytes.len() as u64;
                self.deliver_success(target, bytes, mode, artifact_size, durations);
            }
            Err(error) => {
                if let Some(state) = self.project.find_output_mut(target) {
                    state.status = OutputStatus::PostprocessError(error);
                }
            }
        }
    }

    fn deliver_success(
        &mut self,
        target: &str,
        bytes: Vec<u8>,
        mode: crate::config::CompilationMode,
        artifact_size: u64,
        durations: Vec<DurationSpan>,
    ) {
        let now = Instant::now();
        let final_size = bytes.len() as u64;
        let signature = session::derive_signature(&bytes, mode);
        let previous = self.signatures.insert(target.to_string(), signature.clone());

        if let Some(state) = self.project.find_output_mut(target) {
            state.status = OutputStatus::Success {
                artifact_size,
                final_size,
                compiled_at: now,
                durations,
            };
            state.record_fields = signature.record_fields.clone();
        }

        let compiled_at = self.millis_since_start(now);
        self.artifacts.insert(target.to_string(), bytes.clone());
        self.artifact_snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(target.to_string(), bytes);

        if let Some(previous) = previous {
            // A browser-reported hot-patch failure (§4.7 step 6) is the only
            // real signal available for step 1: it means the flags decoder
            // the previous artifact shipped just proved unable to decode a
            // value the running page handed it, so this build's reload
            // verdict should not treat the flags type as unchanged. Cleared
            // immediately so it only affects the very next delivery.
            let previous_flags_still_decode = match self.project.find_output_mut(target) {
                Some(state) => {
                    let failed = state.last_patch_failed;
                    state.last_patch_failed = false;
                    !failed
                }
                None => true,
            };
            let ctx = ReloadContext {
                previous_flags_still_decode,
                mode,
            };
            let (reload, added_ports) = session::reload_verdict(&previous, &signature, &ctx);
            if let Some(reason) = reload {
                self.broadcast(target, ServerMessage::FullReload { reason });
            } else {
                self.broadcast(target, self.artifact_message_for(target, compiled_at));
                if !added_ports.is_empty() {
                    self.broadcast(target, ServerMessage::PortsAdded { names: added_ports });
                }
            }
        } else {
            self.broadcast(target, self.artifact_message_for(target, compiled_at));
        }
    }

    fn artifact_message_for(&self, target: &str, compiled_at: u64) -> ServerMessage {
        let bytes = self.artifacts.get(target).cloned().unwrap_or_default();
        let record_fields = self.project.find_output(target).and_then(|s| s.record_fields.clone());
        ServerMessage::Artifact(session::ArtifactDelivery {
            bytes,
            compiled_at,
            record_fields,
        })
    }

    fn broadcast(&self, target: &str, message: ServerMessage) {
        for session_id in self.sessions.sessions_for(target) {
            if let Some(outbox) = self.outboxes.get(&session_id) {
                let _ = outbox.send(message.clone());
            }
        }
    }

    /// Runs `scheduler::schedule`, then transitions and spawns a waiter
    /// thread for every admitted target (§4.3, §5).
    fn admit_and_start_builds(&mut self) {
        let sessions_by_target = self.sessions.targets_with_sessions();
        let inputs = SchedulerInputs {
            project: &self.project,
            max_parallel: self.project.max_parallel,
            sessions_by_target: &sessions_by_target,
        };
        let admissions = scheduler::schedule(&inputs);

        for admission in admissions {
            self.start_build(&admission.target_name, admission.typecheck_only);
        }
    }

    fn start_build(&mut self, target: &str, typecheck_only: bool) {
        let Some(manifest) = self.project.manifest_of(target).map(|p| p.to_path_buf()) else {
            return;
        };
        let Some(output_path) = self.project.output_path_of(target).map(|p| p.to_path_buf()) else {
            return;
        };
        let Some(state) = self.project.find_output(target) else {
            return;
        };

        let entry_points: Vec<Utf8PathBuf> = state
            .inputs
            .iter()
            .map(|input| input.configured.as_path().to_path_buf())
            .collect();
        let mode = state.compilation_mode;
        let manifest_dir = manifest
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| manifest.clone());

        let argv = compiler::build_argv(&manifest_dir, &entry_points, &output_path, mode, typecheck_only);
        let cancel = CancelToken::new();

        if let Some(state) = self.project.find_output_mut(target) {
            state.status = if typecheck_only {
                OutputStatus::TypecheckOnly {
                    durations: vec![],
                    cancel: cancel.clone(),
                }
            } else {
                OutputStatus::Building {
                    mode,
                    durations: vec![],
                    cancel: cancel.clone(),
                }
            };
        }

        let invocation =
            match RunningInvocation::spawn(&self.compiler_binary, &argv, &manifest_dir, cancel) {
                Ok(invocation) => invocation,
                Err(err) => {
                    if let Some(state) = self.project.find_output_mut(target) {
                        state.status = OutputStatus::CompilerError(err.to_string());
                    }
                    return;
                }
            };

        self.running_invocations
            .insert(target.to_string(), invocation.clone());

        let target_owned = target.to_string();
        let sender = self.sender.clone();
        std::thread::spawn(move || {
            let outcome = invocation.wait(output_path);
            let _ = sender.send(SupervisorMessage::CompilerDone {
                target: target_owned,
                outcome,
            });
        });
    }

    /// §4.7's `compiledAt` only needs to compare for relative staleness
    /// between values this process itself produced, so milliseconds since
    /// this supervisor started serves the same purpose a wall-clock
    /// timestamp would, without depending on system time.
    fn millis_since_start(&self, instant: Instant) -> u64 {
        instant.duration_since(self.started_at).as_millis() as u64
    }
}

/// Scenario-level integration tests (§8): drive the real supervisor loop's
/// message handlers directly against a synthetic compiler shell script and a
/// real (but tiny) project on disk. Living in this nested module rather than
/// driving `Supervisor::run` lets each test single-step one message at a
/// time, and lets it reach `compiler_binary`/`postprocess_runtime`, which are
/// private to `Supervisor`'s defining module.
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::config::{CompilationMode, TargetConfig, WatchConfig};
    use crate::project::ProjectResolver;
    use crate::server::ArtifactSnapshot;
    use crate::session::ReloadReason;

    #[cfg(unix)]
    fn chmod_exec(path: &Utf8Path) {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }

    /// Writes `--output=X` wherever it appears in argv, matching what the
    /// real compiler binary does for a successful build (§4.1 "Compiler
    /// driver"). Content varies by invocation count (via a counter file next
    /// to the script) so a second build against the same target produces a
    /// genuinely different artifact hash, the same way a real edit would.
    #[cfg(unix)]
    fn compiler_stub_success(dir: &Utf8Path) -> Utf8PathBuf {
        let path = dir.join("compiler_ok.sh");
        std::fs::write(
            &path,
            "#!/bin/sh\n\
             counter_file=\"$(dirname \"$0\")/.build_count\"\n\
             count=0\n\
             if [ -f \"$counter_file\" ]; then count=$(cat \"$counter_file\"); fi\n\
             count=$((count + 1))\n\
             echo \"$count\" > \"$counter_file\"\n\
             for arg in \"$@\"; do\n\
             \x20 case \"$arg\" in\n\
             \x20   --output=*)\n\
             \x20     out=\"${arg#--output=}\"\n\
             \x20     mkdir -p \"$(dirname \"$out\")\"\n\
             \x20     echo \"console.log($count)\" > \"$out\"\n\
             \x20     ;;\n\
             \x20 esac\n\
             done\n\
             exit 0\n",
        )
        .unwrap();
        chmod_exec(&path);
        path
    }

    /// Exits non-zero with a JSON error report on stderr, matching the
    /// compiler's own `--report=json` failure shape (§4.1 table).
    #[cfg(unix)]
    fn compiler_stub_error(dir: &Utf8Path) -> Utf8PathBuf {
        let path = dir.join("compiler_err.sh");
        std::fs::write(
            &path,
            "#!/bin/sh\necho '{\"errors\":[{\"title\":\"Oops\",\"message\":\"boom\"}]}' 1>&2\nexit 1\n",
        )
        .unwrap();
        chmod_exec(&path);
        path
    }

    fn single_target_project(root: &Utf8Path) -> Project {
        std::fs::write(root.join("elm.json"), "{}").unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/Main.elm"), "module Main exposing (main)\n").unwrap();

        let mut targets = BTreeMap::new();
        targets.insert(
            "Main".to_string(),
            TargetConfig {
                inputs: vec!["src/Main.elm".to_string()],
                output: "build/main.js".to_string(),
            },
        );
        let config = WatchConfig {
            targets,
            postprocess: None,
        };
        ProjectResolver::new(&config, root, &[]).resolve().unwrap()
    }

    fn new_test_supervisor(project: Project, root: &Utf8Path) -> (Supervisor, Receiver<SupervisorMessage>, ArtifactSnapshot) {
        let (sender, receiver) = std::sync::mpsc::channel();
        let postprocess = PostprocessPool::new(1, Duration::from_secs(10));
        let artifact_snapshot: ArtifactSnapshot = Arc::new(Mutex::new(HashMap::new()));
        let supervisor = Supervisor::new(
            project,
            root.join("hot.config.json"),
            "test".to_string(),
            sender,
            postprocess,
            artifact_snapshot.clone(),
        );
        (supervisor, receiver, artifact_snapshot)
    }

    #[test]
    #[cfg(unix)]
    fn successful_build_populates_source_paths_and_redirties_on_edit() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let project = single_target_project(root);
        let compiler = compiler_stub_success(root);

        let (mut supervisor, receiver, artifact_snapshot) = new_test_supervisor(project, root);
        supervisor.compiler_binary = compiler.to_string();
        // A real build (rather than typecheck-only, policy 3) requires at
        // least one session subscribed to the target.
        supervisor.sessions.connect(1, "Main".to_string());

        supervisor.queue_all_outputs();
        supervisor.admit_and_start_builds();

        let message = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        match message {
            SupervisorMessage::CompilerDone { target, outcome } => {
                supervisor.handle_compiler_done(&target, outcome)
            }
            _ => panic!("expected CompilerDone"),
        }

        let state = supervisor.project.find_output("Main").unwrap();
        assert!(matches!(state.status, OutputStatus::Success { .. }));
        let entry = root.join("src/Main.elm");
        assert!(state.all_related_source_paths.contains(&entry));
        assert!(artifact_snapshot.lock().unwrap().contains_key("Main"));

        // Regression test for the bug this field's wiring fixed: before
        // `all_related_source_paths` was ever populated, `is_source_related`
        // was always false and an edit to the target's own entry point never
        // re-dirtied it.
        let config_changed = supervisor.handle_dirty(&[entry]);
        assert!(!config_changed);
        let state = supervisor.project.find_output("Main").unwrap();
        assert!(matches!(state.status, OutputStatus::QueuedForBuild { .. }));
    }

    #[test]
    #[cfg(unix)]
    fn compiler_error_sets_status_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let project = single_target_project(root);
        let compiler = compiler_stub_error(root);

        let (mut supervisor, receiver, _snapshot) = new_test_supervisor(project, root);
        supervisor.compiler_binary = compiler.to_string();
        let (outbox_tx, mut outbox_rx) = tokio::sync::mpsc::unbounded_channel();
        supervisor.sessions.connect(1, "Main".to_string());
        supervisor.outboxes.insert(1, outbox_tx);

        supervisor.queue_all_outputs();
        supervisor.admit_and_start_builds();

        let message = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        match message {
            SupervisorMessage::CompilerDone { target, outcome } => {
                supervisor.handle_compiler_done(&target, outcome)
            }
            _ => panic!("expected CompilerDone"),
        }

        let state = supervisor.project.find_output("Main").unwrap();
        match &state.status {
            OutputStatus::CompilerError(message) => assert_eq!(message, "boom"),
            other => panic!("expected CompilerError, got {other:?}"),
        }

        match outbox_rx.try_recv().unwrap() {
            ServerMessage::Status(StatusUpdate::CompilationError { message }) => {
                assert_eq!(message, "boom")
            }
            other => panic!("expected CompilationError status, got {other:?}"),
        }
    }

    #[test]
    fn hot_reload_failed_sets_flag_and_broadcasts_full_reload() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let project = single_target_project(root);
        let (mut supervisor, _receiver, _snapshot) = new_test_supervisor(project, root);

        let (outbox_tx, mut outbox_rx) = tokio::sync::mpsc::unbounded_channel();
        supervisor.sessions.connect(1, "Main".to_string());
        supervisor.outboxes.insert(1, outbox_tx);

        supervisor.handle_client_message(
            1,
            session::ClientMessage::HotReloadFailed {
                error: "TypeError: boom".to_string(),
            },
        );

        let state = supervisor.project.find_output("Main").unwrap();
        assert!(state.last_patch_failed);

        match outbox_rx.try_recv().unwrap() {
            ServerMessage::FullReload {
                reason: ReloadReason::HotReloadFailed { error },
            } => assert_eq!(error, "TypeError: boom"),
            other => panic!("expected FullReload/HotReloadFailed, got {other:?}"),
        }
    }

    #[test]
    #[cfg(unix)]
    fn flags_type_changed_reachable_after_hot_reload_failure() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let project = single_target_project(root);
        let compiler = compiler_stub_success(root);

        let (mut supervisor, receiver, _snapshot) = new_test_supervisor(project, root);
        supervisor.compiler_binary = compiler.to_string();
        // A real build (rather than typecheck-only, policy 3) requires at
        // least one session subscribed to the target.
        let (outbox_tx, mut outbox_rx) = tokio::sync::mpsc::unbounded_channel();
        supervisor.sessions.connect(1, "Main".to_string());
        supervisor.outboxes.insert(1, outbox_tx);

        // First build establishes a signature to compare the second against.
        supervisor.queue_all_outputs();
        supervisor.admit_and_start_builds();
        match receiver.recv_timeout(Duration::from_secs(5)).unwrap() {
            SupervisorMessage::CompilerDone { target, outcome } => {
                supervisor.handle_compiler_done(&target, outcome)
            }
            _ => panic!("expected CompilerDone"),
        }
        // Drain the first build's own artifact broadcast.
        outbox_rx.try_recv().unwrap();

        // The browser reports the previous artifact's hot-patch failed.
        supervisor.handle_client_message(
            1,
            session::ClientMessage::HotReloadFailed {
                error: "decode failure".to_string(),
            },
        );
        // Drain the `FullReload`/`HotReloadFailed` broadcast from that
        // message before looking for the next build's own broadcast.
        outbox_rx.try_recv().unwrap();

        // A second build's changed artifact bytes must now report
        // `FlagsTypeChanged` (step 1) rather than the later `InitChanged`
        // (step 5) verdict the same byte change would otherwise produce,
        // since `previous_flags_still_decode` was just driven false.
        supervisor.mark_target_dirty("Main");
        supervisor.admit_and_start_builds();
        match receiver.recv_timeout(Duration::from_secs(5)).unwrap() {
            SupervisorMessage::CompilerDone { target, outcome } => {
                supervisor.handle_compiler_done(&target, outcome)
            }
            _ => panic!("expected CompilerDone"),
        }

        let state = supervisor.project.find_output("Main").unwrap();
        assert!(matches!(state.status, OutputStatus::Success { .. }));
        assert!(!state.last_patch_failed, "flag must be cleared after being consulted");

        match outbox_rx.try_recv().unwrap() {
            ServerMessage::FullReload {
                reason: ReloadReason::FlagsTypeChanged,
            } => {}
            other => panic!("expected FullReload/FlagsTypeChanged, got {other:?}"),
        }
    }
}
