//! Chooses which targets may advance at any given moment (§4.3).
//!
//! Grounded on the teacher's `run_tasks_parallel` (`engine/runner.rs`): a
//! single control loop that reacts to external events and decides what to
//! spawn next. We keep that "one loop, react to events, decide admissions"
//! shape but replace the dependency-counted DAG ready-queue with a flat
//! per-target policy, since targets here don't depend on each other — only
//! on their manifest group's build lock (policy 5).

use std::collections::HashSet;
use std::time::Instant;

use camino::Utf8Path;

use crate::output_state::OutputStatus;
use crate::project::Project;

/// A target admitted to start a compiler invocation this tick, plus whether
/// it should run in typecheck-only mode (policy 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub target_name: String,
    pub typecheck_only: bool,
}

/// Targets currently subscribed to by at least one browser session, used by
/// policy 2 (session-having targets preferred) and policy 3 (typecheck-only
/// for the rest).
pub struct SchedulerInputs<'a> {
    pub project: &'a Project,
    pub max_parallel: usize,
    pub sessions_by_target: &'a HashSet<String>,
}

/// Pure decision function: given the current project state, returns the
/// targets to admit into `Building`/`TypecheckOnly` this tick. Does not
/// mutate anything — callers transition the returned targets' `OutputState`
/// and kick off the actual compiler invocation.
pub fn schedule(inputs: &SchedulerInputs<'_>) -> Vec<Admission> {
    // Policy 1: count in-flight compiler invocations (Building or
    // TypecheckOnly; Postprocessing does not count, policy 4).
    let in_flight = inputs
        .project
        .groups
        .iter()
        .flat_map(|(_, outputs)| outputs.iter())
        .filter(|(_, state)| {
            matches!(
                state.status,
                OutputStatus::Building { .. } | OutputStatus::TypecheckOnly { .. }
            )
        })
        .count();

    if in_flight >= inputs.max_parallel {
        return Vec::new();
    }

    let mut available_slots = inputs.max_parallel - in_flight;
    let mut admissions = Vec::new();

    // Policy 5: at most one active build per manifest group unless idle
    // capacity remains. `active_groups` starts from groups already building
    // and grows as we admit candidates below.
    let mut active_groups: HashSet<&Utf8Path> = inputs
        .project
        .groups
        .iter()
        .filter(|(_, outputs)| {
            outputs.iter().any(|(_, state)| {
                matches!(
                    state.status,
                    OutputStatus::Building { .. } | OutputStatus::TypecheckOnly { .. }
                )
            })
        })
        .map(|(manifest, _)| manifest.as_path())
        .collect();

    // Policy 2: among QueuedForBuild targets, those with an active session
    // are preferred, tie-broken by enqueue timestamp (FIFO).
    let mut candidates: Vec<(&str, &Utf8Path, Instant, bool)> = inputs
        .project
        .groups
        .iter()
        .flat_map(|(manifest, outputs)| {
            outputs
                .iter()
                .map(move |(_, state)| (manifest.as_path(), state))
        })
        .filter_map(|(manifest, state)| match state.status {
            OutputStatus::QueuedForBuild { start_timestamp } => {
                let has_session = inputs.sessions_by_target.contains(&state.name);
                Some((state.name.as_str(), manifest, start_timestamp, has_session))
            }
            _ => None,
        })
        .collect();

    candidates.sort_by(|a, b| {
        // has_session descending (true before false), then FIFO ascending.
        b.3.cmp(&a.3).then(a.2.cmp(&b.2))
    });

    // Groups with queued work that have no active build yet: reserving one
    // slot per such group is what "unless idle capacity remains" protects
    // against starving in policy 5.
    let mut idle_groups: HashSet<&Utf8Path> = candidates
        .iter()
        .map(|(_, manifest, _, _)| *manifest)
        .filter(|manifest| !active_groups.contains(manifest))
        .collect();

    for (name, manifest, _, has_session) in candidates {
        if available_slots == 0 {
            break;
        }

        let group_busy = active_groups.contains(manifest);
        if group_busy {
            let reserved_for_idle_groups = idle_groups.len();
            if available_slots <= reserved_for_idle_groups {
                continue;
            }
        }

        admissions.push(Admission {
            target_name: name.to_string(),
            // Policy 3: no active session -> typecheck-only.
            typecheck_only: !has_session,
        });
        active_groups.insert(manifest);
        idle_groups.remove(manifest);
        available_slots -= 1;
    }

    admissions
}
