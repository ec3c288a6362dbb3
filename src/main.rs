//! Process entry point (§6.5): parse the CLI, resolve the project, and wire
//! the watcher/server/eviction-ticker threads into the supervisor's single
//! channel. Grounded on the teacher's own `docs/src/main.rs` shape (parse
//! args, init logging, delegate to the library), generalized from a one-shot
//! `Site::build`/`Site::watch` call into the supervisor's restart loop.

use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;

use hotelm::cli::Cli;
use hotelm::config::{resolve_port, worker_idle_timeout_from_env, Preferences, WatchConfig};
use hotelm::path_model::AbsolutePath;
use hotelm::postprocess::PostprocessPool;
use hotelm::project::ProjectResolver;
use hotelm::server;
use hotelm::supervisor::{Supervisor, SupervisorExit, SupervisorMessage};
use hotelm::watcher;
use hotelm::{config, logging};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
const EVICT_TICK_INTERVAL: Duration = Duration::from_secs(30);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    loop {
        match run_once(&cli) {
            Ok(SupervisorExit::Restart) => {
                tracing::info!("watch configuration changed, re-resolving project");
                continue;
            }
            Ok(SupervisorExit::Shutdown) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

/// Resolves the project, spawns the watcher/server/eviction threads, and
/// runs the supervisor loop to completion (either a config-change restart or
/// a process shutdown).
fn run_once(cli: &Cli) -> anyhow::Result<SupervisorExit> {
    let cwd = camino::Utf8PathBuf::from_path_buf(std::env::current_dir()?)
        .unwrap_or_else(|_| camino::Utf8PathBuf::from("."));
    let config_path = AbsolutePath::resolve(&cwd, cli.config.as_str()).into_path_buf();
    let config_dir = config_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| camino::Utf8PathBuf::from("."));

    let watch_config = WatchConfig::load(&config_path)?;
    let mut project = ProjectResolver::new(&watch_config, &config_dir, &cli.filter).resolve()?;

    for err in &project.resolution_errors {
        tracing::warn!(output = %err.output_path, error = %err.error, "target disabled");
    }

    // §6.2: persisted per-target compilation mode survives across restarts.
    // The port preference also lives here, read from the project root's
    // preferences file (the common case of one manifest co-located with the
    // watch config); `PORT` still wins over whatever was persisted.
    let preferences = Preferences::load(&config_dir);
    for (name, target_preferences) in &preferences.targets {
        if let Some(mode) = target_preferences.compilation_mode {
            if let Some(state) = project.find_output_mut(name) {
                state.compilation_mode = mode;
            }
        }
    }

    let postprocess = PostprocessPool::new(
        config::max_parallel_from_env(),
        worker_idle_timeout_from_env(),
    );

    let (sender, receiver) = mpsc::channel::<SupervisorMessage>();

    let _debouncer = {
        let (watch_tx, watch_rx) = mpsc::channel::<Vec<camino::Utf8PathBuf>>();
        let debouncer = watcher::start_watching(&project.watch_root, watch_tx)?;
        let forward = sender.clone();
        std::thread::spawn(move || {
            for paths in watch_rx.iter() {
                if forward.send(SupervisorMessage::Dirty(paths)).is_err() {
                    break;
                }
            }
        });
        debouncer
    };

    let artifact_snapshot = {
        let forward = sender.clone();
        let (server_tx, server_rx) = mpsc::channel::<server::ServerEvent>();
        let (_handle, artifact_snapshot) = server::start(resolve_port(&preferences), server_tx);
        std::thread::spawn(move || {
            for event in server_rx.iter() {
                if forward.send(SupervisorMessage::Server(event)).is_err() {
                    break;
                }
            }
        });
        artifact_snapshot
    };

    {
        let forward = sender.clone();
        std::thread::spawn(move || loop {
            std::thread::sleep(EVICT_TICK_INTERVAL);
            if forward.send(SupervisorMessage::EvictTick).is_err() {
                break;
            }
        });
    }

    let supervisor = Supervisor::new(
        project,
        config_path,
        SERVER_VERSION.to_string(),
        sender,
        postprocess,
        artifact_snapshot,
    );

    Ok(supervisor.run(receiver))
}
