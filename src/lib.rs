#![deny(unsafe_code, clippy::panic)]

pub mod cli;
pub mod compiler;
pub mod config;
pub mod error;
pub mod injector;
pub mod logging;
pub mod output_state;
pub mod path_model;
pub mod postprocess;
pub mod project;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod watcher;

pub use camino;
