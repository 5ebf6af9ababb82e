pub mod backend;
pub mod barrier;
pub mod control;
pub mod errors;
pub mod gateway;
pub mod identity;
pub mod pid;
pub mod registry;
pub mod rpc;
pub mod runtime;
pub mod screen;
pub mod scrollback;
pub mod server;
pub mod types;
pub mod worker_proc;

// Primary re-exports
pub use errors::DaemonError;
pub use server::run_server;
pub use types::{ExitEvent, PtyEvent, RecoveryReport, SpawnOptions};
pub use worker_proc::{run_worker, run_worker_from_stdin};
