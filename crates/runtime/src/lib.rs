mod broker;
mod client;
mod daemon;
mod link;
mod reaper;
mod recovery;
pub mod registry;
pub mod supervisor;

pub use broker::{Broker, HELP_TEXT};
pub use client::{CONNECT_ATTEMPTS, DaemonClient};
pub use daemon::run_daemon;
pub use link::call_worker;
pub use reaper::run_reaper;
pub use recovery::run_recovery;
pub use registry::{SessionPhase, SessionRegistry, SessionSnapshot};
pub use supervisor::{MonitorHandle, Supervisor, SupervisorEvent, WorkerLaunch};
