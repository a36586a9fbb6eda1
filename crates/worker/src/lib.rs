//! The worker process: one conversation, one private socket.

mod prompt;
mod server;
mod state;

pub use prompt::{build_prompt, render_answer};
pub use server::{WorkerOptions, run_worker};
pub use state::{Handled, WorkerState};
