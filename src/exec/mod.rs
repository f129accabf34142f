//! Sandboxed shell command execution.
//!
//! Workers never touch the host shell directly: every requested command
//! passes the [`guard`] denylist screen, then runs under a deadline in the
//! run's working directory with the whole process group killed on expiry.

pub mod guard;
pub mod runner;

pub use guard::{screen_command, CommandVeto};
pub use runner::{
    run_command, tail_truncate, CommandOutcome, CommandRequest, CANCELLED_EXIT_CODE,
    OUTPUT_TAIL_CHARS, TIMEOUT_EXIT_CODE,
};
