//! Child process primitives shared by all providers

pub mod command;
pub mod deadline;
pub mod readiness;
pub mod supervisor;

pub use command::{check_output, check_output_json, check_output_text, BackgroundExit, BackgroundProcess, BoundedCommand};
pub use deadline::Deadline;
pub use readiness::{wait_until_ready, Readiness};
pub use supervisor::{Redirect, StdioConfig, SupervisedProcess, DEFAULT_GRACEFUL_EXIT_TIMEOUT};
