//! # aicli-runner
//!
//! Process runner for the AICLI command-line assistant. Spawns the CLI as
//! a supervised child process, feeds it a prompt, parses its
//! newline-delimited JSON output into typed [`StreamEvent`]s, and
//! produces a final aggregate value.
//!
//! The crate has two layers:
//!
//! - validation utilities ([`validation`]): stream-JSON parsing and
//!   recovery, prompt/content sanitization, attachment and chunk checks;
//! - the runner itself ([`runner`], [`interactive`]): CLI discovery,
//!   argument assembly, child supervision with a per-process
//!   [`health::HealthMonitor`], and interactive sessions.
//!
//! ## Example
//!
//! ```rust,no_run
//! use aicli_runner::{AiCliRunner, RunnerOptions};
//!
//! # async fn example() -> aicli_runner::Result<()> {
//! let runner = AiCliRunner::discover().await;
//! let mut events = runner.subscribe();
//! let result = runner
//!     .run("session-1", "Summarize this project", &RunnerOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod health;
pub mod interactive;
pub mod runner;
pub mod stream_parser;
pub mod types;
pub mod validation;

pub use errors::{Result, RunnerError};
pub use health::HealthMonitor;
pub use interactive::{
    create_interactive_session, send_to_interactive_session, InteractiveSession,
};
pub use runner::{discover_cli_command, is_test_environment, terminate_child, AiCliRunner};
pub use stream_parser::StreamParser;
pub use types::{PermissionFlags, PermissionMode, RunnerOptions, StreamEvent};
pub use validation::{Attachment, AttachmentKind, OutputFormat};
