//! # gpg-task
//!
//! Subprocess task engine for driving the `gpg` executable.
//!
//! ## Design Philosophy
//!
//! gpg-task is designed to be:
//! - **Protocol-driven** - Everything gpg reports on its status descriptor is
//!   parsed into typed events; nothing is scraped from human-readable output
//! - **Deadlock-free** - stdin, stdout, stderr and the side channels are
//!   pumped independently, whatever the data sizes
//! - **Scriptable** - Prompts are answered by a [`TaskDelegate`] or a
//!   prepared [`TaskOrder`], so batch key generation and key editing work
//!   unattended
//! - **Sandbox-friendly** - The same task can run through a privilege
//!   separation helper when the caller may not spawn processes
//!
//! ## Quick Start
//!
//! ```no_run
//! use gpg_task::{GpgContext, TaskConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let context = GpgContext::new(TaskConfig::default())?;
//!
//!     let mut task = context.task_with_arguments(["--decrypt"], true);
//!     task.add_input_file("message.asc")?;
//!     let result = task.start().await?;
//!
//!     if result.is_success() {
//!         println!("{}", result.out_text());
//!     } else {
//!         eprintln!("gpg failed: {:?}", result.error_codes);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Shared task setup
pub mod context;
/// Error types
pub mod error;
/// Privilege separation channel and helper
pub mod helper;
/// Scripted prompt answers
pub mod order;
/// Child process spawning with extra descriptors
pub mod process;
/// GnuPG status protocol parsing
pub mod status;
/// The task engine
pub mod task;
/// Keyring change notification
pub mod watcher;

// Re-export commonly used types
pub use config::{Config, HelperConfig, TaskConfig, WatcherConfig};
pub use context::GpgContext;
pub use error::{Error, FailureContext, Result};
pub use helper::{PrivilegeSeparationChannel, RemoteRun};
#[cfg(unix)]
pub use helper::{HelperServer, SocketChannel};
pub use order::{BoolAnswer, OrderCommand, TaskOrder, TaskOrderItem};
pub use process::{ProcessHandle, ProcessState, SpawnSpec};
pub use status::{ErrorCode, StatusEvent, StatusKeyword, StatusParser};
pub use task::{
    Answer, CancelHandle, GpgTask, InputSource, PassphraseRequest, Progress, PromptContext,
    PromptRequest, TaskDelegate, TaskOutcome, TaskResult, TaskState, find_executable,
};
pub use watcher::{KeyringEvent, KeyringWatcher, WatcherControl};
