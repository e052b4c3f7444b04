//! Display session manager for compiler display-mode servers
//!
//! This library keeps one long-lived compiler server process (by default
//! `haxe --wait stdio`) and lets many concurrent callers ask it display-mode
//! questions (completion, hover, references, diagnostics) without stepping on
//! each other.
//!
//! # Architecture
//!
//! - **config**: Layered toolchain settings. A base record plus per-platform
//!   overrides resolve to one `ToolchainConfig`, re-read before every start.
//!
//! - **process**: The subprocess and its length-prefixed stdio framing. A
//!   spawn yields a kill side (`Process`) and an I/O side (`Channel`).
//!
//! - **version**: One `-version` call per session; gates capabilities and
//!   rejects toolchains that are too old.
//!
//! - **dispatch**: A single tokio task that owns the channel, queues requests
//!   FIFO and answers each exactly once. Cancellation is cooperative.
//!
//! - **session**: `SessionManager`, the only component that spawns or kills.
//!   Start, stop, restart (coalesced) and crash detection.
//!
//! - **server**: A JSON-lines front end used by the `display-session` binary,
//!   with a crash-restart budget on top of the session layer.
//!
//! # Example
//!
//! ```no_run
//! use display_session::{
//!     DisplayRequest, DisplayServerSettings, Platform, SessionManager, StdioSpawner,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), display_session::DisplayError> {
//! let manager = SessionManager::new(
//!     Arc::new(DisplayServerSettings::default()),
//!     Arc::new(StdioSpawner::new()),
//!     Platform::current(),
//! );
//! manager.start().await?;
//! let hover = manager
//!     .submit(
//!         DisplayRequest::new(vec!["--display".into(), "Main.hx@120@type".into()]),
//!         CancellationToken::new(),
//!     )
//!     .await?;
//! println!("{}", hover.text);
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

pub mod config;
pub mod dispatch;
pub mod error;
pub mod process;
pub mod server;
pub mod session;
pub mod version;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{
    DisplayServerSettings, Platform, PlatformOverrides, SettingsFile, SettingsProvider,
    ToolchainConfig, ToolchainOverride,
};
pub use dispatch::{Dispatcher, DisplayRequest, RawOutput};
pub use error::DisplayError;
pub use process::{ProcessExit, Response, Spawner, StdioSpawner};
pub use session::{SessionEvent, SessionInfo, SessionManager, SessionStatus};
pub use version::{Capabilities, Version};

/// Expand `~/` prefix to the user's home directory.
pub fn expand_path(path: &str) -> PathBuf {
    path.strip_prefix("~/")
        .and_then(|stripped| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(stripped)))
        .unwrap_or_else(|| PathBuf::from(path))
}
