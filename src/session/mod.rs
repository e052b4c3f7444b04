//! Session lifecycle for the display server.
//!
//! ```text
//!   Stopped ──start──▶ Starting ──probe ok──▶ Ready
//!      ▲                  │                     │
//!      └──── failure ─────┘                     ├──stop──▶ Stopping ──▶ Stopped
//!      ▲                                        │
//!      └──── channel lost (Crashed) ────────────┤
//!                                               └──restart──▶ Restarting ──▶ Starting
//! ```
//!
//! Only [`SessionManager`] spawns and kills processes. It detaches the
//! dispatcher before every kill, so no request is ever written to a process
//! that is going away.

mod manager;
mod types;

pub use manager::SessionManager;
pub use types::{Session, SessionEvent, SessionInfo, SessionStatus};
