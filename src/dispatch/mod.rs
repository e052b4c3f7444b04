//! Request queue and dispatcher.
//!
//! The display process answers one request at a time. A single tokio task owns
//! the attached channel and feeds it from a FIFO queue; callers hold a cheap
//! [`Dispatcher`] handle and get exactly one outcome per request back through a
//! oneshot. Each request is stamped with the session generation that was
//! attached when it was accepted, so a restart can never hand an old request to
//! a new process.

mod loop_impl;
pub mod request;
pub mod worker;

pub use request::{DisplayRequest, RawOutput, WorkerEvent};
pub use worker::Dispatcher;
