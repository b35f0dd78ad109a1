#![warn(missing_docs)]

//! Ferrobus core message receiver.
//!
//! An asynchronous pull API over a credit-flow, session- and
//! lock-token-aware broker link: callers ask for up to N messages, the
//! receiver prefetches in the background using link credit, settles
//! dispositions (complete / abandon / defer / dead-letter), renews locks,
//! and supports exclusive session consumption with session state I/O and
//! peek-by-sequence.
//!
//! The transport (frame codec, reactor loop, link primitives) stays behind
//! the trait seams in `ferrobus-amqp`; this crate owns the concurrency and
//! protocol state machine on top of them.

pub mod config;
pub mod error;
pub mod management;
pub mod receiver;
pub mod retry;

mod credit;
mod dispatcher;
mod disposition;
mod prefetch;
mod reaper;
mod session;
mod work;

pub use config::ReceiverOptions;
pub use error::{ReceiverError, Result};
pub use management::DispositionStatus;
pub use receiver::{ErrorContext, MessageReceiver};
pub use retry::{RetryConfig, RetryPolicy};
