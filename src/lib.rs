//! Campaign dispatch engine.
//!
//! Turns scheduled bulk-messaging campaigns into per-recipient sends against an
//! external messaging provider. Three independent polling loops share state only
//! through SQLite:
//!
//! - the run scheduler claims due runs and admits pending recipients into the
//!   send queue, subject to daily quotas;
//! - the queue dispatcher drains the send queue with exponential-backoff retry;
//! - the completion monitor closes runs whose queue work has drained.
//!
//! Any number of processes may run these loops against the same database.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod events;
pub mod logging;
pub mod provider;
pub mod quota;
pub mod store;
