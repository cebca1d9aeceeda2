//! Executive services consumed by the protocol engine.
//!
//! The stack runs on a cooperative executive: tasks suspend on
//! [`Signal`]s and resume when the signal is raised or a deadline
//! elapses. This crate provides that primitive plus the monotonic
//! clock, so the protocol crate stays free of platform details.

pub mod clock;
pub mod signal;

pub use signal::Signal;
