//! Cooperative cancellation of pipeline runs.
//!
//! A [`CancellationToken`] handed to a run stops the scheduler from
//! dispatching further execution units. Steps already in flight finish.

mod token;

pub use token::CancellationToken;
