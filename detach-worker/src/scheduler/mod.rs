//! Scheduler layer for the worker
//!
//! Claims queue rows, hands them to the Launcher and reports finished
//! jobs back to the queue.

pub mod poller;

pub use poller::QueuePoller;
