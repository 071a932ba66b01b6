//! Detach Core
//!
//! Core types shared by every Detach component.
//!
//! This crate contains:
//! - Domain types: job state, PID records and queue rows
//! - The error taxonomy used across process boundaries
//! - Runtime configuration and directory resolution

pub mod config;
pub mod domain;
pub mod error;
pub mod paths;

pub use error::{Error, Result};
