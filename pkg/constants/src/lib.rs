//! Centralized constants for the k3rs flow proxy.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod flow;
pub mod network;
pub mod proxy;
