pub mod config;
pub mod endpoint;
pub mod service;
pub mod watch;
