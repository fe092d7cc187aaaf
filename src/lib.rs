// ABOUTME: Root library module for the fieldbot binary
// ABOUTME: Matrix transport, HTTP surface, gateway wiring and CLI, with the core re-exported

#![recursion_limit = "256"]

pub mod cli;
pub mod gateway;
pub mod platform;
pub mod server;

// Re-export platform-agnostic modules from fieldbot-core
pub use fieldbot_core::config;
pub use fieldbot_core::metrics;
pub use fieldbot_core::paths;
pub use fieldbot_core::session;
pub use fieldbot_core::status;
pub use fieldbot_core::traits;
