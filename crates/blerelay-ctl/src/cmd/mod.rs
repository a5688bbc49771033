//! CLI command modules.

pub mod devices;
pub mod http;
pub mod sessions;
pub mod status;
