// ABOUTME: Library root for change-relay
// ABOUTME: Watermark-driven change capture, envelope codec, transport and idempotent merge

pub mod commands;
pub mod config;
pub mod relay;
pub mod schema;
pub mod store;
pub mod transport;
pub mod utils;
