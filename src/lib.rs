#![deny(unused, dead_code)]
#![deny(clippy::all)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]

//! Photon - subject-based publish/subscribe server with an embedded
//! MQTT 3.1.1 adapter.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::runtime` - Runtime orchestration
//!
//! ## Broker
//! - `broker::subject` - Subject grammar and wildcard matching
//! - `broker::router` - Per-account subject fan-out
//! - `broker::auth` - Authentication and publish permissions
//!
//! ## Streams
//! - `stream::log` - Append-only file-backed stream logs
//! - `stream::consumer` - Durable ack-explicit consumers
//!
//! ## MQTT adapter
//! - `mqtt` - Codec, sessions, retained messages, QoS-1 bridge
//!
//! ## CLI
//! - `cli` - clap entrypoints

pub mod broker;
pub mod cli;
pub mod core;
pub mod mqtt;
pub mod stream;

// Re-exports for convenience.
pub use self::core::{config, runtime};
pub use broker::{auth, router, subject};
pub use mqtt::{MqttListener, MqttServer};
