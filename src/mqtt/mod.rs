//! MQTT 3.1.1 protocol adapter.
//!
//! Accepts MQTT client connections and translates them onto the broker's
//! subject space. Durable (non-clean) sessions and QoS-1 deliveries persist
//! through the account's stream layer and survive reconnects and restarts:
//!
//! - `codec` - wire-level packet decode/encode
//! - `topic` - topic ↔ subject translation
//! - `retained` - retained-message store with wildcard matching
//! - `conn` - per-connection state
//! - `session` - per-account session manager and persistence
//! - `bridge` - QoS-1 delivery through durable consumers
//! - `dispatch` - packet state machine and handlers
//! - `listener` - TCP accept loop
//!
//! Supported QoS levels are 0 and 1; QoS 2 packets are a fatal protocol
//! error, as is anything MQTT 5.

pub mod bridge;
pub mod codec;
pub mod conn;
pub mod dispatch;
pub mod listener;
pub mod retained;
pub mod session;
pub mod topic;

pub use codec::*;
pub use dispatch::MqttServer;
pub use listener::MqttListener;

/// Suffix marking the subscription id of the parent-subject helper created
/// for filters ending in the multi-level wildcard (`foo/#` subscribes
/// `foo.>` and `foo`, the latter under sid `foo fwc`).
pub const MULTI_LEVEL_SID_SUFFIX: &str = " fwc";

/// Prefix of the internal inboxes durable consumers deliver into. The
/// delivery callback uses it to tell bridge traffic from ordinary subject
/// publications, so a wildcard subscription never double-delivers a stored
/// message.
pub const DELIVER_PREFIX: &str = "$MQTT.deliver.";
