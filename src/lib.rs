//! Lead relay: at-most-once inbound processing, bot screening, agent
//! routing and deduplicated outbound delivery for a messaging webhook.

pub mod agents;
pub mod channels;
pub mod classifier;
pub mod config;
pub mod delivery;
pub mod error;
pub mod hub;
pub mod ingress;
pub mod pipeline;
pub mod server;
pub mod store;
