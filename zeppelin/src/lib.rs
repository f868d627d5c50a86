//! Message normalization between IoT brokers.
//!
//! The service runs a set of configuration-driven pipelines. Each pipeline
//! subscribes to a source broker, runs every inbound message through a
//! processor (assess, validate, normalize), and republishes the result on a
//! destination broker inside a fresh CloudEvents 1.0 envelope. Camera block
//! streams take a detour through the `photo-rebuilder` crate instead of being
//! republished.

pub mod cloudevent;
pub mod config;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod rules;
pub mod throttle;
pub mod transport;
