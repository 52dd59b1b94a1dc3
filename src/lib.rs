//! LearnSphere Messaging - Topic Event Bus + Durable Subscriber Framework
//!
//! The event-driven backbone of the LearnSphere platform: services publish
//! domain events to a shared topic exchange and consume them through named
//! durable queues, with bounded redelivery and dead-lettering on failure.
//! Events that concern connected clients are fanned out over WebSockets.

pub mod bus;
pub mod config;
#[cfg(feature = "amqp")]
pub mod connection;
pub mod dlq;
pub mod events;
pub mod handlers;
pub mod listener;
pub mod publisher;
pub mod realtime;
pub mod topic;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
