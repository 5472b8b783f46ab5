//! Durable activity store with a transactional outbox and an
//! at-least-once publisher relaying events to a message broker.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod model;
pub mod publisher;
