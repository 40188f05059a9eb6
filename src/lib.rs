//! convo-flow: conversational flow engine for messaging channels.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fields;
pub mod flow;
pub mod inbound;
pub mod server;
pub mod session;
pub mod store;
