//! Real-time conversation gateway: binds chat widgets and human operators
//! to shared conversation sessions over websockets, relays messages between
//! them and governs the bot-to-human takeover.

pub mod config;
pub mod effects;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod store;
pub mod takeover;
pub mod tenant;
pub mod types;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::{router, run, serve_with_listener, GatewayState};
