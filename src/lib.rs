pub mod auth;
pub mod codec;
pub mod config;
pub mod relay;
pub mod transport;
