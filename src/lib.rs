pub mod app;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod security;
pub mod subscription;

pub use client::{ClientError, ClientEvent, QsysClient};
pub use config::{ConnectionSettings, EndpointConfig};
pub use connection::{ConnectionState, ConnectionStatus};
