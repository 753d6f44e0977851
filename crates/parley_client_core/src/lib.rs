#![forbid(unsafe_code)]

//! Client core: directory, history and realtime actors behind a message-passing boundary.

pub mod channel_directory;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod fanout;
pub mod history;
pub mod request;
pub mod transport;
pub mod user_directory;

pub use client::Client;
pub use config::{
	ActorSettings, ClientConfig, ReconnectPolicy, default_config_path, load_client_config, load_client_config_from_path,
};
pub use error::ClientCoreError;
pub use fanout::UpdateRx;
pub use request::deadline_in;
pub use transport::ConnectionState;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod client_tests;
