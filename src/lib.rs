//! Energi pool clients
//!
//! Pool-side plumbing for a mining farm: a stream-based stratum client and a
//! getwork HTTP poll client, both feeding jobs to the farm and carrying
//! solutions back.
//!
//! # Features
//!
//! - Three stratum dialects: classic stratum, eth-proxy and ethereum stratum
//! - Plain TCP or TLS transport (optionally pinned to TLS 1.2)
//! - DNS round-robin across all resolved endpoints of the pool host
//! - Work, response and connect deadline timers driving failover
//! - Getwork polling over HTTP JSON-RPC as a fallback protocol
//! - Async/await based on Tokio
//!
//! # Example
//!
//! ```no_run
//! use energi_pool::{ClientEvent, PoolEndpoint, StratumClient, StratumConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoint = PoolEndpoint::from_url(
//!         "stratum+tcp://wallet.worker:x@pool.example.com:9999",
//!     )?;
//!
//!     let (client, handle, mut events) =
//!         StratumClient::new(endpoint, StratumConfig::default());
//!     tokio::spawn(client.run());
//!     handle.connect();
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             ClientEvent::WorkReceived(job) => println!("new job: {}", job.name),
//!             ClientEvent::Disconnected => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod getwork;
pub mod protocol;

// Re-export main types
pub use client::{ClientEvent, ClientHandle, StratumClient};
pub use config::{GetworkConfig, PoolEndpoint, ProtocolDialect, SecureLevel, StratumConfig};
pub use error::{PoolClientError, Result};
pub use getwork::{GetworkClient, GetworkHandle};
pub use protocol::{Job, Solution};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identifying string advertised in stratum subscribe requests
pub fn user_agent() -> String {
    format!("energiminer {}", VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_user_agent() {
        assert!(user_agent().starts_with("energiminer "));
    }
}
