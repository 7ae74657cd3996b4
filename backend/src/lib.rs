//! sigrelay - Signaling Relay Library
//!
//! A rendezvous server that lets two peers behind NAT find each other,
//! authenticate, agree on a named service and exchange the ICE material
//! needed for a direct connection.
//!
//! ## Components
//!
//! * **Server** - one actor task owns every peer, service and connection
//!   record; connection tasks talk to it only through channels
//! * **Client** - reconnecting signal client with request/response
//!   correlation and a channel of pushed events
//! * **Endpoint** - routes pushed ICE events to local ICE agents
//! * **STUN keepalive** - binding checks with adaptive retry once a direct
//!   path exists
//!
//! ## Example
//!
//! ```no_run
//! use sigrelay::{ServerConfig, SignalClient, SignalServer};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ServerConfig {
//!     listen: "127.0.0.1:0".parse()?,
//!     ..Default::default()
//! };
//! let server = SignalServer::bind(config).await?;
//! let addr = server.local_addr()?;
//! tokio::spawn(async move { server.run().await });
//!
//! let client = SignalClient::new();
//! client.connect(addr).await?;
//! client.register("bob1234567", "secret").await?;
//! client.login("bob1234567", "secret", false).await?;
//! client.create_service("ssh-box", "p1", "ssh on the home box").await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod codec;
pub mod correlator;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod service;
pub mod state;
pub mod stun;

// Re-export main types for convenience
pub use client::{NetworkStatus, SignalClient};
pub use correlator::RequestCorrelator;
pub use endpoint::{Endpoint, IceAgent, IceAgentFactory, IceEventSink, SessionKey};
pub use error::{ClientError, RelayError, RelayResult};
pub use protocol::{Action, Request, Response, DEFAULT_SIGNAL_ADDR};
pub use server::{ServerActor, ServerConfig, SignalServer};
pub use service::ServiceInfo;
pub use state::{Peer, Service, SessionDatabase, SnapshotStore};
pub use stun::{BindingCodec, KeepaliveState, PacketSink, StunCodec, StunKeepalive};
