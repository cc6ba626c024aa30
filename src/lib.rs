//! A SOCKS5 proxy server
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT (BIND and UDP ASSOCIATE are refused with `CommandNotSupported`)
//!     - No Authentication
//!     - Username/Password Authentication
//!     - IPv4, domain name and IPv6 destination address types
//!     - Bounded number of concurrent sessions, excess connections are closed
//!     - Idle timeout on handshake, connect and relay
//!     - Bind retry with exponential backoff at startup
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use socksgate::{ServerConfig, Socks5Server, UserPass};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         host: "127.0.0.1".to_string(),
//!         port: 1080,
//!         credentials: Some(UserPass {
//!             username: "admin".to_string(),
//!             password: "123456".to_string(),
//!         }),
//!         ..ServerConfig::default()
//!     };
//!
//!     let mut server = Socks5Server::new(config);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod admission;
pub mod auth;
pub mod config;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;

// Re-export main types at crate root for convenience
pub use address::Address;
pub use auth::UserPass;
pub use config::{ServerConfig, ServerConfigFile};
pub use error::{AuthError, BindError, ConfigError, ConnectError, ProtocolError, SessionError};
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use relay::{RelayEnd, RelayStats};
pub use server::Socks5Server;
pub use session::{ConnectionSession, SessionOutcome, SessionState};
