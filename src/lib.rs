//! Sentinel - A DNS firewall running on a tunnel interface.
//!
//! Sentinel presents itself as the route to the device's resolvers, reads the
//! DNS queries that arrive through the tunnel, and blocks or forwards each one
//! according to per-application, per-domain and per-address rules. Allowed
//! queries are resolved over sockets that bypass the tunnel, and the answers
//! are written back as hand-built IPv4/IPv6 UDP packets.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`config`]: Configuration loading and validation
//! - [`network`]: Frame classification, checksums, reply synthesis and tunnel I/O
//! - [`dns`]: QNAME parsing, message inspection and upstream resolution
//! - [`policy`]: Rule storage and evaluation
//! - [`handler`]: Processing of a single query
//! - [`engine`]: The interception loop and its start/stop state machine
//! - [`events`]: Commands accepted and events emitted by the engine
//! - [`platform`]: Capabilities the host provides (tunnel, bypass, app lookup)
//! - [`error`]: Error types
//!
//! # Testing
//!
//! Host capabilities, the tunnel and the resolver are traits, so every
//! component can be exercised without privileges or network access:
//!
//! ```rust
//! use sentinel::config::DomainMatch;
//! use sentinel::policy::PolicyStore;
//!
//! let store = PolicyStore::new();
//! store.set_domain_rule("ads.example.com", true).unwrap();
//! assert_eq!(
//!     store.matching_domain_rule("cdn.ads.example.com", DomainMatch::LabelSuffix),
//!     Some("ads.example.com".to_string())
//! );
//! ```

pub mod config;
pub mod dns;
pub mod engine;
pub mod error;
pub mod events;
pub mod handler;
#[cfg(target_os = "linux")]
pub mod host;
pub mod metrics;
pub mod network;
pub mod platform;
pub mod policy;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use events::{Command, EngineEvent, LogEvent};
