//! DNS-related modules.

pub mod message;
pub mod name;
pub mod resolver;

pub use message::{nxdomain_response, resolved_addresses};
pub use name::extract_qname;
pub use resolver::{DnsResolver, UpstreamResolver};
