//! burrow-core: Shared protocol library for the burrow tunneling system.
//!
//! Provides the JSON control-frame types exchanged between agent and broker,
//! the text codec, subdomain validation rules, and the shared error type.

pub mod codec;
pub mod error;
pub mod frames;
pub mod subdomain;

// Re-export commonly used items at crate root.
pub use codec::{decode_frame, encode_frame};
pub use error::{TunnelError, TunnelResult};
pub use frames::{Frame, Protocol};
pub use subdomain::{validate_subdomain, RESERVED_SUBDOMAINS};
