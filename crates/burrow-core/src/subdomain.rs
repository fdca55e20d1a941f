//! Subdomain validation rules shared by broker and agent.

use crate::error::{TunnelError, TunnelResult};

/// Subdomains that can never be allocated to a tunnel.
pub const RESERVED_SUBDOMAINS: &[&str] = &[
    "www", "api", "admin", "dashboard", "app", "mail", "ftp", "ssh", "git", "tunnel", "ws", "wss",
    "http", "https",
];

/// Validate and normalize a requested subdomain.
///
/// Rules: 3–63 characters after lowercasing, `[a-z0-9]` with interior
/// hyphens only, and not in the reserved set. Returns the lowercased label.
pub fn validate_subdomain(raw: &str) -> TunnelResult<String> {
    let label = raw.to_ascii_lowercase();

    if label.len() < 3 || label.len() > 63 {
        return Err(TunnelError::InvalidSubdomain(format!(
            "\"{raw}\" must be 3-63 characters"
        )));
    }
    let bytes = label.as_bytes();
    let interior_ok = bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-');
    let edges_ok = bytes[0] != b'-' && bytes[bytes.len() - 1] != b'-';
    if !interior_ok || !edges_ok {
        return Err(TunnelError::InvalidSubdomain(format!(
            "\"{raw}\" must match [a-z0-9]([a-z0-9-]*[a-z0-9])?"
        )));
    }
    if RESERVED_SUBDOMAINS.contains(&label.as_str()) {
        return Err(TunnelError::ReservedSubdomain(label));
    }

    Ok(label)
}
