//! Port allocation for backend processes.
//!
//! Backends get ports from the reserved `[9000, 9999]` range. A port is
//! handed out only if it is absent from the persisted used-port set AND
//! currently unbindable is false — the OS-level probe catches processes the
//! store doesn't know about.

use std::{collections::HashSet, net::TcpListener};

use crate::error::Error;

pub const PORT_RANGE_START: u16 = 9000;
pub const PORT_RANGE_END: u16 = 9999;

/// Whether `port` can be bound on loopback right now.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Find the first free port in the reserved range, skipping `used`.
pub fn find_available(used: &HashSet<u16>) -> Result<u16, Error> {
    find_available_from(PORT_RANGE_START, used)
}

/// As [`find_available`], scanning from a configured base port instead of
/// the range start.
pub fn find_available_from(base: u16, used: &HashSet<u16>) -> Result<u16, Error> {
    let start = base.clamp(PORT_RANGE_START, PORT_RANGE_END);
    for port in start..=PORT_RANGE_END {
        if used.contains(&port) {
            continue;
        }
        if is_port_free(port) {
            return Ok(port);
        }
    }
    Err(Error::Conflict(format!(
        "no free port in {start}-{PORT_RANGE_END}"
    )))
}

/// Validate a requested port for a backend, tolerating "same as current"
/// during updates (the backend already owns that port).
pub fn check_requested(
    port: u16,
    used: &HashSet<u16>,
    current: Option<u16>,
) -> Result<(), Error> {
    crate::config::validate_port(port)?;
    if current == Some(port) {
        return Ok(());
    }
    if used.contains(&port) {
        return Err(Error::Conflict(format!("port {port} is already assigned")));
    }
    if !is_port_free(port) {
        return Err(Error::Conflict(format!("port {port} is already bound")));
    }
    Ok(())
}
