//! TCP port discovery and reservation on the loopback interface.
//!
//! Port ownership relies on OS socket exclusivity, no application lock.

use pybridge_core::{BridgeError, Result};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use tracing::debug;

fn bind(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

fn validate(port: u32) -> Result<u16> {
    match u16::try_from(port) {
        Ok(port) if port >= 1 => Ok(port),
        _ => Err(BridgeError::PortOutOfRange(port)),
    }
}

/// Ask the OS for a free port. The socket is closed before returning, so the
/// port can be taken by someone else before the caller binds it.
pub fn get_free_port() -> Result<u16> {
    let listener = bind(0)?;
    Ok(listener.local_addr()?.port())
}

/// Whether `port` can be bound right now. Errors on ports outside 1..=65535.
pub fn check_free(port: u32) -> Result<bool> {
    let port = validate(port)?;
    Ok(bind(port).is_ok())
}

/// Hold `port` (0 = OS-assigned) until the returned value is released or dropped.
pub fn reserve(port: u32) -> Result<ReservedPort> {
    let requested = if port == 0 { 0 } else { validate(port)? };
    let listener = match bind(requested) {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse && requested != 0 => {
            return Err(BridgeError::PortInUse(requested));
        }
        Err(e) => return Err(e.into()),
    };
    let port = listener.local_addr()?.port();
    debug!(port = port, "Reserved port");
    Ok(ReservedPort {
        port,
        listener: Some(listener),
    })
}

/// A bound but idle listener claiming a port for a soon-to-be-spawned process
#[derive(Debug)]
pub struct ReservedPort {
    port: u16,
    listener: Option<TcpListener>,
}

impl ReservedPort {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_held(&self) -> bool {
        self.listener.is_some()
    }

    /// Close the socket. Idempotent.
    pub fn release(&mut self) {
        if self.listener.take().is_some() {
            debug!(port = self.port, "Released port reservation");
        }
    }
}

impl Drop for ReservedPort {
    fn drop(&mut self) {
        self.release();
    }
}
