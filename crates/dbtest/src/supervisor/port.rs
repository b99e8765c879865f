use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use crate::error::DriverError;

/// Find a free TCP port on the loopback interface.
///
/// Binds an ephemeral listener, reads its address and releases it again.
/// This is racy: another process may grab the port between the release
/// and the server's own bind. The window is small and a lost race shows up
/// as a launch crash with the server's "address in use" output attached.
pub fn probe_free_port() -> Result<SocketAddr, DriverError> {
    let listener =
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(DriverError::PortProbe)?;
    let addr = listener.local_addr().map_err(DriverError::PortProbe)?;
    drop(listener);
    Ok(addr)
}
