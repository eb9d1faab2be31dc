use std::io::ErrorKind;
use std::net::TcpListener;

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("port {0} is already in use")]
    Unavailable(u16),
    #[error("failed to probe port {port}: {source}")]
    Probe {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Find a usable TCP port for a dev server.
///
/// A requested port is probed by binding a transient listener; if the bind
/// fails the caller gets `Unavailable` rather than a substitute port. With
/// no request, the OS picks an ephemeral port which is read back and
/// released. Either way the reservation is advisory only: the probe socket
/// is gone before the child binds, and a losing race surfaces as the
/// child's own bind failure.
pub fn allocate(requested: Option<u16>) -> Result<u16, PortError> {
    if let Some(port) = requested {
        return match TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => {
                listener.set_nonblocking(true).ok();
                Ok(port)
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => Err(PortError::Unavailable(port)),
            Err(e) => Err(PortError::Probe { port, source: e }),
        };
    }

    // Ask the OS for an ephemeral port.
    let listener =
        TcpListener::bind(("127.0.0.1", 0)).map_err(|e| PortError::Probe { port: 0, source: e })?;
    let port = listener
        .local_addr()
        .map_err(|e| PortError::Probe { port: 0, source: e })?
        .port();
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_allocation_returns_nonzero_port() {
        let port = allocate(None).unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn requested_free_port_is_returned_verbatim() {
        // Grab an ephemeral port, release it, then request it explicitly.
        let probe = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        assert_eq!(allocate(Some(port)).unwrap(), port);
    }

    #[test]
    fn requested_bound_port_is_unavailable() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = holder.local_addr().unwrap().port();

        match allocate(Some(port)) {
            Err(PortError::Unavailable(p)) => assert_eq!(p, port),
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }
}
