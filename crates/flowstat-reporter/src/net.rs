use std::{
    io,
    net::{IpAddr, Ipv4Addr, UdpSocket},
    sync::Arc,
};
use tracing::{info, warn};

// Never contacted; connecting a UDP socket only selects the outbound route.
const ROUTE_PROBE: &str = "8.8.8.8:80";

/// Resolve the identity stamped on every record.
///
/// A configured address wins; otherwise the local address of the default
/// outbound route is used, falling back to loopback.
pub fn server_ip(configured: Option<&str>) -> Arc<str> {
    if let Some(ip) = configured.map(str::trim).filter(|ip| !ip.is_empty()) {
        return Arc::from(ip);
    }
    match discover_local_ip() {
        Ok(ip) => {
            info!(%ip, "resolved server ip");
            Arc::from(ip.to_string())
        }
        Err(err) => {
            warn!(?err, "unable to resolve server ip, using loopback");
            Arc::from(Ipv4Addr::LOCALHOST.to_string())
        }
    }
}

fn discover_local_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(ROUTE_PROBE)?;
    let ip = socket.local_addr()?.ip();
    if ip.is_unspecified() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no outbound route",
        ));
    }
    Ok(ip)
}
