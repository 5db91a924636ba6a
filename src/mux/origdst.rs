//! Original-destination recovery for transparently redirected sockets.
//!
//! Linux only: `getsockopt(SOL_IP, SO_ORIGINAL_DST)` returns the pre-NAT
//! destination of a connection redirected to us by iptables/nftables. Only
//! AF_INET is decoded; IPv6 redirects are a known limitation and classify as
//! non-transparent.

use std::net::SocketAddr;

use tokio::net::TcpStream;

/// The pre-NAT destination of `stream`, if the kernel redirected it here.
///
/// Returns `None` for direct connections (including the case where the
/// recovered destination equals the socket's own local address) and on any
/// platform or socket where the option is unavailable.
#[cfg(target_os = "linux")]
pub fn original_destination(stream: &TcpStream) -> Option<SocketAddr> {
    use std::net::{IpAddr, Ipv4Addr};
    use std::os::unix::io::AsRawFd;

    const SO_ORIGINAL_DST: libc::c_int = 80;

    let fd = stream.as_raw_fd();
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return None;
    }
    if addr.sin_family != libc::AF_INET as libc::sa_family_t {
        return None;
    }

    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    let destination = SocketAddr::new(IpAddr::V4(ip), port);

    match stream.local_addr() {
        Ok(local) if local == destination => None,
        _ => Some(destination),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn original_destination(_stream: &TcpStream) -> Option<SocketAddr> {
    None
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn direct_connection_has_no_original_destination() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        assert_eq!(original_destination(&accepted), None);
    }
}
