use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::error::{Error, Result};

/// Read timeout on the receive loop; bounds how long `close()` waits for it
pub const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receive buffer requested for ICMP sockets
const RECV_BUFFER_SIZE: usize = 1024 * 1024;

/// Socket with metadata about type (for DGRAM-aware parsing)
#[derive(Debug)]
pub struct SocketInfo {
    pub socket: Socket,
    /// True if SOCK_DGRAM (no IP header in received packets)
    pub is_dgram: bool,
}

fn icmp_domain(ipv6: bool) -> (Domain, Protocol) {
    if ipv6 {
        (Domain::IPV6, Protocol::ICMPV6)
    } else {
        (Domain::IPV4, Protocol::ICMPV4)
    }
}

/// Create a raw ICMP socket (requires CAP_NET_RAW or root)
pub fn create_raw_icmp_socket(ipv6: bool) -> io::Result<Socket> {
    let (domain, protocol) = icmp_domain(ipv6);
    let socket = Socket::new(domain, Type::RAW, Some(protocol))?;
    socket.set_nonblocking(false)?;
    socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
    Ok(socket)
}

/// Create an unprivileged ICMP socket (SOCK_DGRAM)
pub fn create_dgram_icmp_socket(ipv6: bool) -> io::Result<Socket> {
    let (domain, protocol) = icmp_domain(ipv6);
    let socket = Socket::new(domain, Type::DGRAM, Some(protocol))?;
    socket.set_nonblocking(false)?;
    socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
    Ok(socket)
}

/// Open the socket a raw backend sends and receives on.
///
/// Prefers RAW; falls back to unprivileged DGRAM ICMP. DGRAM sockets on Linux
/// only see echo replies, so TTL-exceeded hops show up as timeouts there.
pub fn open_icmp_socket(ipv6: bool) -> Result<SocketInfo> {
    match create_raw_icmp_socket(ipv6) {
        Ok(socket) => {
            grow_recv_buffer(&socket);
            return Ok(SocketInfo {
                socket,
                is_dgram: false,
            });
        }
        Err(e) => tracing::debug!(error = %e, "raw ICMP socket unavailable, trying DGRAM"),
    }

    match create_dgram_icmp_socket(ipv6) {
        Ok(socket) => {
            tracing::warn!("using unprivileged ICMP sockets; TTL-exceeded replies may not be seen");
            grow_recv_buffer(&socket);
            Ok(SocketInfo {
                socket,
                is_dgram: true,
            })
        }
        Err(e) => Err(Error::BackendUnavailable(permission_hint(&e))),
    }
}

/// Ask for a 1 MB receive buffer; the kernel default still works if refused
fn grow_recv_buffer(socket: &Socket) {
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
        tracing::warn!(error = %e, "could not set ICMP receive buffer to 1MB");
    }
}

fn permission_hint(e: &io::Error) -> String {
    let binary_path = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "hopwatch".to_string());
    format!(
        "cannot open ICMP socket ({e}). Run as root, grant the capability with \
         `sudo setcap cap_net_raw+ep {binary_path}`, enable unprivileged ICMP with \
         `sysctl -w net.ipv4.ping_group_range='0 65534'`, or use the process backend"
    )
}

/// Set the outgoing TTL (IPv4) or unicast hop limit (IPv6)
pub fn set_ttl(socket: &Socket, ttl: u8, ipv6: bool) -> io::Result<()> {
    if ipv6 {
        socket.set_unicast_hops_v6(ttl as u32)
    } else {
        socket.set_ttl(ttl as u32)
    }
}

/// Send ICMP packet to target
pub fn send_icmp(socket: &Socket, packet: &[u8], target: IpAddr) -> io::Result<usize> {
    let addr = SockAddr::from(SocketAddr::new(target, 0));
    socket.send_to(packet, &addr)
}

/// Received datagram length and source address
#[derive(Debug)]
pub struct RecvResult {
    pub len: usize,
    pub source: IpAddr,
}

/// Receive one ICMP packet. Returns WouldBlock/TimedOut when the poll interval lapses.
#[cfg(unix)]
pub fn recv_icmp(socket: &Socket, buffer: &mut [u8]) -> io::Result<RecvResult> {
    use std::os::unix::io::AsRawFd;

    let mut src_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut src_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let len = unsafe {
        libc::recvfrom(
            socket.as_raw_fd(),
            buffer.as_mut_ptr() as *mut libc::c_void,
            buffer.len(),
            0,
            &mut src_storage as *mut _ as *mut libc::sockaddr,
            &mut src_len,
        )
    };
    if len < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(RecvResult {
        len: len as usize,
        source: parse_sockaddr_storage(&src_storage)?,
    })
}

/// Parse sockaddr_storage to IpAddr
#[cfg(unix)]
fn parse_sockaddr_storage(storage: &libc::sockaddr_storage) -> io::Result<IpAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in = unsafe { &*(storage as *const _ as *const _) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Ok(IpAddr::V4(ip))
        }
        libc::AF_INET6 => {
            let addr: &libc::sockaddr_in6 = unsafe { &*(storage as *const _ as *const _) };
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Ok(IpAddr::V6(ip))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown address family: {family}"),
        )),
    }
}

/// True for the errors a read timeout produces
pub fn is_poll_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
