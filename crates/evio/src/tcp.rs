//! TCP sources: outgoing connections and listening servers
//!
//! Name resolution, `connect`, and `bind` all block, so each runs in a
//! job. The resulting descriptor is handed back to the loop in
//! non-blocking mode.

use crate::net::addr_to_sockaddr;
use crate::server::Server;
use crate::stream::Stream;

use evio_core::{kdebug, Error, Result};
use evio_runtime::sys::{cvt, set_nonblocking};
use evio_runtime::Handle;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

const UNRESOLVED: Error = Error::InvalidArgument("could not resolve host");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }

    fn any(self) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    fn domain(self) -> libc::c_int {
        match self {
            Family::V4 => libc::AF_INET,
            Family::V6 => libc::AF_INET6,
        }
    }
}

/// Connect to `host:port`, trying each resolved address in turn.
pub async fn tcp_connect(host: &str, port: u16) -> Result<Stream> {
    let handle = Handle::current()?;
    let host = host.to_owned();
    let sock = handle
        .execute(move || -> Result<TcpStream> {
            let addrs = (host.as_str(), port).to_socket_addrs().map_err(|_| UNRESOLVED)?;
            let mut last = UNRESOLVED;
            for addr in addrs {
                match TcpStream::connect(addr) {
                    Ok(sock) => return Ok(sock),
                    Err(e) => last = e.into(),
                }
            }
            Err(last)
        })
        .await??;
    kdebug!("connected fd {} to port {}", sock.as_raw_fd(), port);
    set_nonblocking(sock.as_raw_fd(), true)?;
    Stream::attach(handle, sock.into_raw_fd(), true)
}

/// Listen on an IPv4 address. `"*"` or `""` binds every interface.
pub async fn tcp4_listen(host: &str, port: u16, backlog: i32) -> Result<Server> {
    listen(Family::V4, host, port, backlog).await
}

/// Listen on an IPv6 address (v6 only). `"*"` or `""` binds every
/// interface.
pub async fn tcp6_listen(host: &str, port: u16, backlog: i32) -> Result<Server> {
    listen(Family::V6, host, port, backlog).await
}

async fn listen(family: Family, host: &str, port: u16, backlog: i32) -> Result<Server> {
    let handle = Handle::current()?;
    let host = host.to_owned();
    let fd = handle
        .execute(move || -> Result<OwnedFd> {
            let addr = resolve(family, &host, port)?;
            bind_listener(family, &addr, backlog)
        })
        .await??;
    Server::attach(handle, fd.into_raw_fd())
}

fn resolve(family: Family, host: &str, port: u16) -> Result<SocketAddr> {
    if host.is_empty() || host == "*" {
        return Ok(SocketAddr::new(family.any(), port));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|_| UNRESOLVED)?
        .find(|a| family.matches(a))
        .ok_or(UNRESOLVED)
}

fn bind_listener(family: Family, addr: &SocketAddr, backlog: i32) -> Result<OwnedFd> {
    let raw = cvt(unsafe { libc::socket(family.domain(), libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) })?;
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    set_flag(raw, libc::SOL_SOCKET, libc::SO_REUSEADDR)?;
    if family == Family::V6 {
        set_flag(raw, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY)?;
    }
    let (storage, len) = addr_to_sockaddr(addr);
    cvt(unsafe { libc::bind(raw, &storage as *const _ as *const libc::sockaddr, len) })?;
    cvt(unsafe { libc::listen(raw, backlog) })?;
    set_nonblocking(raw, true)?;
    Ok(fd)
}

fn set_flag(fd: RawFd, level: libc::c_int, name: libc::c_int) -> Result<()> {
    let on: libc::c_int = 1;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &on as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}
