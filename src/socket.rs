//! UDP socket construction and option plumbing shared by the collector
//! ports and the reflector.

use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::debug;

/// Receive buffer size for probe sockets. The kernel default does not keep
/// up with a full port fleet at steady probe rates.
pub const DEFAULT_RECV_BUFFER: usize = 2 * 1024 * 1024;

/// Create a UDP socket bound to `bind`, configured for the probe pipeline:
/// blocking with `read_timeout` as the receive deadline, an enlarged
/// receive buffer, the requested ToS marking, and kernel RX timestamps
/// where available.
pub fn bind_udp(bind: SocketAddr, tos: u8, read_timeout: Duration) -> Result<Socket> {
    let domain = if bind.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create UDP socket")?;

    socket.set_nonblocking(false)?;
    socket.set_read_timeout(Some(read_timeout))?;
    socket.set_recv_buffer_size(DEFAULT_RECV_BUFFER)?;
    set_tos(&socket, tos, bind.is_ipv6())?;

    // RX timestamps are opportunistic: not consumed by the statistics yet,
    // and not available on every platform.
    if let Err(e) = enable_rx_timestamps(&socket) {
        debug!(error = %e, "kernel RX timestamps unavailable");
    }

    socket
        .bind(&SockAddr::from(bind))
        .with_context(|| format!("failed to bind UDP socket to {bind}"))?;
    Ok(socket)
}

/// Set the ToS/traffic-class byte on a socket.
pub fn set_tos(socket: &Socket, tos: u8, ipv6: bool) -> Result<()> {
    if ipv6 {
        socket.set_tclass_v6(tos as u32)?;
    } else {
        socket.set_tos(tos as u32)?;
    }
    Ok(())
}

/// Read back the current ToS/traffic-class byte.
pub fn tos(socket: &Socket, ipv6: bool) -> Result<u8> {
    let value = if ipv6 {
        socket.tclass_v6()?
    } else {
        socket.tos()?
    };
    Ok(value as u8)
}

/// Ask the kernel to record receive timestamps for this socket.
#[cfg(target_os = "linux")]
pub fn enable_rx_timestamps(socket: &Socket) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPNS,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn enable_rx_timestamps(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_TIMESTAMPNS requires Linux",
    ))
}

/// Local address the socket is bound to.
pub fn local_addr(socket: &Socket) -> Result<SocketAddr> {
    socket
        .local_addr()?
        .as_socket()
        .ok_or_else(|| anyhow!("socket has no inet local address"))
}

/// Send one datagram. The plain io::Error is surfaced so callers can sort
/// transient conditions from fatal ones.
pub fn send_to(socket: &Socket, data: &[u8], dst: SocketAddr) -> io::Result<usize> {
    socket.send_to(data, &SockAddr::from(dst))
}

/// Receive one datagram into `buf`, returning the filled length and the
/// sender. Timeouts surface as `WouldBlock`/`TimedOut`.
pub fn recv_from(socket: &Socket, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    // socket2 wants MaybeUninit; the buffer is caller-initialized.
    let uninit: &mut [MaybeUninit<u8>] = unsafe {
        std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len())
    };
    let (len, addr) = socket.recv_from(uninit)?;
    let peer = addr
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet sender address"))?;
    Ok((len, peer))
}

/// True when a receive error is just the read deadline firing.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
