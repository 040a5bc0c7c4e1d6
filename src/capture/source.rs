//! UDP datagram input
//!
//! Binds a socket for the configured input address, joins the multicast group
//! when the address is one, and reads datagrams with a timeout.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::config::{AddressFamily, InputUrl};
use crate::error::InputError;

/// A blocking source of datagrams
pub trait DatagramSource {
    /// Read one datagram into `buf`.
    ///
    /// A read timeout is reported as an error of kind `WouldBlock` or `TimedOut`.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// True for the error kinds a socket read timeout produces
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Socket-backed datagram source
pub struct UdpSource {
    socket: Socket,
    local: SocketAddr,
}

impl UdpSource {
    /// Resolve, bind and (for multicast addresses) join the input group
    pub fn connect(
        url: &InputUrl,
        family: AddressFamily,
        read_timeout: Duration,
        recv_buffer_size: usize,
    ) -> Result<Self, InputError> {
        tracing::info!("Connecting input to {} port {}", url.host, url.port);

        let candidates: Vec<SocketAddr> = (url.host.as_str(), url.port)
            .to_socket_addrs()
            .map_err(|e| InputError::Resolve {
                host: url.host.clone(),
                port: url.port,
                reason: e.to_string(),
            })?
            .filter(|addr| match family {
                AddressFamily::Any => true,
                AddressFamily::V4 => addr.is_ipv4(),
                AddressFamily::V6 => addr.is_ipv6(),
            })
            .collect();

        if candidates.is_empty() {
            return Err(InputError::Resolve {
                host: url.host.clone(),
                port: url.port,
                reason: format!("no {:?} address", family),
            });
        }

        let mut last_err = None;
        for addr in candidates {
            match Self::bind(addr, read_timeout, recv_buffer_size) {
                Ok(source) => {
                    tracing::info!("Input connected on {}", source.local);
                    return Ok(source);
                }
                Err(e) => {
                    tracing::error!("bind: {}:{} ({}): {}", url.host, url.port, addr.ip(), e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| InputError::BindFailed(url.to_string())))
    }

    fn bind(
        addr: SocketAddr,
        read_timeout: Duration,
        recv_buffer_size: usize,
    ) -> Result<Self, InputError> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| InputError::BindFailed(e.to_string()))?;

        socket
            .set_reuse_address(true)
            .map_err(|e| InputError::BindFailed(format!("SO_REUSEADDR: {}", e)))?;

        // Best effort, the kernel may clamp it.
        if let Err(e) = socket.set_recv_buffer_size(recv_buffer_size) {
            tracing::warn!("Can not set receive buffer to {} bytes: {}", recv_buffer_size, e);
        }

        socket
            .set_read_timeout(Some(read_timeout))
            .map_err(|e| InputError::BindFailed(format!("SO_RCVTIMEO: {}", e)))?;

        socket
            .bind(&SockAddr::from(addr))
            .map_err(|e| InputError::BindFailed(format!("{}: {}", addr, e)))?;

        match addr.ip() {
            IpAddr::V4(group) if group.is_multicast() => {
                socket
                    .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
                    .map_err(|e| {
                        InputError::JoinFailed(format!("IP_ADD_MEMBERSHIP {}: {}", group, e))
                    })?;
                tracing::info!("Joined multicast group {}", group);
            }
            IpAddr::V6(group) if group.is_multicast() => {
                socket
                    .join_multicast_v6(&group, 0)
                    .map_err(|e| {
                        InputError::JoinFailed(format!("IPV6_ADD_MEMBERSHIP {}: {}", group, e))
                    })?;
                tracing::info!("Joined multicast group {}", group);
            }
            _ => {}
        }

        let local = socket
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .unwrap_or(addr);

        Ok(Self { socket, local })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl DatagramSource for UdpSource {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.read(buf)
    }
}
