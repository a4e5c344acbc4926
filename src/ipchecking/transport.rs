use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{IpAddr, Ipv6Addr, SocketAddrV6};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use crate::ipchecking::packet::ETH_P_ARP;

/// A datagram channel bound to one interface.
pub trait PacketTransport: Send {
    /// `dest` is the IP-level destination; link-layer transports ignore it
    /// because the frame already carries its addressing.
    fn send(&mut self, packet: &[u8], dest: IpAddr) -> io::Result<()>;

    /// `Ok(None)` when nothing arrived within `timeout`.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;
}

fn recv_with_timeout(
    socket: &Socket,
    buf: &mut [u8],
    timeout: Duration,
) -> io::Result<Option<usize>> {
    // A zero read timeout means "block forever" to the kernel.
    socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
    let mut reader = socket;
    match reader.read(buf) {
        Ok(n) => Ok(Some(n)),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// AF_PACKET socket receiving only ARP on one interface.
pub struct ArpSocket {
    socket: Socket,
}

impl ArpSocket {
    pub fn open(ifindex: u32) -> io::Result<Self> {
        let proto = i32::from(ETH_P_ARP.to_be());
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(proto)))?;

        let ifindex = i32::try_from(ifindex)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface index out of range"))?;
        // Bind to interface using raw libc bind; socket2 has no sockaddr_ll constructor.
        let addr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: ETH_P_ARP.to_be(),
            sll_ifindex: ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: [0; 8],
        };
        let ret = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { socket })
    }
}

impl PacketTransport for ArpSocket {
    fn send(&mut self, packet: &[u8], _dest: IpAddr) -> io::Result<()> {
        self.socket.send(packet).map(|_| ())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        recv_with_timeout(&self.socket, buf, timeout)
    }
}

/// Raw ICMPv6 socket pinned to one interface and sourced from its
/// link-local address, as neighbor discovery requires.
pub struct NdpSocket {
    socket: Socket,
    ifindex: u32,
}

impl NdpSocket {
    pub fn open(iface: &str, ifindex: u32, link_local: Ipv6Addr) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
        socket.bind_device(Some(iface.as_bytes()))?;
        socket.set_multicast_if_v6(ifindex)?;
        // RFC 4861: neighbor discovery packets must carry hop limit 255.
        socket.set_multicast_hops_v6(255)?;
        socket.set_unicast_hops_v6(255)?;
        // Our own stack would otherwise answer for the address under test.
        socket.set_multicast_loop_v6(false)?;
        socket.bind(&SockAddr::from(SocketAddrV6::new(link_local, 0, 0, ifindex)))?;
        Ok(Self { socket, ifindex })
    }
}

impl PacketTransport for NdpSocket {
    fn send(&mut self, packet: &[u8], dest: IpAddr) -> io::Result<()> {
        let dest = match dest {
            IpAddr::V6(v6) => v6,
            IpAddr::V4(v4) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("NDP destination {} is not IPv6", v4),
                ))
            }
        };
        let addr = SockAddr::from(SocketAddrV6::new(dest, 0, 0, self.ifindex));
        self.socket.send_to(packet, &addr).map(|_| ())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        recv_with_timeout(&self.socket, buf, timeout)
    }
}
