//! LAN peer discovery via UDP broadcast beacons.
//!
//! A beacon is a fixed 22-byte packet: the `ZRE` signature, a version byte,
//! the sender's 16-byte uuid and its mailbox port in network byte order. A
//! mailbox port of 0 announces that the sender is leaving.
//!
//! [`BeaconSocket`] only does framing and I/O. It is polled from the node's
//! event loop, which decides when to send and what to do with what arrives.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use crate::error::NetworkError;
use crate::identity::PeerId;

/// Protocol signature at the start of every beacon.
pub const BEACON_SIGNATURE: [u8; 3] = *b"ZRE";
/// Beacon format version.
pub const BEACON_VERSION: u8 = 0x01;
/// Size of an encoded beacon.
pub const BEACON_SIZE: usize = 22;

/// One decoded beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub peer_id: PeerId,
    /// Mailbox port of the sender; 0 means the sender is shutting down.
    pub mailbox_port: u16,
}

impl Beacon {
    pub fn new(peer_id: PeerId, mailbox_port: u16) -> Self {
        Self {
            peer_id,
            mailbox_port,
        }
    }

    /// Whether this is a leave announcement.
    pub fn is_leaving(&self) -> bool {
        self.mailbox_port == 0
    }

    pub fn encode(&self) -> [u8; BEACON_SIZE] {
        let mut buf = [0u8; BEACON_SIZE];
        buf[..3].copy_from_slice(&BEACON_SIGNATURE);
        buf[3] = BEACON_VERSION;
        buf[4..20].copy_from_slice(self.peer_id.as_bytes());
        buf[20..22].copy_from_slice(&self.mailbox_port.to_be_bytes());
        buf
    }

    /// Decode a packet. Foreign or malformed packets yield `None`.
    pub fn decode(packet: &[u8]) -> Option<Self> {
        if packet.len() != BEACON_SIZE
            || packet[..3] != BEACON_SIGNATURE
            || packet[3] != BEACON_VERSION
        {
            return None;
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&packet[4..20]);
        let mailbox_port = u16::from_be_bytes([packet[20], packet[21]]);
        Some(Self {
            peer_id: PeerId::from_bytes(uuid),
            mailbox_port,
        })
    }
}

/// A beacon that arrived from the network.
#[derive(Debug, Clone, Copy)]
pub struct ReceivedBeacon {
    pub beacon: Beacon,
    /// Source address of the UDP packet.
    pub source_addr: SocketAddr,
}

impl ReceivedBeacon {
    /// Mailbox endpoint the beacon points at.
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.source_addr.ip(), self.beacon.mailbox_port)
    }
}

/// Broadcast target and mailbox host resolved from the configured interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconRoute {
    /// Address our own beacons are sent to.
    pub broadcast: Ipv4Addr,
    /// Address on the selected interface, if one was selected. The mailbox
    /// binds to it so peers reach us only through that interface.
    pub local: Option<Ipv4Addr>,
}

impl BeaconRoute {
    /// Resolve the route for an optional interface name and explicit target.
    pub fn resolve(interface: Option<&str>, beacon_addr: Option<Ipv4Addr>) -> Result<Self, NetworkError> {
        let Some(name) = interface else {
            return Ok(Self {
                broadcast: beacon_addr.unwrap_or(Ipv4Addr::BROADCAST),
                local: None,
            });
        };

        let interfaces = get_if_addrs::get_if_addrs()
            .map_err(|e| NetworkError::Beacon(format!("List interfaces: {e}")))?;
        let v4 = interfaces
            .into_iter()
            .filter(|iface| iface.name == name)
            .find_map(|iface| match iface.addr {
                get_if_addrs::IfAddr::V4(addr) => Some(addr),
                get_if_addrs::IfAddr::V6(_) => None,
            })
            .ok_or_else(|| NetworkError::Config(format!("No IPv4 interface named '{name}'")))?;

        Ok(Self {
            broadcast: beacon_addr
                .or(v4.broadcast)
                .unwrap_or(Ipv4Addr::BROADCAST),
            local: Some(v4.ip),
        })
    }
}

/// UDP socket that sends and receives beacons on a shared port.
pub struct BeaconSocket {
    socket: UdpSocket,
    target: SocketAddr,
    own_id: PeerId,
}

impl BeaconSocket {
    /// Bind the beacon port with address reuse so several nodes on one host
    /// can share it.
    pub fn bind(port: u16, route: BeaconRoute, own_id: PeerId) -> Result<Self, NetworkError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| NetworkError::Beacon(format!("Create socket: {e}")))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| NetworkError::Beacon(format!("Set reuse address: {e}")))?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket
            .set_reuse_port(true)
            .map_err(|e| NetworkError::Beacon(format!("Set reuse port: {e}")))?;
        socket
            .set_broadcast(true)
            .map_err(|e| NetworkError::Beacon(format!("Set broadcast: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| NetworkError::Beacon(format!("Set nonblocking: {e}")))?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket
            .bind(&SockAddr::from(bind_addr))
            .map_err(|e| NetworkError::Beacon(format!("Bind {bind_addr} failed: {e}")))?;

        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| NetworkError::Beacon(format!("Register socket: {e}")))?;
        let target = SocketAddr::new(IpAddr::V4(route.broadcast), port);
        info!("Beacon socket listening on {bind_addr}, broadcasting to {target}");

        Ok(Self {
            socket,
            target,
            own_id,
        })
    }

    /// Broadcast one beacon. Delivery is best effort.
    pub async fn send(&self, mailbox_port: u16) -> Result<(), NetworkError> {
        let packet = Beacon::new(self.own_id, mailbox_port).encode();
        self.socket
            .send_to(&packet, self.target)
            .await
            .map_err(|e| NetworkError::Beacon(format!("Send to {}: {e}", self.target)))?;
        trace!("Beacon sent to {}", self.target);
        Ok(())
    }

    /// Wait for the next valid beacon from another node.
    ///
    /// Foreign packets and our own beacons are skipped silently. Cancel safe.
    pub async fn recv(&self) -> Result<ReceivedBeacon, NetworkError> {
        let mut buf = [0u8; 256];
        loop {
            let (len, source_addr) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| NetworkError::Beacon(format!("Receive: {e}")))?;

            let Some(beacon) = Beacon::decode(&buf[..len]) else {
                trace!("Ignoring {len}-byte foreign packet from {source_addr}");
                continue;
            };
            if beacon.peer_id == self.own_id {
                continue;
            }
            debug!("Beacon from {} at {source_addr}", beacon.peer_id);
            return Ok(ReceivedBeacon {
                beacon,
                source_addr,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_layout() {
        let id = PeerId::from_bytes([7; 16]);
        let packet = Beacon::new(id, 0x1234).encode();
        assert_eq!(packet.len(), 22);
        assert_eq!(&packet[..3], b"ZRE");
        assert_eq!(packet[3], 1);
        assert_eq!(&packet[4..20], &[7; 16]);
        assert_eq!(&packet[20..], &[0x12, 0x34]);
        assert_eq!(Beacon::decode(&packet), Some(Beacon::new(id, 0x1234)));
    }

    #[test]
    fn test_foreign_packets_discarded() {
        let mut packet = Beacon::new(PeerId::generate(), 5670).encode();
        assert!(Beacon::decode(&packet[..21]).is_none());

        packet[0] = b'X';
        assert!(Beacon::decode(&packet).is_none());

        let mut wrong_version = Beacon::new(PeerId::generate(), 5670).encode();
        wrong_version[3] = 2;
        assert!(Beacon::decode(&wrong_version).is_none());

        let mut long = Beacon::new(PeerId::generate(), 5670).encode().to_vec();
        long.push(0);
        assert!(Beacon::decode(&long).is_none());
    }

    #[test]
    fn test_leave_beacon() {
        assert!(Beacon::new(PeerId::generate(), 0).is_leaving());
        assert!(!Beacon::new(PeerId::generate(), 1).is_leaving());
    }

    #[test]
    fn test_received_endpoint_uses_source_ip() {
        let received = ReceivedBeacon {
            beacon: Beacon::new(PeerId::generate(), 4000),
            source_addr: "10.0.0.9:5670".parse().unwrap(),
        };
        assert_eq!(received.endpoint(), "10.0.0.9:4000".parse().unwrap());
    }

    #[test]
    fn test_route_without_interface() {
        let route = BeaconRoute::resolve(None, None).unwrap();
        assert_eq!(route.broadcast, Ipv4Addr::BROADCAST);
        assert!(route.local.is_none());

        let route = BeaconRoute::resolve(None, Some(Ipv4Addr::new(127, 255, 255, 255))).unwrap();
        assert_eq!(route.broadcast, Ipv4Addr::new(127, 255, 255, 255));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_route_for_loopback_interface() {
        let route = BeaconRoute::resolve(Some("lo"), Some(Ipv4Addr::new(127, 255, 255, 255))).unwrap();
        assert_eq!(route.local, Some(Ipv4Addr::LOCALHOST));
        assert_eq!(route.broadcast, Ipv4Addr::new(127, 255, 255, 255));
    }

    #[test]
    fn test_route_unknown_interface_fails() {
        let result = BeaconRoute::resolve(Some("no-such-iface0"), None);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_beacon_udp_loopback() {
        // Send straight at a bound socket; skips broadcast routing entirely.
        let own = PeerId::generate();
        let route = BeaconRoute {
            broadcast: Ipv4Addr::LOCALHOST,
            local: None,
        };
        let receiver = BeaconSocket::bind(0, route, own).unwrap();
        let port = receiver.socket.local_addr().unwrap().port();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let other = PeerId::generate();

        // Noise, our own beacon, then a real one.
        sender.send_to(b"hello", ("127.0.0.1", port)).await.unwrap();
        sender
            .send_to(&Beacon::new(own, 1).encode(), ("127.0.0.1", port))
            .await
            .unwrap();
        sender
            .send_to(&Beacon::new(other, 4242).encode(), ("127.0.0.1", port))
            .await
            .unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(2), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.beacon.peer_id, other);
        assert_eq!(received.endpoint().port(), 4242);
    }
}
