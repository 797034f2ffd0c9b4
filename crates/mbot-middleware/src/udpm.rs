//! [`UdpmBus`] – LCM over UDP multicast.
//!
//! Speaks the LCM short-message framing:
//!
//! ```text
//! u32 magic "LC02" | u32 sequence number | channel bytes | NUL | payload
//! ```
//!
//! Fragmented messages (`LC03`) are not reassembled; they are logged and
//! skipped.  Publishing a message too large for a single datagram fails.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use mbot_types::BridgeError;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};

use crate::transport::{BusMessage, BusTransport, ChannelFilter};

const MAGIC_SHORT: u32 = 0x4c43_3032;
const MAGIC_FRAGMENT: u32 = 0x4c43_3033;
const SHORT_HEADER_LEN: usize = 8;
/// Largest short message LCM will put in one datagram.
const SHORT_MESSAGE_MAX: usize = 65_499;
const CHANNEL_MAX: usize = 63;
const RECV_BUFFER: usize = 65_536;

pub const DEFAULT_URL: &str = "udpm://239.255.76.67:7667?ttl=1";

/// A parsed `udpm://group:port?ttl=N` address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpmAddress {
    pub group: Ipv4Addr,
    pub port: u16,
    pub ttl: u32,
}

impl UdpmAddress {
    /// Parse an LCM provider URL.  An empty string means the LCM default.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] for another provider, a malformed
    /// host or port, a non-multicast group, or an unknown option.
    pub fn parse(url: &str) -> Result<Self, BridgeError> {
        let url = if url.trim().is_empty() { DEFAULT_URL } else { url.trim() };
        let bad = |why: &str| BridgeError::Config(format!("bad LCM address {url:?}: {why}"));

        let rest = url
            .strip_prefix("udpm://")
            .ok_or_else(|| bad("only the udpm provider is supported"))?;
        let (target, query) = rest.split_once('?').unwrap_or((rest, ""));
        let target: SocketAddrV4 = target.parse().map_err(|_| bad("expected group:port"))?;
        if !target.ip().is_multicast() {
            return Err(bad("group is not a multicast address"));
        }

        let mut ttl = 0;
        for option in query.split('&').filter(|o| !o.is_empty()) {
            match option.split_once('=') {
                Some(("ttl", value)) => ttl = value.parse().map_err(|_| bad("ttl is not a number"))?,
                // LCM also accepts recv_buf_size; the kernel default is fine here.
                Some(("recv_buf_size", _)) => {}
                _ => return Err(bad(&format!("unknown option {option}"))),
            }
        }

        Ok(Self {
            group: *target.ip(),
            port: target.port(),
            ttl,
        })
    }

    fn destination(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }
}

pub struct UdpmBus {
    address: UdpmAddress,
    socket: UdpSocket,
    filter: Mutex<ChannelFilter>,
    /// Reused by every receive; only the bus thread reads.
    buffer: Mutex<Vec<u8>>,
    sequence: AtomicU32,
}

impl UdpmBus {
    /// Join the multicast group named by `url`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] for a bad URL and
    /// [`BridgeError::Transport`] when the socket cannot be set up.
    pub fn open(url: &str) -> Result<Self, BridgeError> {
        let address = UdpmAddress::parse(url)?;
        let socket = bind_multicast(&address)
            .map_err(|e| BridgeError::Transport(format!("cannot open LCM on {url}: {e}")))?;
        info!(group = %address.group, port = address.port, ttl = address.ttl, "joined LCM multicast group");
        Ok(Self {
            address,
            socket,
            filter: Mutex::new(ChannelFilter::new()),
            buffer: Mutex::new(vec![0u8; RECV_BUFFER]),
            sequence: AtomicU32::new(0),
        })
    }

    fn wants(&self, channel: &str) -> bool {
        self.filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .matches(channel)
    }
}

fn bind_multicast(address: &UdpmAddress) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // Several LCM processes share the port on one host.
    socket.set_reuse_address(true)?;
    let bind = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, address.port));
    socket.bind(&bind.into())?;
    socket.join_multicast_v4(&address.group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(address.ttl)?;
    Ok(socket.into())
}

/// Receive one datagram into `buf`.  `None` when the read timed out.
fn read_datagram(socket: &UdpSocket, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, BridgeError> {
    match socket.recv_from(buf) {
        Ok(received) => Ok(Some(received)),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(None),
        Err(e) => Err(BridgeError::Transport(format!("LCM receive failed: {e}"))),
    }
}

/// Split a short-message datagram into its channel and payload.
fn parse_datagram(buf: &[u8]) -> Result<Option<BusMessage>, String> {
    if buf.len() < SHORT_HEADER_LEN {
        return Err(format!("{}-byte datagram is shorter than the header", buf.len()));
    }
    let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    match magic {
        MAGIC_SHORT => {}
        MAGIC_FRAGMENT => return Ok(None),
        other => return Err(format!("bad magic {other:#010x}")),
    }
    let body = &buf[SHORT_HEADER_LEN..];
    let nul = body
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| "channel is not NUL-terminated".to_string())?;
    let channel = std::str::from_utf8(&body[..nul]).map_err(|e| format!("channel is not UTF-8: {e}"))?;
    Ok(Some(BusMessage::new(channel, &body[nul + 1..])))
}

fn build_datagram(sequence: u32, channel: &str, payload: &[u8]) -> Result<Vec<u8>, BridgeError> {
    if channel.len() > CHANNEL_MAX {
        return Err(BridgeError::Transport(format!(
            "channel name {channel:?} is longer than {CHANNEL_MAX} bytes"
        )));
    }
    let len = SHORT_HEADER_LEN + channel.len() + 1 + payload.len();
    if len > SHORT_MESSAGE_MAX {
        return Err(BridgeError::Transport(format!(
            "{}-byte message on {channel} needs fragmentation, which is not supported",
            payload.len()
        )));
    }
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(&MAGIC_SHORT.to_be_bytes());
    out.extend_from_slice(&sequence.to_be_bytes());
    out.extend_from_slice(channel.as_bytes());
    out.push(0);
    out.extend_from_slice(payload);
    Ok(out)
}

impl BusTransport for UdpmBus {
    fn subscribe(&self, pattern: &str) -> Result<(), BridgeError> {
        self.filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(pattern)
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<BusMessage>, BridgeError> {
        // A zero read timeout means "block forever" to the OS.
        let timeout = timeout.max(Duration::from_millis(1));
        self.socket
            .set_read_timeout(Some(timeout))
            .map_err(|e| BridgeError::Transport(e.to_string()))?;

        let mut buf = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some((len, peer)) = read_datagram(&self.socket, &mut buf)? else {
            return Ok(None);
        };

        match parse_datagram(&buf[..len]) {
            Ok(Some(message)) if self.wants(&message.channel) => Ok(Some(message)),
            Ok(Some(_)) => Ok(None),
            Ok(None) => {
                debug!(%peer, len, "skipping fragmented LCM message");
                Ok(None)
            }
            Err(why) => {
                debug!(%peer, len, reason = %why, "dropping malformed LCM datagram");
                Ok(None)
            }
        }
    }

    fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BridgeError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let datagram = build_datagram(sequence, channel, payload)?;
        self.socket
            .send_to(&datagram, self.address.destination())
            .map_err(|e| BridgeError::Transport(format!("LCM publish on {channel} failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_default_url() {
        let addr = UdpmAddress::parse(DEFAULT_URL).unwrap();
        assert_eq!(addr.group, Ipv4Addr::new(239, 255, 76, 67));
        assert_eq!(addr.port, 7667);
        assert_eq!(addr.ttl, 1);
        assert_eq!(UdpmAddress::parse("").unwrap(), addr);
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(UdpmAddress::parse("tcpq://127.0.0.1:7700").is_err());
        assert!(UdpmAddress::parse("udpm://10.0.0.1:7667").is_err());
        assert!(UdpmAddress::parse("udpm://239.255.76.67").is_err());
        assert!(UdpmAddress::parse("udpm://239.255.76.67:7667?ttl=x").is_err());
        assert!(UdpmAddress::parse("udpm://239.255.76.67:7667?colour=red").is_err());
    }

    #[test]
    fn ttl_defaults_to_zero() {
        assert_eq!(UdpmAddress::parse("udpm://239.255.76.67:7667").unwrap().ttl, 0);
    }

    #[test]
    fn datagram_framing() {
        let datagram = build_datagram(7, "ODOM", &[0xAA, 0xBB]).unwrap();
        assert_eq!(&datagram[..4], b"LC02");
        assert_eq!(&datagram[4..8], &7u32.to_be_bytes());
        assert_eq!(&datagram[8..13], b"ODOM\0");

        let parsed = parse_datagram(&datagram).unwrap().unwrap();
        assert_eq!(parsed, BusMessage::new("ODOM", vec![0xAA, 0xBB]));
    }

    #[test]
    fn fragments_and_garbage_are_skipped() {
        let mut fragment = b"LC03".to_vec();
        fragment.extend_from_slice(&[0; 16]);
        assert_eq!(parse_datagram(&fragment), Ok(None));
        assert!(parse_datagram(b"LC0").is_err());
        assert!(parse_datagram(b"XXXX\0\0\0\0ODOM\0").is_err());
        assert!(parse_datagram(b"LC02\0\0\0\0ODOM").is_err());
    }

    #[test]
    fn reused_buffer_only_yields_the_latest_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = receiver.local_addr().unwrap();

        sender.send_to(&build_datagram(0, "LIDAR", &[7; 512]).unwrap(), target).unwrap();
        sender.send_to(&build_datagram(1, "ODOM", &[1, 2]).unwrap(), target).unwrap();

        let mut buf = vec![0u8; RECV_BUFFER];
        let (first, _) = read_datagram(&receiver, &mut buf).unwrap().unwrap();
        assert_eq!(parse_datagram(&buf[..first]).unwrap().unwrap().payload.len(), 512);
        let (second, peer) = read_datagram(&receiver, &mut buf).unwrap().unwrap();
        assert_eq!(peer, sender.local_addr().unwrap());
        assert_eq!(
            parse_datagram(&buf[..second]).unwrap().unwrap(),
            BusMessage::new("ODOM", vec![1, 2])
        );

        receiver.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(read_datagram(&receiver, &mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_messages_are_refused() {
        let payload = vec![0u8; SHORT_MESSAGE_MAX];
        assert!(matches!(
            build_datagram(0, "BIG", &payload),
            Err(BridgeError::Transport(_))
        ));
        let long_channel = "C".repeat(CHANNEL_MAX + 1);
        assert!(build_datagram(0, &long_channel, b"").is_err());
    }
}
