use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, warn};

use super::packet::{ECHO_PAYLOAD, EchoMatcher, IcmpFamily, ReplyMatch, encode_echo, ipv4_payload};
use super::resolve::{IpPreference, resolve_target};
use super::sequence::IcmpSequencer;

const READ_BUFFER: usize = 1500;

/// Datagram I/O used by the echo read loop.
#[async_trait]
pub trait EchoSocket: Send + Sync {
    async fn send_to(&self, packet: &[u8], target: SocketAddr) -> io::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl EchoSocket for UdpSocket {
    async fn send_to(&self, packet: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, packet, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }
}

/// Sends one echo request per call and waits for the matching reply.
#[derive(Debug, Clone)]
pub struct IcmpProber {
    sequencer: Arc<IcmpSequencer>,
    preference: IpPreference,
}

impl IcmpProber {
    pub fn new(sequencer: Arc<IcmpSequencer>, preference: IpPreference) -> Self {
        Self { sequencer, preference }
    }

    /// Probe `target` once. Returns the round-trip time and whether a matching
    /// reply arrived before `limit` elapsed. Failures are logged, never raised.
    pub async fn probe(&self, limit: Duration, target: &str) -> (Duration, bool) {
        let ip = match resolve_target(target, self.preference, limit).await {
            Ok(ip) => ip,
            Err(err) => {
                error!(host = %target, error = %err, "icmp target resolution failed");
                return (Duration::ZERO, false);
            }
        };

        let family = IcmpFamily::of(&ip);
        let (socket, privileged) = match open_socket(family) {
            Ok(opened) => opened,
            Err(err) => {
                error!(host = %target, error = %err, "failed to open icmp socket");
                return (Duration::ZERO, false);
            }
        };
        // datagram sockets on linux rewrite the echo identifier
        let id_unknown = !privileged && cfg!(target_os = "linux");

        let request = encode_echo(
            family,
            family.request_type(),
            self.sequencer.id(),
            self.sequencer.next_sequence(),
            ECHO_PAYLOAD,
        );
        let matcher = EchoMatcher::new(&request, ip, id_unknown);

        let sent_at = Instant::now();
        if let Err(err) = EchoSocket::send_to(&socket, &request, SocketAddr::new(ip, 0)).await {
            warn!(host = %target, error = %err, "failed to send echo request");
            return (Duration::ZERO, false);
        }

        // raw v4 sockets, and datagram ones on macos, deliver the IP header too;
        // the header is recognised by its version nibble and bare replies pass through
        let strip_ip_header = family == IcmpFamily::V4;
        match await_reply(&socket, &matcher, sent_at, limit, strip_ip_header).await {
            Some(rtt) => (rtt, true),
            None => (Duration::ZERO, false),
        }
    }
}

/// Read until a packet matches or the deadline passes.
///
/// The deadline is absolute, so unrelated traffic cannot extend the wait.
pub async fn await_reply<S>(
    socket: &S,
    matcher: &EchoMatcher,
    sent_at: Instant,
    limit: Duration,
    strip_ip_header: bool,
) -> Option<Duration>
where
    S: EchoSocket + ?Sized,
{
    let deadline = sent_at + limit;
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let (len, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => {
                debug!(peer = %matcher.peer(), "timed out waiting for echo reply");
                return None;
            }
            Ok(Err(err)) if err.kind() == io::ErrorKind::TimedOut => return None,
            Ok(Err(err)) => {
                error!(error = %err, "failed to read echo reply");
                tokio::task::yield_now().await;
                continue;
            }
            Ok(Ok(read)) => read,
        };

        let packet = &mut buf[..len];
        let packet = if strip_ip_header { ipv4_payload(packet) } else { packet };
        match matcher.inspect(from.ip(), packet) {
            ReplyMatch::Matched => return Some(sent_at.elapsed()),
            ReplyMatch::UnexpectedPeer => {
                debug!(peer = %from, "ignoring packet from unexpected peer");
            }
            ReplyMatch::Mismatch => {}
        }
    }
}

/// Open an ICMP socket, trying the unprivileged datagram flavour first where the
/// platform supports it. The flag tells whether the raw socket was used.
fn open_socket(family: IcmpFamily) -> io::Result<(UdpSocket, bool)> {
    let (domain, protocol) = match family {
        IcmpFamily::V4 => (Domain::IPV4, Protocol::ICMPV4),
        IcmpFamily::V6 => (Domain::IPV6, Protocol::ICMPV6),
    };

    if cfg!(any(target_os = "linux", target_os = "macos")) {
        match Socket::new(domain, Type::DGRAM, Some(protocol)) {
            Ok(socket) => return Ok((into_tokio(socket)?, false)),
            Err(err) => debug!(error = %err, "unprivileged icmp socket unavailable, trying raw"),
        }
    }

    let socket = Socket::new(domain, Type::RAW, Some(protocol))?;
    Ok((into_tokio(socket)?, true))
}

fn into_tokio(socket: Socket) -> io::Result<UdpSocket> {
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icmp::packet::{ICMPV4_ECHO_REPLY, ICMPV4_ECHO_REQUEST};
    use std::collections::VecDeque;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7));

    /// Hands out queued datagrams, then blocks forever.
    struct ScriptedSocket {
        inbound: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
    }

    impl ScriptedSocket {
        fn new(packets: Vec<(Vec<u8>, IpAddr)>) -> Self {
            let inbound = packets
                .into_iter()
                .map(|(bytes, ip)| (bytes, SocketAddr::new(ip, 0)))
                .collect();
            Self { inbound: Mutex::new(inbound) }
        }
    }

    #[async_trait]
    impl EchoSocket for ScriptedSocket {
        async fn send_to(&self, packet: &[u8], _target: SocketAddr) -> io::Result<usize> {
            Ok(packet.len())
        }

        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            let next = self.inbound.lock().unwrap().pop_front();
            match next {
                Some((bytes, from)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok((bytes.len(), from))
                }
                None => std::future::pending().await,
            }
        }
    }

    fn request() -> Vec<u8> {
        encode_echo(IcmpFamily::V4, ICMPV4_ECHO_REQUEST, 0x0102, 11, ECHO_PAYLOAD)
    }

    fn reply() -> Vec<u8> {
        encode_echo(IcmpFamily::V4, ICMPV4_ECHO_REPLY, 0x0102, 11, ECHO_PAYLOAD)
    }

    #[tokio::test]
    async fn test_reply_after_noise_is_found() {
        let other = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 8));
        let socket = ScriptedSocket::new(vec![
            (reply(), other),
            (b"garbage".to_vec(), PEER),
            (reply(), PEER),
        ]);
        let matcher = EchoMatcher::new(&request(), PEER, false);

        let rtt = await_reply(&socket, &matcher, Instant::now(), Duration::from_secs(1), false).await;
        assert!(rtt.is_some());
    }

    #[tokio::test]
    async fn test_deadline_bounds_the_wait() {
        let socket = ScriptedSocket::new(vec![(b"noise".to_vec(), PEER)]);
        let matcher = EchoMatcher::new(&request(), PEER, false);

        let started = Instant::now();
        let rtt = await_reply(&socket, &matcher, started, Duration::from_millis(50), false).await;
        assert!(rtt.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_foreign_peers_do_not_extend_the_deadline() {
        let other = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 8));
        let socket = ScriptedSocket::new(vec![(reply(), other), (reply(), other), (reply(), other)]);
        let matcher = EchoMatcher::new(&request(), PEER, false);

        let started = Instant::now();
        let rtt = await_reply(&socket, &matcher, started, Duration::from_millis(50), false).await;
        assert!(rtt.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_datagram_reply_with_and_without_ip_header() {
        let request = encode_echo(IcmpFamily::V4, ICMPV4_ECHO_REQUEST, 0x0102, 12, ECHO_PAYLOAD);
        let matcher = EchoMatcher::new(&request, PEER, true);
        let bare = encode_echo(IcmpFamily::V4, ICMPV4_ECHO_REPLY, 0x7777, 12, ECHO_PAYLOAD);
        let mut framed = vec![0u8; 20];
        framed[0] = 0x45;
        framed.extend_from_slice(&bare);

        let socket = ScriptedSocket::new(vec![(framed, PEER)]);
        let rtt = await_reply(&socket, &matcher, Instant::now(), Duration::from_secs(1), true).await;
        assert!(rtt.is_some());

        let socket = ScriptedSocket::new(vec![(bare, PEER)]);
        let rtt = await_reply(&socket, &matcher, Instant::now(), Duration::from_secs(1), true).await;
        assert!(rtt.is_some());
    }

    #[tokio::test]
    async fn test_raw_reply_with_ip_header() {
        let mut framed = vec![0u8; 20];
        framed[0] = 0x45;
        framed.extend_from_slice(&reply());
        let socket = ScriptedSocket::new(vec![(framed, PEER)]);
        let matcher = EchoMatcher::new(&request(), PEER, false);

        let rtt = await_reply(&socket, &matcher, Instant::now(), Duration::from_secs(1), true).await;
        assert!(rtt.is_some());
    }
}
