//! CONCLAVE - Broadcast Channel
//! Unreliable cluster-wide announcements over UDP. Targets are either a
//! multicast group or an explicit list of peer sockets.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{ConclaveError, Result};
use crate::types::NodeIdentity;

use super::message::{decode_datagram, encode_datagram, Message};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct BroadcastChannel {
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
    /// Our advertised point-to-point address; datagrams claiming it are echoes.
    local: NodeIdentity,
}

impl BroadcastChannel {
    pub fn bind(bind: SocketAddr, targets: Vec<SocketAddr>, local: NodeIdentity) -> Result<Self> {
        let socket = UdpSocket::bind(bind)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        for target in &targets {
            if let IpAddr::V4(group) = target.ip() {
                if group.is_multicast() {
                    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
                    socket.set_multicast_loop_v4(true)?;
                    log::debug!("joined multicast group {}", group);
                }
            }
        }
        log::info!("broadcast channel on {} -> {:?}", socket.local_addr()?, targets);
        Ok(Self {
            socket,
            targets,
            local,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send to every target. Fails only if no target could be reached.
    pub fn send(&self, message: &Message) -> Result<()> {
        let datagram = encode_datagram(message)?;
        let mut delivered = 0;
        let mut last_error = None;
        for target in &self.targets {
            match self.socket.send_to(&datagram, target) {
                Ok(_) => delivered += 1,
                Err(e) => {
                    log::debug!("broadcast {} to {} failed: {}", message.kind(), target, e);
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if delivered == 0 => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn is_echo(&self, message: &Message) -> bool {
        message.sender() == self.local.id
            || message.source() == Some((self.local.address.as_str(), self.local.port))
    }

    /// Receive one datagram. `Ok(None)` on timeout or for echoes of our own sends.
    pub fn receive(&self) -> Result<Option<Message>> {
        let mut buf = [0u8; 65_536];
        let (len, from) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        let message = match decode_datagram(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                return Err(ConclaveError::Protocol(format!(
                    "bad datagram from {from}: {e}"
                )))
            }
        };
        if self.is_echo(&message) {
            return Ok(None);
        }
        log::trace!("{} broadcast from {}", message.kind(), from);
        Ok(Some(message))
    }

    /// Run a receive loop on its own thread until `stop` is set.
    pub fn listen(
        self: &Arc<Self>,
        stop: Arc<AtomicBool>,
        handler: impl Fn(Message) + Send + 'static,
    ) -> Result<JoinHandle<()>> {
        let channel = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("broadcast".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    match channel.receive() {
                        Ok(Some(message)) => handler(message),
                        Ok(None) => {}
                        Err(ConclaveError::Protocol(reason)) => log::warn!("{}", reason),
                        Err(e) => {
                            log::error!("broadcast receive failed: {}", e);
                            thread::sleep(POLL_INTERVAL);
                        }
                    }
                }
                log::debug!("broadcast listener stopped");
            })?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[test]
    fn test_unicast_targets_receive() {
        let b = BroadcastChannel::bind(loopback(), vec![], NodeIdentity::new("b", "127.0.0.1", 2)).unwrap();
        let b_addr = b.local_addr().unwrap();
        let a = BroadcastChannel::bind(loopback(), vec![b_addr], NodeIdentity::new("a", "127.0.0.1", 1)).unwrap();

        let message = Message::request_leader(&NodeIdentity::new("a", "127.0.0.1", 1));
        a.send(&message).unwrap();

        let mut received = None;
        for _ in 0..25 {
            if let Some(m) = b.receive().unwrap() {
                received = Some(m);
                break;
            }
        }
        assert_eq!(received, Some(message));
    }

    #[test]
    fn test_own_echo_ignored() {
        let identity = NodeIdentity::new("a", "127.0.0.1", 1);
        let probe = UdpSocket::bind(loopback()).unwrap();
        let a = BroadcastChannel::bind(loopback(), vec![], identity.clone()).unwrap();
        let datagram = encode_datagram(&Message::request_leader(&identity)).unwrap();
        probe.send_to(&datagram, a.local_addr().unwrap()).unwrap();
        assert_eq!(a.receive().unwrap(), None);
    }

    #[test]
    fn test_corrupt_datagram_is_protocol_fault() {
        let probe = UdpSocket::bind(loopback()).unwrap();
        let a = BroadcastChannel::bind(loopback(), vec![], NodeIdentity::new("a", "127.0.0.1", 1)).unwrap();
        probe.send_to(&[0, 1, 2, 3, 4, 5], a.local_addr().unwrap()).unwrap();
        assert!(matches!(a.receive(), Err(ConclaveError::Protocol(_))));
    }
}
