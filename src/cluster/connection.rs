//! CONCLAVE - Point-to-Point Connections
//! Framed TCP channels between nodes and the directory tracking them.
//!
//! ## Handshake
//! The connecting side sends `Hello` first; the accepting side answers
//! with its own `Hello`. A connection is registered only after both
//! records have been exchanged.
//!
//! ## Duplicates
//! Two nodes that dial each other at the same time end up with two
//! connections. Both sides keep the one initiated by the smaller node id.
//! The other is retired rather than shut down: it stays readable until the
//! peer drops it or a grace period passes, so a peer that registered it
//! first does not see a disconnect before its own copy of the preferred
//! connection arrives.

use std::collections::HashMap;
use std::io::BufReader;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use crate::error::{ConclaveError, Result};
use crate::types::NodeIdentity;

use super::message::{read_frame, write_frame, Message};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const RETIRE_GRACE: Duration = HANDSHAKE_TIMEOUT;

/// A live, handshaken channel to one peer.
#[derive(Debug)]
pub struct Connection {
    peer: NodeIdentity,
    peer_version: String,
    outbound: bool,
    stream: TcpStream,
    writer: Mutex<TcpStream>,
    closed: AtomicBool,
}

impl Connection {
    fn new(stream: TcpStream, peer: NodeIdentity, peer_version: String, outbound: bool) -> Result<Self> {
        let writer = stream.try_clone()?;
        Ok(Self {
            peer,
            peer_version,
            outbound,
            stream,
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer(&self) -> &NodeIdentity {
        &self.peer
    }

    pub fn peer_version(&self) -> &str {
        &self.peer_version
    }

    /// True if this side dialed the connection.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn send(&self, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(ConclaveError::NotConnected(self.peer.id.clone()));
        }
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        write_frame(&mut *writer, message)
    }

    /// Shut the socket down; the reader thread exits on its next read.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    /// Mark closed but leave the socket open; the reader gives up after
    /// [`RETIRE_GRACE`] unless the peer closes it first.
    fn retire(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.stream.set_read_timeout(Some(RETIRE_GRACE));
    }
}

type PeerObserver = Box<dyn Fn(&NodeIdentity) + Send + Sync>;
type MessageObserver = Box<dyn Fn(&NodeIdentity, Message) + Send + Sync>;

#[derive(Default)]
struct Observers {
    established: RwLock<Vec<PeerObserver>>,
    closed: RwLock<Vec<PeerObserver>>,
    message: RwLock<Vec<MessageObserver>>,
}

/// Node id → connection, with typed observer lists for connection events.
pub struct ConnectionDirectory {
    local: NodeIdentity,
    version: String,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    observers: Observers,
    shutting_down: AtomicBool,
}

impl ConnectionDirectory {
    pub fn new(local: NodeIdentity, version: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            local,
            version: version.into(),
            connections: RwLock::new(HashMap::new()),
            observers: Observers::default(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn local(&self) -> &NodeIdentity {
        &self.local
    }

    /// Called after a new peer is registered.
    pub fn on_established(&self, observer: impl Fn(&NodeIdentity) + Send + Sync + 'static) {
        write(&self.observers.established).push(Box::new(observer));
    }

    /// Called after a registered connection goes away (not on shutdown or
    /// when a duplicate is dropped).
    pub fn on_closed(&self, observer: impl Fn(&NodeIdentity) + Send + Sync + 'static) {
        write(&self.observers.closed).push(Box::new(observer));
    }

    /// Called on the connection's reader thread for every received record.
    pub fn on_message(&self, observer: impl Fn(&NodeIdentity, Message) + Send + Sync + 'static) {
        write(&self.observers.message).push(Box::new(observer));
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        read(&self.connections).contains_key(node_id)
    }

    /// Ids of all connected peers, sorted.
    pub fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = read(&self.connections).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn peers(&self) -> Vec<NodeIdentity> {
        let mut peers: Vec<NodeIdentity> = read(&self.connections)
            .values()
            .map(|c| c.peer().clone())
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Dial a peer, handshake and register the connection.
    pub fn connect(self: &Arc<Self>, address: &str, port: u16) -> Result<Arc<Connection>> {
        let target = (address, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ConclaveError::Protocol(format!("cannot resolve {address}:{port}")))?;
        let mut stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

        write_frame(&mut stream, &Message::hello(&self.local, &self.version))?;
        let (peer, version) = self.expect_hello(&mut stream)?;
        stream.set_read_timeout(None)?;

        log::debug!("connected to {} at {}:{}", peer.id, address, port);
        self.register(Connection::new(stream, peer, version, true)?)
    }

    /// Handshake an inbound stream and register it.
    pub fn accept(self: &Arc<Self>, mut stream: TcpStream) -> Result<Arc<Connection>> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        let (peer, version) = self.expect_hello(&mut stream)?;
        write_frame(&mut stream, &Message::hello(&self.local, &self.version))?;
        stream.set_read_timeout(None)?;

        log::debug!("accepted connection from {}", peer.id);
        self.register(Connection::new(stream, peer, version, false)?)
    }

    fn expect_hello(&self, stream: &mut TcpStream) -> Result<(NodeIdentity, String)> {
        match read_frame(stream)? {
            Some(Message::Hello {
                node_id,
                address,
                port,
                version,
            }) => {
                if node_id == self.local.id {
                    return Err(ConclaveError::Protocol("connected to self".into()));
                }
                Ok((NodeIdentity::new(node_id, address, port), version))
            }
            Some(other) => Err(ConclaveError::Protocol(format!(
                "expected Hello, got {}",
                other.kind()
            ))),
            None => Err(ConclaveError::Protocol("stream closed during handshake".into())),
        }
    }

    fn initiator<'a>(&'a self, connection: &'a Connection) -> &'a str {
        if connection.is_outbound() {
            &self.local.id
        } else {
            &connection.peer().id
        }
    }

    fn register(self: &Arc<Self>, connection: Connection) -> Result<Arc<Connection>> {
        let connection = Arc::new(connection);
        let peer_id = connection.peer().id.clone();

        let displaced = {
            let mut connections = write(&self.connections);
            if self.is_shutting_down() {
                drop(connections);
                connection.close();
                return Err(ConclaveError::Protocol("node is shutting down".into()));
            }
            if let Some(existing) = connections.get(&peer_id).filter(|c| !c.is_closed()) {
                let preferred = std::cmp::min(self.local.id.as_str(), peer_id.as_str());
                if self.initiator(existing) == preferred && self.initiator(&connection) != preferred {
                    let existing = Arc::clone(existing);
                    drop(connections);
                    log::debug!("dropping duplicate connection to {}", peer_id);
                    connection.retire();
                    self.spawn_reader(connection)?;
                    return Ok(existing);
                }
            }
            connections.insert(peer_id.clone(), Arc::clone(&connection))
        };

        match displaced {
            Some(old) if !old.is_closed() => {
                log::debug!("replacing connection to {}", peer_id);
                old.close();
            }
            _ => {
                log::info!(
                    "peer {} connected ({}:{}, version {})",
                    peer_id,
                    connection.peer().address,
                    connection.peer().port,
                    connection.peer_version()
                );
                for observer in read(&self.observers.established).iter() {
                    observer(connection.peer());
                }
            }
        }

        self.spawn_reader(Arc::clone(&connection))?;
        Ok(connection)
    }

    fn spawn_reader(self: &Arc<Self>, connection: Arc<Connection>) -> Result<()> {
        let mut reader = BufReader::new(connection.stream.try_clone()?);
        let directory = Arc::clone(self);
        thread::Builder::new()
            .name(format!("conn-{}", connection.peer().id))
            .spawn(move || {
                loop {
                    match read_frame(&mut reader) {
                        Ok(Some(message)) => directory.dispatch(connection.peer(), message),
                        Ok(None) => break,
                        Err(ConclaveError::Serialization(e)) => {
                            log::warn!("dropping unreadable record from {}: {}", connection.peer().id, e);
                        }
                        Err(e) => {
                            if !connection.is_closed() {
                                log::warn!("connection to {} failed: {}", connection.peer().id, e);
                            }
                            break;
                        }
                    }
                }
                connection.close();
                directory.remove_if_same(&connection);
            })?;
        Ok(())
    }

    /// Runs on the connection's reader thread: records from one peer reach
    /// the observers one at a time and in send order, which replicated
    /// writes depend on.
    fn dispatch(&self, peer: &NodeIdentity, message: Message) {
        log::trace!("{} from {}", message.kind(), peer.id);
        for observer in read(&self.observers.message).iter() {
            observer(peer, message.clone());
        }
    }

    fn remove_if_same(&self, connection: &Arc<Connection>) {
        let removed = {
            let mut connections = write(&self.connections);
            let same = connections
                .get(&connection.peer().id)
                .is_some_and(|c| Arc::ptr_eq(c, connection));
            if same {
                connections.remove(&connection.peer().id);
            }
            same
        };
        if removed && !self.is_shutting_down() {
            log::info!("peer {} disconnected", connection.peer().id);
            for observer in read(&self.observers.closed).iter() {
                observer(connection.peer());
            }
        }
    }

    /// Send one record to a connected peer. A failed write closes the connection.
    pub fn send(&self, node_id: &str, message: &Message) -> Result<()> {
        let connection = read(&self.connections)
            .get(node_id)
            .cloned()
            .ok_or_else(|| ConclaveError::NotConnected(node_id.to_string()))?;
        if let Err(e) = connection.send(message) {
            connection.close();
            return Err(e);
        }
        Ok(())
    }

    /// Close every connection; later registrations are refused.
    pub fn close_all(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let connections: Vec<Arc<Connection>> = {
            let mut connections = write(&self.connections);
            connections.drain().map(|(_, c)| c).collect()
        };
        for connection in connections {
            connection.close();
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
