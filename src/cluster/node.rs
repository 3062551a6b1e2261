//! CONCLAVE - Cluster Node
//! Owns every component of a peer: system store, namespace storage, the
//! point-to-point listener, the broadcast channel, the quorum executor, the
//! storage agent and the worker pool.
//!
//! ## Startup
//! ```text
//! system store → listener → broadcast → observers → quorum → Running → Hello
//! ```
//! Faults that leave the node unable to operate are reported on a dedicated
//! channel (see [`Node::faults`]) instead of the ordinary operation results.

use std::fmt;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::NodeConfig;
use crate::engine::directory::StorageDirectory;
use crate::error::{ConclaveError, Result};
use crate::types::{Namespace, NodeIdentity};

use super::broadcast::BroadcastChannel;
use super::connection::ConnectionDirectory;
use super::message::Message;
use super::pool::{sleep_unless, WorkerPool};
use super::quorum::{Event, LeaderQuorum, QuorumAgent, QuorumStatus};
use super::replication::StorageAgent;
use super::system::{LifecycleState, SystemStore};
use super::transport::{NetworkTransport, Transport};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// A fault that requires the node to shut down.
#[derive(Debug)]
pub struct NodeFault {
    pub component: &'static str,
    pub error: ConclaveError,
}

impl fmt::Display for NodeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.component, self.error)
    }
}

pub struct Node {
    identity: NodeIdentity,
    config: NodeConfig,
    system: SystemStore,
    connections: Arc<ConnectionDirectory>,
    broadcast: Arc<BroadcastChannel>,
    quorum: Arc<QuorumAgent>,
    storage: Arc<StorageAgent>,
    pool: Arc<WorkerPool>,
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    faults: Mutex<Option<Receiver<NodeFault>>>,
    stopped: AtomicBool,
}

impl Node {
    /// Start a node. Errors binding the listener or persisting the identity
    /// are returned as [`ConclaveError::Unrecoverable`].
    pub fn start(config: NodeConfig) -> Result<Self> {
        let system = SystemStore::open(&config)?;
        system.record_start(&config.version)?;

        let listener = TcpListener::bind((config.system_address.as_str(), config.system_port))
            .map_err(|e| {
                ConclaveError::Unrecoverable(format!(
                    "cannot listen on {}:{}: {e}",
                    config.system_address, config.system_port
                ))
            })?;
        let port = listener.local_addr()?.port();
        let identity = NodeIdentity::new(system.identifier(), config.system_address.clone(), port);
        log::info!("node {} listening on {}:{}", identity.id, identity.address, identity.port);

        let storage_dir = Arc::new(StorageDirectory::open(config.storage())?);
        let connections = ConnectionDirectory::new(identity.clone(), config.version.clone());
        let broadcast = Arc::new(BroadcastChannel::bind(
            config.broadcast_bind,
            config.broadcast_targets.clone(),
            identity.clone(),
        )?);
        let transport: Arc<dyn Transport> = Arc::new(NetworkTransport::new(
            Arc::clone(&connections),
            Arc::clone(&broadcast),
        ));

        let quorum = Arc::new(QuorumAgent::spawn(
            LeaderQuorum::new(identity.clone(), config.election_timeout),
            Arc::clone(&transport),
        )?);
        let storage = Arc::new(StorageAgent::new(
            identity.id.clone(),
            storage_dir,
            Arc::clone(&transport),
            quorum.status_handle(),
        ));
        let pool = Arc::new(WorkerPool::new(config.worker_threads)?);
        let stop = Arc::new(AtomicBool::new(false));
        let (fault_tx, fault_rx) = mpsc::channel();

        wire_observers(&connections, &quorum, &storage, &pool, &config);

        let acceptor = spawn_acceptor(
            listener,
            Arc::clone(&connections),
            Arc::downgrade(&pool),
            Arc::clone(&stop),
            fault_tx,
        )?;

        // From here on a failed start unwinds through Drop.
        let node = Self {
            identity,
            config,
            system,
            connections,
            broadcast,
            quorum,
            storage,
            pool,
            stop,
            threads: Mutex::new(vec![acceptor]),
            faults: Mutex::new(Some(fault_rx)),
            stopped: AtomicBool::new(false),
        };

        let listener = node.broadcast.listen(Arc::clone(&node.stop), {
            let connections = Arc::downgrade(&node.connections);
            let quorum = Arc::downgrade(&node.quorum);
            let pool = Arc::downgrade(&node.pool);
            move |message| on_broadcast(message, &connections, &quorum, &pool)
        })?;
        node.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);

        node.system.set_state(LifecycleState::Running).map_err(|e| {
            ConclaveError::Unrecoverable(format!("cannot record running state: {e}"))
        })?;
        transport.broadcast(&Message::hello(&node.identity, &node.config.version));
        node.quorum.submit(Event::Started);
        Ok(node)
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Address the broadcast channel is bound to.
    pub fn broadcast_addr(&self) -> Result<SocketAddr> {
        self.broadcast.local_addr()
    }

    /// Receiver of unrecoverable faults. Can be taken once.
    pub fn faults(&self) -> Option<Receiver<NodeFault>> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn status(&self) -> QuorumStatus {
        self.quorum.status()
    }

    pub fn leader(&self) -> Option<String> {
        self.quorum.status().leader
    }

    pub fn peers(&self) -> Vec<NodeIdentity> {
        self.connections.peers()
    }

    pub fn storage(&self) -> &Arc<StorageDirectory> {
        self.storage.storage()
    }

    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        self.storage.get(&Namespace::parse(namespace)?, key)
    }

    pub fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        self.storage.set(&Namespace::parse(namespace)?, key, value)
    }

    pub fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.storage.delete(&Namespace::parse(namespace)?, key)
    }

    /// Stop every component and record a clean shutdown. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::info!("node {} shutting down", self.identity.id);
        self.system.set_state(LifecycleState::Stopping)?;

        self.stop.store(true, Ordering::Release);
        let threads: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()));
        for thread in threads {
            if thread.join().is_err() {
                log::error!("listener thread panicked");
            }
        }

        self.quorum.shutdown();
        self.connections.close_all();
        self.pool.shutdown();
        self.storage.storage().close_all()?;

        self.system.set_state(LifecycleState::Stopped)?;
        self.system.close()?;
        log::info!("node {} stopped", self.identity.id);
        Ok(())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("shutdown of node {} failed: {}", self.identity.id, e);
        }
    }
}

/// Route connection events into the quorum and the storage agent.
fn wire_observers(
    connections: &Arc<ConnectionDirectory>,
    quorum: &Arc<QuorumAgent>,
    storage: &Arc<StorageAgent>,
    pool: &Arc<WorkerPool>,
    config: &NodeConfig,
) {
    let agent = Arc::downgrade(quorum);
    connections.on_established(move |peer| {
        if let Some(agent) = agent.upgrade() {
            agent.submit(Event::PeerConnected {
                node_id: peer.id.clone(),
            });
        }
    });

    let agent = Arc::downgrade(quorum);
    let directory = Arc::downgrade(connections);
    let workers = Arc::downgrade(pool);
    let (attempts, delay) = (config.reconnect_attempts, config.reconnect_delay);
    connections.on_closed(move |peer| {
        if let Some(agent) = agent.upgrade() {
            agent.submit(Event::PeerDisconnected {
                node_id: peer.id.clone(),
            });
        }
        if let (Some(directory), Some(workers)) = (directory.upgrade(), workers.upgrade()) {
            schedule_reconnect(&workers, directory, peer.clone(), attempts, delay);
        }
    });

    let agent = Arc::downgrade(quorum);
    let storage = Arc::downgrade(storage);
    connections.on_message(move |peer, message| {
        if let Some(storage) = storage.upgrade() {
            if storage.handle_message(&message) {
                return;
            }
        }
        match (Event::from_message(&message), agent.upgrade()) {
            (Some(event), Some(agent)) => agent.submit(event),
            (Some(_), None) => {}
            (None, _) => log::warn!("unexpected {} from {}", message.kind(), peer.id),
        }
    });
}

fn on_broadcast(
    message: Message,
    connections: &Weak<ConnectionDirectory>,
    quorum: &Weak<QuorumAgent>,
    pool: &Weak<WorkerPool>,
) {
    if let Message::Hello {
        node_id,
        address,
        port,
        ..
    } = &message
    {
        let (Some(directory), Some(pool)) = (connections.upgrade(), pool.upgrade()) else {
            return;
        };
        if directory.is_connected(node_id) || directory.is_shutting_down() {
            return;
        }
        log::info!("discovered {} at {}:{}", node_id, address, port);
        let (address, port) = (address.clone(), *port);
        pool.execute(move || {
            if let Err(e) = directory.connect(&address, port) {
                log::warn!("connecting to {}:{} failed: {}", address, port, e);
            }
        });
        return;
    }

    match (Event::from_message(&message), quorum.upgrade()) {
        (Some(event), Some(agent)) => agent.submit(event),
        (Some(_), None) => {}
        (None, _) => log::debug!("ignoring broadcast {} from {}", message.kind(), message.sender()),
    }
}

/// Retry a dropped peer with exponential back-off until connected or out of attempts.
fn schedule_reconnect(
    pool: &WorkerPool,
    directory: Arc<ConnectionDirectory>,
    peer: NodeIdentity,
    attempts: u32,
    delay: Duration,
) {
    let stop = pool.stop_flag();
    pool.execute(move || {
        let mut delay = delay;
        for attempt in 1..=attempts {
            if !sleep_unless(&stop, delay) || directory.is_shutting_down() {
                return;
            }
            if directory.is_connected(&peer.id) {
                log::debug!("{} already reconnected", peer.id);
                return;
            }
            match directory.connect(&peer.address, peer.port) {
                Ok(_) => {
                    log::info!("reconnected to {} on attempt {}", peer.id, attempt);
                    return;
                }
                Err(e) => log::debug!("reconnect {}/{} to {} failed: {}", attempt, attempts, peer.id, e),
            }
            delay = delay.saturating_mul(2);
        }
        log::warn!("giving up on {} after {} attempts", peer.id, attempts);
    });
}

fn spawn_acceptor(
    listener: TcpListener,
    connections: Arc<ConnectionDirectory>,
    pool: Weak<WorkerPool>,
    stop: Arc<AtomicBool>,
    faults: Sender<NodeFault>,
) -> Result<JoinHandle<()>> {
    listener.set_nonblocking(true)?;
    let handle = thread::Builder::new()
        .name("acceptor".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Acquire) {
                match listener.accept() {
                    Ok((stream, from)) => {
                        if let Err(e) = stream.set_nonblocking(false) {
                            log::warn!("dropping connection from {}: {}", from, e);
                            continue;
                        }
                        let Some(pool) = pool.upgrade() else { break };
                        let connections = Arc::clone(&connections);
                        pool.execute(move || {
                            if let Err(e) = connections.accept(stream) {
                                log::warn!("handshake with {} failed: {}", from, e);
                            }
                        });
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => {
                        log::error!("listener failed: {}", e);
                        let _ = faults.send(NodeFault {
                            component: "listener",
                            error: ConclaveError::Io(e),
                        });
                        break;
                    }
                }
            }
            log::debug!("acceptor stopped");
        })?;
    Ok(handle)
}
