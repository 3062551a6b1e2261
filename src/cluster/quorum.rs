//! CONCLAVE - Leader Quorum
//! Epoch-versioned election of a single write coordinator among reachable peers.
//!
//! ## States
//! ```text
//! Leaderless -> RequestingLeader -> StartingVote -> Election -> Tallying -> Leader
//! ```
//! Every trigger is an [`Event`] processed by [`LeaderQuorum::handle`]. The
//! [`QuorumAgent`] owns the machine on a dedicated thread, so transitions are
//! totally ordered no matter which network thread produced the trigger.
//!
//! ## Voting
//! Each round (epoch) every participant broadcasts a random vote. The node
//! holding the strictly unique maximum wins; a tie voids the round and a new
//! epoch starts with fresh votes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::Result;
use crate::types::NodeIdentity;

use super::message::Message;
use super::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuorumState {
    #[default]
    Leaderless,
    RequestingLeader,
    StartingVote,
    Election,
    Tallying,
    Leader,
}

impl fmt::Display for QuorumState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Triggers consumed by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The node finished starting; arms the discovery timer.
    Started,
    PeerConnected { node_id: String },
    PeerDisconnected { node_id: String },
    /// A peer asked "who is leader?".
    LeaderRequested { from: String },
    VoteRequested { epoch: u64, from: String },
    VoteReceived { epoch: u64, vote: u64, from: String },
    /// A peer announced it won `epoch`.
    LeaderElected { epoch: u64, from: String },
    /// A peer told us directly who the leader is.
    LeaderAnnounced { leader: String, from: String },
    ElectionTimeout { epoch: u64 },
}

impl Event {
    /// Map a received election record onto its trigger. Other records yield `None`.
    pub fn from_message(message: &Message) -> Option<Self> {
        let event = match message {
            Message::RequestLeader { node_id, .. } => Event::LeaderRequested {
                from: node_id.clone(),
            },
            Message::RequestLeaderVote { epoch, node_id, .. } => Event::VoteRequested {
                epoch: *epoch,
                from: node_id.clone(),
            },
            Message::LeaderVote {
                vote,
                epoch,
                node_id,
                ..
            } => Event::VoteReceived {
                epoch: *epoch,
                vote: *vote,
                from: node_id.clone(),
            },
            Message::LeaderElected { epoch, node_id, .. } => Event::LeaderElected {
                epoch: *epoch,
                from: node_id.clone(),
            },
            Message::LeaderAnnouncement {
                leader_node_id,
                from_node_id,
            } => Event::LeaderAnnounced {
                leader: leader_node_id.clone(),
                from: from_node_id.clone(),
            },
            _ => return None,
        };
        Some(event)
    }
}

/// Snapshot of the machine, readable from any thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuorumStatus {
    pub state: QuorumState,
    pub epoch: u64,
    pub leader: Option<String>,
}

/// Shared read handle on the latest [`QuorumStatus`].
#[derive(Debug, Clone, Default)]
pub struct StatusHandle(Arc<RwLock<QuorumStatus>>);

impl StatusHandle {
    pub fn get(&self) -> QuorumStatus {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn leader(&self) -> Option<String> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).leader.clone()
    }

    pub(crate) fn set(&self, status: QuorumStatus) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

type VoteSource = Box<dyn FnMut() -> u64 + Send>;

pub struct LeaderQuorum {
    local: NodeIdentity,
    state: QuorumState,
    epoch: u64,
    leader: Option<String>,
    votes: BTreeMap<u64, HashMap<String, u64>>,
    participants: BTreeMap<u64, BTreeSet<String>>,
    /// "Leader elected" claims heard while still voting, checked at tally.
    claims: BTreeMap<u64, String>,
    /// Armed timer: the epoch it belongs to and when it fires.
    timeout: Option<(u64, Instant)>,
    election_timeout: Duration,
    vote_source: VoteSource,
    status: StatusHandle,
}

impl LeaderQuorum {
    pub fn new(local: NodeIdentity, election_timeout: Duration) -> Self {
        Self {
            local,
            state: QuorumState::Leaderless,
            epoch: 0,
            leader: None,
            votes: BTreeMap::new(),
            participants: BTreeMap::new(),
            claims: BTreeMap::new(),
            timeout: None,
            election_timeout,
            vote_source: Box::new(|| rand::thread_rng().gen()),
            status: StatusHandle::default(),
        }
    }

    /// Replace the random vote generator.
    pub fn with_vote_source(mut self, source: impl FnMut() -> u64 + Send + 'static) -> Self {
        self.vote_source = Box::new(source);
        self
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn state(&self) -> QuorumState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    /// Armed election timer, if any.
    pub fn armed_timeout(&self) -> Option<(u64, Instant)> {
        self.timeout
    }

    /// Votes recorded for `epoch`.
    pub fn votes(&self, epoch: u64) -> Option<&HashMap<String, u64>> {
        self.votes.get(&epoch)
    }

    /// Participants captured when `epoch` started.
    pub fn participants(&self, epoch: u64) -> Option<&BTreeSet<String>> {
        self.participants.get(&epoch)
    }

    /// Process one trigger to completion.
    pub fn handle(&mut self, event: Event, transport: &dyn Transport) {
        log::debug!("[{}] {:?} in {} (epoch {})", self.local.id, event, self.state, self.epoch);
        match event {
            Event::Started => {
                if matches!(self.state, QuorumState::Leaderless | QuorumState::RequestingLeader) {
                    self.arm_timeout();
                }
            }
            Event::PeerConnected { node_id } => self.on_peer_connected(&node_id, transport),
            Event::PeerDisconnected { node_id } => self.on_peer_disconnected(&node_id, transport),
            Event::LeaderRequested { from } => self.on_leader_requested(&from, transport),
            Event::VoteRequested { epoch, from } => self.on_vote_requested(epoch, &from, transport),
            Event::VoteReceived { epoch, vote, from } => {
                self.on_vote_received(epoch, vote, from, transport)
            }
            Event::LeaderElected { epoch, from } => self.on_leader_elected(epoch, from, transport),
            Event::LeaderAnnounced { leader, from } => self.on_leader_announced(leader, &from),
            Event::ElectionTimeout { epoch } => self.on_timeout(epoch, transport),
        }
        self.publish();
    }

    fn on_peer_connected(&mut self, node_id: &str, transport: &dyn Transport) {
        match self.state {
            QuorumState::Leaderless | QuorumState::RequestingLeader => {
                self.transition(QuorumState::RequestingLeader);
                transport.broadcast(&Message::request_leader(&self.local));
                self.arm_timeout();
            }
            QuorumState::StartingVote | QuorumState::Election | QuorumState::Tallying => {
                log::info!("[{}] {} joined during epoch {}, restarting vote", self.local.id, node_id, self.epoch);
                self.start_vote(None, transport);
            }
            QuorumState::Leader => {}
        }
    }

    fn on_peer_disconnected(&mut self, node_id: &str, transport: &dyn Transport) {
        match self.state {
            QuorumState::Leader if self.leader.as_deref() == Some(node_id) => {
                log::warn!("[{}] leader {} disconnected, re-electing", self.local.id, node_id);
                self.start_vote(None, transport);
            }
            QuorumState::StartingVote | QuorumState::Election | QuorumState::Tallying
                if self
                    .participants
                    .get(&self.epoch)
                    .is_some_and(|p| p.contains(node_id)) =>
            {
                log::info!("[{}] participant {} left epoch {}, restarting vote", self.local.id, node_id, self.epoch);
                self.start_vote(None, transport);
            }
            _ => {}
        }
    }

    fn on_leader_requested(&mut self, from: &str, transport: &dyn Transport) {
        match self.state {
            QuorumState::Leader => {
                let Some(leader) = self.leader.clone() else { return };
                let announcement = Message::LeaderAnnouncement {
                    leader_node_id: leader,
                    from_node_id: self.local.id.clone(),
                };
                if let Err(e) = transport.send(from, &announcement) {
                    log::warn!("[{}] leader announcement to {} failed: {}", self.local.id, from, e);
                }
            }
            QuorumState::Leaderless | QuorumState::RequestingLeader => {
                self.start_vote(None, transport);
            }
            _ => {}
        }
    }

    fn on_vote_requested(&mut self, epoch: u64, from: &str, transport: &dyn Transport) {
        if epoch < self.epoch {
            log::debug!("[{}] stale vote request from {} for epoch {}", self.local.id, from, epoch);
            return;
        }
        if epoch > self.epoch {
            log::info!("[{}] {} requested epoch {}, raising from {}", self.local.id, from, epoch, self.epoch);
            self.start_vote(Some(epoch), transport);
        } else if matches!(self.state, QuorumState::Leaderless | QuorumState::RequestingLeader) {
            self.start_vote(None, transport);
        }
    }

    fn on_vote_received(&mut self, epoch: u64, vote: u64, from: String, transport: &dyn Transport) {
        if epoch < self.epoch {
            log::debug!("[{}] stale vote from {} for epoch {}", self.local.id, from, epoch);
            return;
        }
        if !transport.is_connected(&from) {
            log::warn!("[{}] ignoring vote from unconnected node {}", self.local.id, from);
            return;
        }
        log::debug!("[{}] vote {} from {} for epoch {}", self.local.id, vote, from, epoch);
        self.votes.entry(epoch).or_default().insert(from, vote);

        if epoch > self.epoch {
            self.start_vote(Some(epoch), transport);
        } else if self.state == QuorumState::Election {
            self.check_complete(transport);
        }
    }

    fn on_leader_elected(&mut self, epoch: u64, from: String, transport: &dyn Transport) {
        if epoch < self.epoch {
            log::debug!("[{}] stale election result from {} for epoch {}", self.local.id, from, epoch);
            return;
        }
        if !transport.is_connected(&from) {
            log::warn!("[{}] ignoring election result from unconnected node {}", self.local.id, from);
            return;
        }
        match self.state {
            QuorumState::Leaderless | QuorumState::RequestingLeader => self.follow(from, epoch),
            QuorumState::StartingVote | QuorumState::Election | QuorumState::Tallying => {
                log::debug!("[{}] {} claims epoch {} while voting", self.local.id, from, epoch);
                self.claims.insert(epoch, from);
            }
            QuorumState::Leader if self.leader.as_deref() == Some(from.as_str()) => {
                self.epoch = epoch;
            }
            QuorumState::Leader => {
                log::warn!(
                    "[{}] {} claims leadership of epoch {} but {:?} leads, re-electing",
                    self.local.id,
                    from,
                    epoch,
                    self.leader
                );
                self.epoch = epoch;
                self.start_vote(None, transport);
            }
        }
    }

    fn on_leader_announced(&mut self, leader: String, from: &str) {
        if matches!(self.state, QuorumState::Leaderless | QuorumState::RequestingLeader) {
            log::info!("[{}] {} announced leader {}", self.local.id, from, leader);
            self.follow(leader, self.epoch);
        }
    }

    fn on_timeout(&mut self, epoch: u64, transport: &dyn Transport) {
        if self.timeout.map(|(armed, _)| armed) != Some(epoch) {
            return;
        }
        self.timeout = None;
        match self.state {
            QuorumState::Leaderless | QuorumState::RequestingLeader => {
                log::info!("[{}] no leader answered, starting a vote", self.local.id);
                self.start_vote(None, transport);
            }
            QuorumState::StartingVote | QuorumState::Election | QuorumState::Tallying => {
                log::warn!("[{}] election for epoch {} timed out", self.local.id, epoch);
                self.leader = None;
                self.transition(QuorumState::Leaderless);
                self.transition(QuorumState::RequestingLeader);
                transport.broadcast(&Message::request_leader(&self.local));
                self.arm_timeout();
            }
            QuorumState::Leader => {}
        }
    }

    /// Enter a new round: at `raise_to` if a peer already opened it, else at epoch + 1.
    fn start_vote(&mut self, raise_to: Option<u64>, transport: &dyn Transport) {
        self.transition(QuorumState::StartingVote);
        match raise_to {
            Some(epoch) => self.epoch = self.epoch.max(epoch),
            None => {
                self.epoch += 1;
                transport.broadcast(&Message::request_vote(&self.local, self.epoch));
            }
        }
        let epoch = self.epoch;
        self.leader = None;
        self.arm_timeout();

        let mut participants: BTreeSet<String> = transport.connected_peers().into_iter().collect();
        participants.insert(self.local.id.clone());
        let vote = (self.vote_source)();
        log::info!(
            "[{}] epoch {}: voting {} among {:?}",
            self.local.id,
            epoch,
            vote,
            participants
        );
        self.participants.insert(epoch, participants);
        self.votes
            .entry(epoch)
            .or_default()
            .insert(self.local.id.clone(), vote);
        self.votes.retain(|e, _| *e >= epoch);
        self.participants.retain(|e, _| *e >= epoch);
        self.claims.retain(|e, _| *e >= epoch);
        transport.broadcast(&Message::vote(&self.local, epoch, vote));

        self.transition(QuorumState::Election);
        self.check_complete(transport);
    }

    fn check_complete(&mut self, transport: &dyn Transport) {
        if self.state != QuorumState::Election {
            return;
        }
        let complete = match (self.participants.get(&self.epoch), self.votes.get(&self.epoch)) {
            (Some(participants), Some(votes)) => participants.iter().all(|p| votes.contains_key(p)),
            _ => false,
        };
        if complete {
            self.tally(transport);
        }
    }

    fn tally(&mut self, transport: &dyn Transport) {
        self.transition(QuorumState::Tallying);
        let epoch = self.epoch;
        let ballots: Vec<(&String, u64)> = match (self.participants.get(&epoch), self.votes.get(&epoch)) {
            (Some(participants), Some(votes)) => participants
                .iter()
                .filter_map(|p| votes.get(p).map(|v| (p, *v)))
                .collect(),
            _ => Vec::new(),
        };
        let Some(max) = ballots.iter().map(|(_, v)| *v).max() else {
            self.transition(QuorumState::Leaderless);
            return;
        };
        let winners: Vec<String> = ballots
            .iter()
            .filter(|(_, v)| *v == max)
            .map(|(p, _)| (*p).clone())
            .collect();

        let winner = match winners.as_slice() {
            [winner] => winner.clone(),
            _ => {
                log::info!("[{}] epoch {} tied at {} between {:?}", self.local.id, epoch, max, winners);
                self.start_vote(None, transport);
                return;
            }
        };
        if let Some(claimed) = self.claims.get(&epoch) {
            if *claimed != winner {
                log::warn!(
                    "[{}] epoch {} tallied {} but {} claimed it, re-electing",
                    self.local.id,
                    epoch,
                    winner,
                    claimed
                );
                self.start_vote(None, transport);
                return;
            }
        }
        let is_self = winner == self.local.id;
        self.follow(winner, epoch);
        if is_self {
            transport.broadcast(&Message::elected(&self.local, epoch));
        }
    }

    fn follow(&mut self, leader: String, epoch: u64) {
        self.epoch = self.epoch.max(epoch);
        log::info!("[{}] leader for epoch {} is {}", self.local.id, self.epoch, leader);
        self.leader = Some(leader);
        self.timeout = None;
        self.transition(QuorumState::Leader);
    }

    fn arm_timeout(&mut self) {
        self.timeout = Some((self.epoch, Instant::now() + self.election_timeout));
    }

    fn transition(&mut self, to: QuorumState) {
        if self.state != to {
            log::info!("[{}] {} -> {}", self.local.id, self.state, to);
            self.state = to;
        }
    }

    fn publish(&self) {
        self.status.set(QuorumStatus {
            state: self.state,
            epoch: self.epoch,
            leader: self.leader.clone(),
        });
    }
}

enum Signal {
    Event(Event),
    Shutdown,
}

/// Serial executor owning a [`LeaderQuorum`] and its election timer.
pub struct QuorumAgent {
    sender: Mutex<Sender<Signal>>,
    status: StatusHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QuorumAgent {
    pub fn spawn(mut quorum: LeaderQuorum, transport: Arc<dyn Transport>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Signal>();
        let status = quorum.status_handle();
        quorum.publish();

        let worker = thread::Builder::new()
            .name("quorum".to_string())
            .spawn(move || {
                loop {
                    let signal = match quorum.armed_timeout() {
                        Some((epoch, deadline)) => {
                            let wait = deadline.saturating_duration_since(Instant::now());
                            match receiver.recv_timeout(wait) {
                                Ok(signal) => signal,
                                Err(RecvTimeoutError::Timeout) => {
                                    Signal::Event(Event::ElectionTimeout { epoch })
                                }
                                Err(RecvTimeoutError::Disconnected) => break,
                            }
                        }
                        None => match receiver.recv() {
                            Ok(signal) => signal,
                            Err(_) => break,
                        },
                    };
                    match signal {
                        Signal::Event(event) => quorum.handle(event, transport.as_ref()),
                        Signal::Shutdown => break,
                    }
                }
                log::debug!("quorum executor stopped");
            })?;

        Ok(Self {
            sender: Mutex::new(sender),
            status,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a trigger; processed after everything submitted before it.
    pub fn submit(&self, event: Event) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        if sender.send(Signal::Event(event)).is_err() {
            log::debug!("quorum executor is stopped, dropping event");
        }
    }

    pub fn status(&self) -> QuorumStatus {
        self.status.get()
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Cancel the timer and stop the executor once queued triggers are handled.
    pub fn shutdown(&self) {
        {
            let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
            let _ = sender.send(Signal::Shutdown);
        }
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!("quorum executor panicked");
            }
        }
    }
}

impl Drop for QuorumAgent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConclaveError;
    use std::collections::HashSet;

    /// Records outgoing traffic; peers are whatever the test says is connected.
    #[derive(Default)]
    struct RecordingTransport {
        peers: Mutex<HashSet<String>>,
        broadcasts: Mutex<Vec<Message>>,
        sent: Mutex<Vec<(String, Message)>>,
    }

    impl RecordingTransport {
        fn with_peers(peers: &[&str]) -> Self {
            let transport = Self::default();
            transport
                .peers
                .lock()
                .unwrap()
                .extend(peers.iter().map(|p| p.to_string()));
            transport
        }

        fn take_broadcasts(&self) -> Vec<Message> {
            std::mem::take(&mut *self.broadcasts.lock().unwrap())
        }
    }

    impl Transport for RecordingTransport {
        fn broadcast(&self, message: &Message) {
            self.broadcasts.lock().unwrap().push(message.clone());
        }

        fn send(&self, node_id: &str, message: &Message) -> Result<()> {
            if !self.is_connected(node_id) {
                return Err(ConclaveError::NotConnected(node_id.to_string()));
            }
            self.sent.lock().unwrap().push((node_id.to_string(), message.clone()));
            Ok(())
        }

        fn connected_peers(&self) -> Vec<String> {
            let mut peers: Vec<String> = self.peers.lock().unwrap().iter().cloned().collect();
            peers.sort();
            peers
        }

        fn is_connected(&self, node_id: &str) -> bool {
            self.peers.lock().unwrap().contains(node_id)
        }
    }

    fn quorum(id: &str, votes: Vec<u64>) -> LeaderQuorum {
        let mut votes = votes.into_iter();
        LeaderQuorum::new(NodeIdentity::new(id, "127.0.0.1", 1), Duration::from_secs(10))
            .with_vote_source(move || votes.next().unwrap_or(1))
    }

    #[test]
    fn test_peer_connect_requests_leader() {
        let t = RecordingTransport::with_peers(&["b"]);
        let mut q = quorum("a", vec![42]);
        q.handle(Event::PeerConnected { node_id: "b".into() }, &t);
        assert_eq!(q.state(), QuorumState::RequestingLeader);
        assert!(matches!(t.take_broadcasts()[..], [Message::RequestLeader { .. }]));
    }

    #[test]
    fn test_leader_request_starts_vote_at_next_epoch() {
        let t = RecordingTransport::with_peers(&["b"]);
        let mut q = quorum("a", vec![42]);
        q.handle(Event::PeerConnected { node_id: "b".into() }, &t);
        t.take_broadcasts();
        q.handle(Event::LeaderRequested { from: "b".into() }, &t);

        assert_eq!(q.state(), QuorumState::Election);
        assert_eq!(q.epoch(), 1);
        let participants: Vec<&str> = q.participants(1).unwrap().iter().map(String::as_str).collect();
        assert_eq!(participants, vec!["a", "b"]);
        let sent = t.take_broadcasts();
        assert!(matches!(sent[0], Message::RequestLeaderVote { epoch: 1, .. }));
        assert!(matches!(sent[1], Message::LeaderVote { epoch: 1, vote: 42, .. }));
    }

    #[test]
    fn test_unique_maximum_wins() {
        let t = RecordingTransport::with_peers(&["b"]);
        let mut q = quorum("a", vec![42]);
        q.handle(Event::LeaderRequested { from: "b".into() }, &t);
        t.take_broadcasts();
        q.handle(Event::VoteReceived { epoch: 1, vote: 17, from: "b".into() }, &t);

        assert_eq!(q.state(), QuorumState::Leader);
        assert_eq!(q.leader(), Some("a"));
        assert!(q.armed_timeout().is_none());
        assert!(matches!(t.take_broadcasts()[..], [Message::LeaderElected { epoch: 1, .. }]));
    }

    #[test]
    fn test_losing_node_follows_without_announcing() {
        let t = RecordingTransport::with_peers(&["a"]);
        let mut q = quorum("b", vec![17]);
        q.handle(Event::LeaderRequested { from: "a".into() }, &t);
        t.take_broadcasts();
        q.handle(Event::VoteReceived { epoch: 1, vote: 42, from: "a".into() }, &t);
        assert_eq!(q.leader(), Some("a"));
        assert!(t.take_broadcasts().is_empty());
    }

    #[test]
    fn test_tie_restarts_at_new_epoch() {
        let t = RecordingTransport::with_peers(&["b"]);
        let mut q = quorum("a", vec![7, 99]);
        q.handle(Event::LeaderRequested { from: "b".into() }, &t);
        q.handle(Event::VoteReceived { epoch: 1, vote: 7, from: "b".into() }, &t);

        assert_eq!(q.state(), QuorumState::Election);
        assert_eq!(q.epoch(), 2);
        assert_eq!(q.leader(), None);
        assert!(q.votes(1).is_none(), "old epochs are pruned");
        assert_eq!(q.votes(2).unwrap().get("a"), Some(&99));
    }

    #[test]
    fn test_higher_epoch_request_is_joined_without_increment() {
        let t = RecordingTransport::with_peers(&["b"]);
        let mut q = quorum("a", vec![5]);
        q.handle(Event::VoteRequested { epoch: 4, from: "b".into() }, &t);
        assert_eq!(q.epoch(), 4);
        assert_eq!(q.state(), QuorumState::Election);
        let sent = t.take_broadcasts();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], Message::LeaderVote { epoch: 4, vote: 5, .. }));
    }

    #[test]
    fn test_stale_messages_ignored() {
        let t = RecordingTransport::with_peers(&["b", "c"]);
        let mut q = quorum("a", vec![5]);
        q.handle(Event::VoteRequested { epoch: 3, from: "b".into() }, &t);
        let before = (q.state(), q.epoch());

        q.handle(Event::VoteRequested { epoch: 2, from: "c".into() }, &t);
        q.handle(Event::VoteReceived { epoch: 2, vote: 1_000, from: "c".into() }, &t);
        q.handle(Event::LeaderElected { epoch: 1, from: "c".into() }, &t);
        assert_eq!((q.state(), q.epoch()), before);
        assert!(q.votes(2).is_none());
    }

    #[test]
    fn test_early_vote_is_buffered() {
        let t = RecordingTransport::with_peers(&["b"]);
        let mut q = quorum("a", vec![42]);
        q.handle(Event::PeerConnected { node_id: "b".into() }, &t);
        // b's vote for epoch 1 arrives before its vote request.
        q.handle(Event::VoteReceived { epoch: 1, vote: 17, from: "b".into() }, &t);
        assert_eq!(q.state(), QuorumState::Leader);
        assert_eq!(q.epoch(), 1);
        assert_eq!(q.leader(), Some("a"));
    }

    #[test]
    fn test_vote_from_unconnected_node_ignored() {
        let t = RecordingTransport::with_peers(&["b"]);
        let mut q = quorum("a", vec![42]);
        q.handle(Event::LeaderRequested { from: "b".into() }, &t);
        q.handle(Event::VoteReceived { epoch: 1, vote: 99, from: "z".into() }, &t);
        assert_eq!(q.state(), QuorumState::Election);
        assert!(!q.votes(1).unwrap().contains_key("z"));
    }

    #[test]
    fn test_leader_disconnect_triggers_reelection() {
        let t = RecordingTransport::with_peers(&["a", "c"]);
        let mut q = quorum("b", vec![1, 2]);
        q.handle(Event::LeaderRequested { from: "a".into() }, &t);
        q.handle(Event::VoteReceived { epoch: 1, vote: 50, from: "a".into() }, &t);
        q.handle(Event::VoteReceived { epoch: 1, vote: 40, from: "c".into() }, &t);
        assert_eq!(q.leader(), Some("a"));

        t.peers.lock().unwrap().remove("a");
        q.handle(Event::PeerDisconnected { node_id: "a".into() }, &t);
        assert_eq!(q.state(), QuorumState::Election);
        assert_eq!(q.epoch(), 2);
        assert_eq!(q.leader(), None);
        let participants: Vec<&str> = q.participants(2).unwrap().iter().map(String::as_str).collect();
        assert_eq!(participants, vec!["b", "c"]);
    }

    #[test]
    fn test_follower_disconnect_keeps_leader() {
        let t = RecordingTransport::with_peers(&["a", "c"]);
        let mut q = quorum("b", vec![1]);
        q.handle(Event::LeaderRequested { from: "a".into() }, &t);
        q.handle(Event::VoteReceived { epoch: 1, vote: 50, from: "a".into() }, &t);
        q.handle(Event::VoteReceived { epoch: 1, vote: 40, from: "c".into() }, &t);
        q.handle(Event::PeerDisconnected { node_id: "c".into() }, &t);
        assert_eq!(q.state(), QuorumState::Leader);
        assert_eq!(q.leader(), Some("a"));
    }

    #[test]
    fn test_conflicting_leader_elected_triggers_reelection() {
        let t = RecordingTransport::with_peers(&["a", "c"]);
        let mut q = quorum("b", vec![1, 2]);
        q.handle(Event::LeaderAnnounced { leader: "a".into(), from: "a".into() }, &t);
        assert_eq!(q.state(), QuorumState::Leader);

        q.handle(Event::LeaderElected { epoch: 0, from: "a".into() }, &t);
        assert_eq!(q.state(), QuorumState::Leader);

        q.handle(Event::LeaderElected { epoch: 0, from: "c".into() }, &t);
        assert_eq!(q.state(), QuorumState::Election);
        assert_eq!(q.epoch(), 1);
    }

    #[test]
    fn test_election_result_from_unconnected_node_ignored() {
        let t = RecordingTransport::with_peers(&["b"]);
        let mut q = quorum("a", vec![42]);
        q.handle(Event::LeaderRequested { from: "b".into() }, &t);
        q.handle(Event::LeaderElected { epoch: 1, from: "z".into() }, &t);
        assert_eq!(q.state(), QuorumState::Election);
        assert_eq!(q.leader(), None);

        q.handle(Event::VoteReceived { epoch: 1, vote: 17, from: "b".into() }, &t);
        assert_eq!(q.state(), QuorumState::Leader);
        assert_eq!(q.leader(), Some("a"));
    }

    #[test]
    fn test_election_result_while_voting_waits_for_tally() {
        let t = RecordingTransport::with_peers(&["a"]);
        let mut q = quorum("b", vec![17]);
        q.handle(Event::LeaderRequested { from: "a".into() }, &t);
        q.handle(Event::LeaderElected { epoch: 1, from: "a".into() }, &t);
        assert_eq!(q.state(), QuorumState::Election);
        assert_eq!(q.leader(), None);

        q.handle(Event::VoteReceived { epoch: 1, vote: 42, from: "a".into() }, &t);
        assert_eq!(q.state(), QuorumState::Leader);
        assert_eq!(q.leader(), Some("a"));
        assert_eq!(q.epoch(), 1);
    }

    #[test]
    fn test_election_result_disagreeing_with_tally_restarts_vote() {
        let t = RecordingTransport::with_peers(&["b"]);
        let mut q = quorum("a", vec![42, 43]);
        q.handle(Event::LeaderRequested { from: "b".into() }, &t);
        q.handle(Event::LeaderElected { epoch: 1, from: "b".into() }, &t);
        t.take_broadcasts();

        q.handle(Event::VoteReceived { epoch: 1, vote: 17, from: "b".into() }, &t);
        assert_eq!(q.state(), QuorumState::Election);
        assert_eq!(q.epoch(), 2);
        assert_eq!(q.leader(), None);
        assert!(t
            .take_broadcasts()
            .iter()
            .all(|m| !matches!(m, Message::LeaderElected { .. })));
    }

    #[test]
    fn test_leader_answers_leader_request_directly() {
        let t = RecordingTransport::with_peers(&["b", "c"]);
        let mut q = quorum("a", vec![42]);
        q.handle(Event::LeaderRequested { from: "b".into() }, &t);
        q.handle(Event::VoteReceived { epoch: 1, vote: 1, from: "b".into() }, &t);
        q.handle(Event::VoteReceived { epoch: 1, vote: 2, from: "c".into() }, &t);
        assert_eq!(q.leader(), Some("a"));

        q.handle(Event::LeaderRequested { from: "c".into() }, &t);
        assert_eq!(q.state(), QuorumState::Leader);
        let sent = t.sent.lock().unwrap();
        assert_eq!(
            sent.last(),
            Some(&(
                "c".to_string(),
                Message::LeaderAnnouncement {
                    leader_node_id: "a".into(),
                    from_node_id: "a".into()
                }
            ))
        );
    }

    #[test]
    fn test_announcement_adopted_while_requesting() {
        let t = RecordingTransport::with_peers(&["c"]);
        let mut q = quorum("d", vec![1]);
        q.handle(Event::PeerConnected { node_id: "c".into() }, &t);
        q.handle(Event::LeaderAnnounced { leader: "a".into(), from: "c".into() }, &t);
        assert_eq!(q.state(), QuorumState::Leader);
        assert_eq!(q.leader(), Some("a"));
    }

    #[test]
    fn test_election_timeout_returns_to_requesting() {
        let t = RecordingTransport::with_peers(&["b"]);
        let mut q = quorum("a", vec![42]);
        q.handle(Event::LeaderRequested { from: "b".into() }, &t);
        t.take_broadcasts();

        // A timer for another epoch is stale.
        q.handle(Event::ElectionTimeout { epoch: 7 }, &t);
        assert_eq!(q.state(), QuorumState::Election);

        q.handle(Event::ElectionTimeout { epoch: 1 }, &t);
        assert_eq!(q.state(), QuorumState::RequestingLeader);
        assert!(matches!(t.take_broadcasts()[..], [Message::RequestLeader { .. }]));
        assert_eq!(q.armed_timeout().map(|(e, _)| e), Some(1));
    }

    #[test]
    fn test_lonely_node_elects_itself_after_timeout() {
        let t = RecordingTransport::default();
        let mut q = quorum("solo", vec![3]);
        q.handle(Event::Started, &t);
        assert_eq!(q.armed_timeout().map(|(e, _)| e), Some(0));
        q.handle(Event::ElectionTimeout { epoch: 0 }, &t);
        assert_eq!(q.state(), QuorumState::Leader);
        assert_eq!(q.leader(), Some("solo"));
    }

    #[test]
    fn test_newcomer_during_election_restarts_vote() {
        let t = RecordingTransport::with_peers(&["b"]);
        let mut q = quorum("a", vec![42, 43]);
        q.handle(Event::LeaderRequested { from: "b".into() }, &t);
        t.peers.lock().unwrap().insert("c".into());
        q.handle(Event::PeerConnected { node_id: "c".into() }, &t);
        assert_eq!(q.epoch(), 2);
        assert!(q.participants(2).unwrap().contains("c"));
    }

    #[test]
    fn test_status_is_published() {
        let t = RecordingTransport::with_peers(&["b"]);
        let mut q = quorum("a", vec![42]);
        let status = q.status_handle();
        q.handle(Event::LeaderRequested { from: "b".into() }, &t);
        q.handle(Event::VoteReceived { epoch: 1, vote: 17, from: "b".into() }, &t);
        assert_eq!(
            status.get(),
            QuorumStatus {
                state: QuorumState::Leader,
                epoch: 1,
                leader: Some("a".into())
            }
        );
    }

    #[test]
    fn test_agent_fires_timeout() {
        let transport: Arc<dyn Transport> = Arc::new(RecordingTransport::default());
        let q = LeaderQuorum::new(NodeIdentity::new("solo", "127.0.0.1", 1), Duration::from_millis(50))
            .with_vote_source(|| 9);
        let agent = QuorumAgent::spawn(q, transport).unwrap();
        agent.submit(Event::Started);

        let mut leader = None;
        for _ in 0..100 {
            leader = agent.status().leader;
            if leader.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(leader.as_deref(), Some("solo"));
        agent.shutdown();
    }
}
