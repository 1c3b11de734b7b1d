//! The protocol engine: peer state machine and group bookkeeping.
//!
//! [`Engine`] owns the peer registry and the group table and performs no I/O.
//! Each input (beacon, inbound frame, disconnect, tick, command) mutates state
//! and queues [`Action`]s that the node's event loop carries out in order:
//! opening and closing peer links, sending frames, emitting events.
//!
//! Peer lifecycle:
//!
//! ```text
//! (unknown) --beacon/HELLO--> Connecting --any frame--> Connected
//! Connected --silence > evasive--> Evasive --any frame--> Connected
//! Connected/Evasive --silence > expired | disconnect | leave beacon--> Expired (removed)
//! ```

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, trace, warn};

use crate::beacon::ReceivedBeacon;
use crate::config::NodeConfig;
use crate::event::{Command, Event, Query};
use crate::group::GroupTable;
use crate::identity::{NodeIdentity, PeerId};
use crate::message::{Envelope, Message};
use crate::peer::{ConnId, Peer, PeerRegistry, PeerStatus};

/// Side effect requested by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the outbound link to a peer's mailbox.
    Connect { peer: PeerId, endpoint: SocketAddr },
    /// Queue a frame on a peer's outbound link.
    Send { peer: PeerId, envelope: Envelope },
    /// Close a peer's outbound link after flushing it.
    Disconnect { peer: PeerId },
    /// Deliver an event to the application.
    Emit(Event),
}

/// Why a peer is being removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitReason {
    Expired,
    Disconnected,
    Left,
    Replaced,
    Shutdown,
}

pub struct Engine {
    identity: NodeIdentity,
    mailbox_port: u16,
    evasive_timeout: Duration,
    expired_timeout: Duration,
    probe_interval: Duration,
    peers: PeerRegistry,
    groups: GroupTable,
    actions: Vec<Action>,
}

impl Engine {
    pub fn new(identity: NodeIdentity, config: &NodeConfig, mailbox_port: u16) -> Self {
        Self {
            identity,
            mailbox_port,
            evasive_timeout: config.evasive_timeout,
            expired_timeout: config.expired_timeout,
            probe_interval: config.beacon_interval,
            peers: PeerRegistry::new(),
            groups: GroupTable::new(),
            actions: Vec::new(),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn groups(&self) -> &GroupTable {
        &self.groups
    }

    /// Drain the actions queued so far, oldest first.
    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    /// HELLO for a peer link. Sent with sequence 0 on anonymous greeting
    /// links, which never carry anything else.
    pub fn hello(&self) -> Message {
        Message::Hello {
            mailbox_port: self.mailbox_port,
            name: self.identity.name.clone(),
            headers: self.identity.headers.clone(),
            groups: self.groups.own_groups(),
        }
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    /// A beacon arrived from another node.
    pub fn on_beacon(&mut self, received: ReceivedBeacon, now: Instant) {
        let id = received.beacon.peer_id;
        if id == self.identity.peer_id {
            return;
        }

        if received.beacon.is_leaving() {
            if self.peers.contains(&id) {
                debug!("Peer {id} announced it is leaving");
                self.remove_peer(&id, ExitReason::Left);
            }
            return;
        }

        let endpoint = received.endpoint();
        match self.peers.lookup_mut(&id) {
            Some(peer) if peer.endpoint == endpoint => {
                peer.refresh(now);
                if peer.status == PeerStatus::Evasive {
                    info!("Peer '{}' ({id}) is back", peer.name);
                    peer.status = PeerStatus::Connected;
                }
            }
            Some(peer) => {
                info!(
                    "Peer {id} moved from {} to {endpoint}, reconnecting",
                    peer.endpoint
                );
                self.remove_peer(&id, ExitReason::Replaced);
                self.connect_peer(id, endpoint, now);
            }
            None => {
                debug!("Discovered peer {id} at {endpoint}");
                self.connect_peer(id, endpoint, now);
            }
        }
    }

    /// A frame arrived on inbound connection `conn` from `remote`.
    pub fn on_envelope(&mut self, conn: ConnId, remote: SocketAddr, envelope: Envelope, now: Instant) {
        let id = envelope.sender;
        if id == self.identity.peer_id {
            return;
        }

        if !self.peers.contains(&id) {
            let Message::Hello { mailbox_port, .. } = &envelope.message else {
                debug!(
                    "Discarding {} from unknown peer {id}",
                    envelope.message.kind()
                );
                return;
            };
            let endpoint = SocketAddr::new(remote.ip(), *mailbox_port);
            debug!("Unsolicited HELLO from {id} at {endpoint}");
            self.connect_peer(id, endpoint, now);
        }

        let Some(peer) = self.peers.lookup_mut(&id) else {
            return;
        };
        if peer.is_duplicate(envelope.sequence) {
            trace!(
                "Dropping duplicate {} #{} from {id}",
                envelope.message.kind(),
                envelope.sequence
            );
            return;
        }
        peer.recv_sequence = peer.recv_sequence.max(envelope.sequence);
        peer.refresh(now);
        // Greetings (sequence 0) come over one-shot links that close right away.
        if envelope.sequence > 0 {
            peer.inbound = Some(conn);
        }
        if peer.status == PeerStatus::Evasive {
            info!("Peer '{}' ({id}) is back", peer.name);
            peer.status = PeerStatus::Connected;
        }

        self.dispatch(id, envelope.message);
    }

    /// An inbound connection closed. `peer` is the last sender seen on it.
    pub fn on_disconnect(&mut self, conn: ConnId, peer: Option<PeerId>) {
        let Some(id) = peer else {
            return;
        };
        let current = self.peers.lookup(&id).and_then(|p| p.inbound);
        if current == Some(conn) {
            debug!("Inbound link from {id} closed");
            self.remove_peer(&id, ExitReason::Disconnected);
        }
    }

    /// Our outbound link to `id` failed. The peer keeps its state and the
    /// link is reopened, with a fresh HELLO, on the first tick one probe
    /// interval later.
    pub fn on_link_failed(&mut self, id: &PeerId, now: Instant) {
        if let Some(peer) = self.peers.lookup_mut(id) {
            debug!("Link to '{}' ({id}) is down", peer.name);
            peer.link_failed = Some(now);
        }
    }

    /// Periodic housekeeping: liveness probes, link retries and timeout
    /// transitions.
    pub fn tick(&mut self, now: Instant) {
        for id in self.peers.ids() {
            let Some(peer) = self.peers.lookup(&id) else {
                continue;
            };
            if now.saturating_duration_since(peer.last_seen) >= self.expired_timeout {
                self.remove_peer(&id, ExitReason::Expired);
                continue;
            }
            let relink_due = peer
                .link_failed
                .is_some_and(|at| now.saturating_duration_since(at) >= self.probe_interval);
            if relink_due {
                self.relink(&id);
            }

            let Some(peer) = self.peers.lookup_mut(&id) else {
                continue;
            };
            let silence = now.saturating_duration_since(peer.last_seen);
            let status = peer.status;
            let ping_due = peer
                .last_ping
                .is_none_or(|at| now.saturating_duration_since(at) >= self.probe_interval);

            if silence >= self.evasive_timeout {
                match status {
                    PeerStatus::Connected => {
                        info!("Peer '{}' ({id}) is evasive", peer.name);
                        peer.status = PeerStatus::Evasive;
                        let name = peer.name.clone();
                        self.actions.push(Action::Emit(Event::Evasive { peer: id, name }));
                        self.ping(&id, now);
                    }
                    PeerStatus::Evasive if ping_due => self.ping(&id, now),
                    _ => {}
                }
            } else if silence >= self.evasive_timeout / 2
                && status == PeerStatus::Connected
                && ping_due
            {
                self.ping(&id, now);
            }
        }
    }

    /// Apply a command from the application.
    pub fn on_command(&mut self, command: Command) {
        match command {
            Command::Join(group) => self.join(group),
            Command::Leave(group) => self.leave(group),
            Command::Whisper(id, payload) => self.whisper(id, payload),
            Command::Shout(group, payload) => self.shout(group, payload),
            Command::Query(query) => self.answer(query),
            Command::Stop => self.shutdown(),
        }
    }

    /// Remove every peer with an EXIT, then emit STOP.
    pub fn shutdown(&mut self) {
        info!(
            "Shutting down, releasing {} peer(s)",
            self.peers.len()
        );
        for id in self.peers.ids() {
            self.remove_peer(&id, ExitReason::Shutdown);
        }
        self.actions.push(Action::Emit(Event::Stop));
    }

    // -----------------------------------------------------------------------
    // Frame dispatch
    // -----------------------------------------------------------------------

    fn dispatch(&mut self, id: PeerId, message: Message) {
        let Some(peer) = self.peers.lookup_mut(&id) else {
            return;
        };

        if let Message::Hello {
            name,
            headers,
            groups,
            ..
        } = message
        {
            if !peer.status.is_entered() {
                if !name.is_empty() {
                    peer.name = name;
                }
                peer.headers = headers;
                self.enter(&id);
            }
            for group in groups {
                self.join_remote(&id, group);
            }
            return;
        }

        if peer.status == PeerStatus::Connecting {
            self.enter(&id);
        }

        match message {
            Message::Hello { .. } => {}
            Message::Join { group } => self.join_remote(&id, group),
            Message::Leave { group } => self.leave_remote(&id, group),
            Message::Whisper { payload } => {
                let name = self.peer_name(&id);
                self.actions.push(Action::Emit(Event::Whisper {
                    peer: id,
                    name,
                    payload,
                }));
            }
            Message::Shout { group, payload } => {
                if !self.groups.is_own(&group) {
                    debug!("Dropping SHOUT to {group} from {id}: not a member");
                    return;
                }
                let name = self.peer_name(&id);
                self.actions.push(Action::Emit(Event::Shout {
                    peer: id,
                    name,
                    group,
                    payload,
                }));
            }
            Message::Ping => self.send(&id, Message::PingOk),
            Message::PingOk => trace!("PING_OK from {id}"),
            Message::Rename { name } => {
                if let Some(peer) = self.peers.lookup_mut(&id) {
                    debug!("Peer {id} renamed '{}' -> '{name}'", peer.name);
                    peer.name = name;
                }
            }
        }
    }

    fn enter(&mut self, id: &PeerId) {
        let Some(peer) = self.peers.lookup_mut(id) else {
            return;
        };
        peer.status = PeerStatus::Connected;
        peer.connected_at = Some(Utc::now());
        info!("Peer '{}' ({id}) entered from {}", peer.name, peer.endpoint);
        self.actions.push(Action::Emit(Event::Enter {
            peer: *id,
            name: peer.name.clone(),
            headers: peer.headers.clone(),
            endpoint: peer.endpoint,
        }));
    }

    fn join_remote(&mut self, id: &PeerId, group: String) {
        let Some(peer) = self.peers.lookup_mut(id) else {
            return;
        };
        if !self.groups.join_peer(&group, *id) {
            return;
        }
        peer.groups.insert(group.clone());
        debug!("Peer '{}' joined {group}", peer.name);
        self.actions.push(Action::Emit(Event::Join {
            peer: *id,
            name: peer.name.clone(),
            group,
        }));
    }

    fn leave_remote(&mut self, id: &PeerId, group: String) {
        let Some(peer) = self.peers.lookup_mut(id) else {
            return;
        };
        if !self.groups.leave_peer(&group, id) {
            return;
        }
        peer.groups.remove(&group);
        debug!("Peer '{}' left {group}", peer.name);
        self.actions.push(Action::Emit(Event::Leave {
            peer: *id,
            name: peer.name.clone(),
            group,
        }));
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn join(&mut self, group: String) {
        if !self.groups.join_own(&group) {
            return;
        }
        info!("Joining group {group}");
        for id in self.peers.ids() {
            self.send(&id, Message::Join {
                group: group.clone(),
            });
        }
    }

    fn leave(&mut self, group: String) {
        if !self.groups.leave_own(&group) {
            return;
        }
        info!("Leaving group {group}");
        for id in self.peers.ids() {
            self.send(&id, Message::Leave {
                group: group.clone(),
            });
        }
    }

    fn whisper(&mut self, id: PeerId, payload: Vec<u8>) {
        if !self.peers.contains(&id) {
            warn!("WHISPER to unknown peer {id} dropped");
            return;
        }
        self.send(&id, Message::Whisper { payload });
    }

    fn shout(&mut self, group: String, payload: Vec<u8>) {
        let mut members: Vec<PeerId> = self
            .groups
            .members_of(&group)
            .into_iter()
            .filter(|id| {
                self.peers
                    .lookup(id)
                    .is_some_and(|p| p.status.is_entered())
            })
            .collect();
        members.sort();
        trace!("SHOUT to {group} reaches {} peer(s)", members.len());
        for id in members {
            self.send(&id, Message::Shout {
                group: group.clone(),
                payload: payload.clone(),
            });
        }
    }

    fn answer(&self, query: Query) {
        // A dropped receiver just means the caller stopped waiting.
        match query {
            Query::Peers(reply) => {
                let _ = reply.send(self.peers.each().map(Peer::snapshot).collect());
            }
            Query::OwnGroups(reply) => {
                let _ = reply.send(self.groups.own_groups());
            }
            Query::PeerGroups(id, reply) => {
                let groups = self
                    .peers
                    .lookup(&id)
                    .map(|p| p.groups.iter().cloned().collect());
                let _ = reply.send(groups);
            }
            Query::PeersByGroup(group, reply) => {
                let mut members = self.groups.members_of(&group);
                members.sort();
                let _ = reply.send(members);
            }
            Query::PeerHeader(id, key, reply) => {
                let value = self
                    .peers
                    .lookup(&id)
                    .and_then(|p| p.headers.get(&key).cloned());
                let _ = reply.send(value);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn connect_peer(&mut self, id: PeerId, endpoint: SocketAddr, now: Instant) {
        self.peers.insert(Peer::new(id, endpoint, now));
        self.actions.push(Action::Connect { peer: id, endpoint });
        let hello = self.hello();
        self.send(&id, hello);
    }

    fn relink(&mut self, id: &PeerId) {
        let Some(peer) = self.peers.lookup_mut(id) else {
            return;
        };
        peer.link_failed = None;
        let endpoint = peer.endpoint;
        info!("Reopening link to '{}' ({id}) at {endpoint}", peer.name);
        self.actions.push(Action::Connect { peer: *id, endpoint });
        let hello = self.hello();
        self.send(id, hello);
    }

    fn send(&mut self, id: &PeerId, message: Message) {
        let Some(peer) = self.peers.lookup_mut(id) else {
            return;
        };
        let envelope = Envelope::new(self.identity.peer_id, peer.next_sequence(), message);
        self.actions.push(Action::Send { peer: *id, envelope });
    }

    fn ping(&mut self, id: &PeerId, now: Instant) {
        if let Some(peer) = self.peers.lookup_mut(id) {
            peer.last_ping = Some(now);
        }
        self.send(id, Message::Ping);
    }

    fn peer_name(&self, id: &PeerId) -> String {
        self.peers
            .lookup(id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| id.short())
    }

    fn remove_peer(&mut self, id: &PeerId, reason: ExitReason) {
        let Some((mut peer, _groups)) = self.peers.remove(id, &mut self.groups) else {
            return;
        };
        self.actions.push(Action::Disconnect { peer: *id });

        if !peer.expire().is_entered() {
            debug!("Dropping peer {id} before handshake ({reason:?})");
            return;
        }
        info!("Peer '{}' ({id}) exited: {reason:?}", peer.name);
        self.actions.push(Action::Emit(Event::Exit {
            peer: *id,
            name: peer.name,
        }));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
