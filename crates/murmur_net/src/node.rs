//! Node: the public entry point and the reactor that drives the engine.
//!
//! [`Node`] owns the configuration and identity before start, and the event
//! receiver afterwards. Starting a node binds the mailbox and beacon sockets,
//! then spawns one event loop task that multiplexes:
//! - beacons from the UDP socket
//! - frames and disconnects from the mailbox server
//! - a housekeeping tick (timeouts, probes, beacon cadence)
//! - commands from the application
//!
//! All protocol state lives in a single [`Engine`] owned by that task, so
//! nothing here needs a lock.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::beacon::{BeaconRoute, BeaconSocket, ReceivedBeacon};
use crate::config::NodeConfig;
use crate::engine::{Action, Engine};
use crate::error::NetworkError;
use crate::event::{Command, Event, Query};
use crate::identity::{NodeIdentity, PeerId};
use crate::message::Envelope;
use crate::peer::PeerInfo;
use crate::transport::{self, PeerLink, TransportEvent};

/// A murmur node.
///
/// Create one per application instance, set headers, then call
/// [`start()`](Node::start). Events are read with [`recv()`](Node::recv);
/// commands can also be sent from other tasks through a [`NodeHandle`].
pub struct Node {
    identity: NodeIdentity,
    config: NodeConfig,
    running: Option<Running>,
}

struct Running {
    handle: NodeHandle,
    events: mpsc::Receiver<Event>,
    task: JoinHandle<()>,
    mailbox: SocketAddr,
}

impl Node {
    /// Create a node with a fresh identity. The name comes from the config.
    pub fn new(config: NodeConfig) -> Self {
        let identity = NodeIdentity::generate(config.name.clone().unwrap_or_default());
        Self::with_identity(identity, config)
    }

    /// Create a node with an explicit identity.
    pub fn with_identity(identity: NodeIdentity, config: NodeConfig) -> Self {
        Self {
            identity,
            config,
            running: None,
        }
    }

    /// Create a node with default config.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::with_identity(NodeIdentity::generate(name), NodeConfig::default())
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Local address of the mailbox server, once started.
    pub fn mailbox_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.mailbox)
    }

    /// Set a header announced in HELLO. Only allowed before start.
    pub fn set_header(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), NetworkError> {
        if self.running.is_some() {
            return Err(NetworkError::AlreadyRunning);
        }
        self.identity.headers.insert(key.into(), value.into());
        Ok(())
    }

    /// Bind sockets and spawn the event loop. Calling it on a running node
    /// is a no-op.
    ///
    /// Configuration and bind errors are returned here, before anything is
    /// spawned.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.running.is_some() {
            return Ok(());
        }
        self.config.validate()?;

        let route = BeaconRoute::resolve(self.config.interface.as_deref(), self.config.beacon_addr)?;
        let host = route.local.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let bind_addr = SocketAddr::from((host, self.config.port));
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| NetworkError::Transport(format!("Bind mailbox {bind_addr}: {e}")))?;
        let mailbox = listener.local_addr()?;

        let beacon = if self.config.beacon_enabled {
            Some(BeaconSocket::bind(
                self.config.beacon_port,
                route,
                self.identity.peer_id,
            )?)
        } else {
            None
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        let (transport_tx, transport_rx) = mpsc::channel(self.config.outbox_capacity);
        let (event_tx, event_rx) = mpsc::channel(self.config.event_capacity);
        let (command_tx, command_rx) = mpsc::channel(self.config.command_capacity);

        tokio::spawn(transport::run_mailbox(
            listener,
            transport_tx.clone(),
            shutdown_tx.subscribe(),
        ));

        let event_loop = EventLoop {
            engine: Engine::new(self.identity.clone(), &self.config, mailbox.port()),
            mailbox_port: mailbox.port(),
            tick: self.config.tick_interval(),
            config: self.config.clone(),
            beacon,
            links: HashMap::new(),
            closing: Vec::new(),
            transport_tx,
            transport_rx,
            commands: command_rx,
            events: event_tx,
            mailbox_shutdown: shutdown_tx,
            last_announce: None,
        };
        let task = tokio::spawn(event_loop.run());

        self.running = Some(Running {
            handle: NodeHandle {
                commands: command_tx,
            },
            events: event_rx,
            task,
            mailbox,
        });
        info!(
            "Node '{}' started (peer_id: {}, mailbox: {mailbox})",
            self.identity.name, self.identity.peer_id
        );
        Ok(())
    }

    /// Stop the node. Returns every event not yet received, ending with
    /// [`Event::Stop`].
    pub async fn stop(&mut self) -> Result<Vec<Event>, NetworkError> {
        let Some(mut running) = self.running.take() else {
            return Err(NetworkError::NotRunning);
        };

        // Sent from its own task: the loop may be blocked handing us events.
        let commands = running.handle.commands.clone();
        let stopper = tokio::spawn(async move {
            let _ = commands.send(Command::Stop).await;
        });

        let mut drained = Vec::new();
        while let Some(event) = running.events.recv().await {
            let last = event == Event::Stop;
            drained.push(event);
            if last {
                break;
            }
        }

        let _ = stopper.await;
        if let Err(e) = running.task.await {
            error!("Event loop task failed: {e}");
        }
        info!("Node '{}' stopped", self.identity.name);
        Ok(drained)
    }

    /// A cloneable handle for sending commands from other tasks.
    pub fn handle(&self) -> Result<NodeHandle, NetworkError> {
        self.running
            .as_ref()
            .map(|r| r.handle.clone())
            .ok_or(NetworkError::NotRunning)
    }

    /// Next event, or `None` once the node is stopped.
    pub async fn recv(&mut self) -> Option<Event> {
        match &mut self.running {
            Some(running) => running.events.recv().await,
            None => None,
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.running.as_mut()?.events.try_recv().ok()
    }

    /// Next event, waiting at most `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Event, NetworkError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(NetworkError::NotRunning),
            Err(_) => Err(NetworkError::Timeout(timeout)),
        }
    }

    pub async fn join(&self, group: impl Into<String>) -> Result<(), NetworkError> {
        self.running_handle()?.join(group).await
    }

    pub async fn leave(&self, group: impl Into<String>) -> Result<(), NetworkError> {
        self.running_handle()?.leave(group).await
    }

    pub async fn whisper(&self, peer: PeerId, payload: impl Into<Vec<u8>>) -> Result<(), NetworkError> {
        self.running_handle()?.whisper(peer, payload).await
    }

    pub async fn shout(
        &self,
        group: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), NetworkError> {
        self.running_handle()?.shout(group, payload).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>, NetworkError> {
        self.running_handle()?.peers().await
    }

    pub async fn own_groups(&self) -> Result<Vec<String>, NetworkError> {
        self.running_handle()?.own_groups().await
    }

    pub async fn peer_groups(&self, peer: PeerId) -> Result<Option<Vec<String>>, NetworkError> {
        self.running_handle()?.peer_groups(peer).await
    }

    pub async fn peers_by_group(&self, group: impl Into<String>) -> Result<Vec<PeerId>, NetworkError> {
        self.running_handle()?.peers_by_group(group).await
    }

    pub async fn peer_header(
        &self,
        peer: PeerId,
        key: impl Into<String>,
    ) -> Result<Option<String>, NetworkError> {
        self.running_handle()?.peer_header(peer, key).await
    }

    fn running_handle(&self) -> Result<&NodeHandle, NetworkError> {
        self.running
            .as_ref()
            .map(|r| &r.handle)
            .ok_or(NetworkError::NotRunning)
    }
}

/// Sends commands to a running node. Cheap to clone.
///
/// Every call fails with [`NetworkError::NotRunning`] once the node's event
/// loop has exited. Sends wait while the command channel is full.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<Command>,
}

impl NodeHandle {
    /// Join a group and tell every peer about it.
    pub async fn join(&self, group: impl Into<String>) -> Result<(), NetworkError> {
        self.send(Command::Join(group.into())).await
    }

    pub async fn leave(&self, group: impl Into<String>) -> Result<(), NetworkError> {
        self.send(Command::Leave(group.into())).await
    }

    /// Send a payload to one peer. Unknown peers are logged and skipped.
    pub async fn whisper(&self, peer: PeerId, payload: impl Into<Vec<u8>>) -> Result<(), NetworkError> {
        self.send(Command::Whisper(peer, payload.into())).await
    }

    /// Send a payload to every peer in a group.
    pub async fn shout(
        &self,
        group: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), NetworkError> {
        self.send(Command::Shout(group.into(), payload.into())).await
    }

    /// Snapshot of all known peers, oldest first.
    pub async fn peers(&self) -> Result<Vec<PeerInfo>, NetworkError> {
        self.query(Query::Peers).await
    }

    /// Groups this node has joined.
    pub async fn own_groups(&self) -> Result<Vec<String>, NetworkError> {
        self.query(Query::OwnGroups).await
    }

    /// Groups a peer has joined, or `None` for an unknown peer.
    pub async fn peer_groups(&self, peer: PeerId) -> Result<Option<Vec<String>>, NetworkError> {
        self.query(|reply| Query::PeerGroups(peer, reply)).await
    }

    /// Remote members of a group.
    pub async fn peers_by_group(&self, group: impl Into<String>) -> Result<Vec<PeerId>, NetworkError> {
        let group = group.into();
        self.query(|reply| Query::PeersByGroup(group, reply)).await
    }

    /// One header from a peer's HELLO.
    pub async fn peer_header(
        &self,
        peer: PeerId,
        key: impl Into<String>,
    ) -> Result<Option<String>, NetworkError> {
        let key = key.into();
        self.query(|reply| Query::PeerHeader(peer, key, reply)).await
    }

    async fn query<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Query) -> Result<T, NetworkError> {
        let (reply, answer) = oneshot::channel();
        self.send(Command::Query(build(reply))).await?;
        answer.await.map_err(|_| NetworkError::NotRunning)
    }

    async fn send(&self, command: Command) -> Result<(), NetworkError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NetworkError::NotRunning)
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

struct EventLoop {
    engine: Engine,
    config: NodeConfig,
    mailbox_port: u16,
    tick: Duration,
    beacon: Option<BeaconSocket>,
    /// Outbound link per registered peer.
    links: HashMap<PeerId, PeerLink>,
    /// Links flushing their last frames before they close.
    closing: Vec<JoinHandle<()>>,
    transport_tx: mpsc::Sender<TransportEvent>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<Event>,
    mailbox_shutdown: broadcast::Sender<()>,
    last_announce: Option<Instant>,
}

impl EventLoop {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.announce().await;

        loop {
            let delivered = tokio::select! {
                received = recv_beacon(self.beacon.as_ref()) => {
                    match received {
                        Ok(beacon) => self.engine.on_beacon(beacon, Instant::now().into_std()),
                        Err(e) => warn!("Beacon receive failed: {e}"),
                    }
                    self.apply().await
                }
                Some(event) = self.transport_rx.recv() => {
                    self.on_transport(event);
                    self.apply().await
                }
                _ = tick.tick() => {
                    if self.events.is_closed() {
                        debug!("Event receiver dropped, stopping");
                        break;
                    }
                    self.engine.tick(Instant::now().into_std());
                    self.closing.retain(|task| !task.is_finished());
                    let delivered = self.apply().await;
                    self.announce().await;
                    delivered
                }
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Stop) | None => break,
                        Some(command) => {
                            self.engine.on_command(command);
                            self.apply().await
                        }
                    }
                }
            };
            if !delivered {
                debug!("Event receiver dropped, stopping");
                break;
            }
        }

        self.shutdown().await;
    }

    fn on_transport(&mut self, event: TransportEvent) {
        let now = Instant::now().into_std();
        match event {
            TransportEvent::Frame {
                conn,
                remote,
                envelope,
            } => {
                trace!(
                    "<- {remote} {} #{} from {}",
                    envelope.message.kind(),
                    envelope.sequence,
                    envelope.sender
                );
                self.engine.on_envelope(conn, remote, envelope, now);
            }
            TransportEvent::Closed { conn, peer } => self.engine.on_disconnect(conn, peer),
            TransportEvent::LinkFailed {
                link,
                peer: Some(id),
                reason,
                ..
            } => {
                warn!("Link to {id} failed: {reason}");
                // Reports from a link that was already replaced are stale.
                if self.links.get(&id).is_some_and(|l| l.id() == link) {
                    if let Some(link) = self.links.remove(&id) {
                        self.closing.push(link.close());
                    }
                    self.engine.on_link_failed(&id, now);
                }
            }
            TransportEvent::LinkFailed {
                peer: None, reason, ..
            } => debug!("Greeting failed: {reason}"),
        }
    }

    /// Carry out the engine's queued actions. Returns `false` once the
    /// application has dropped its event receiver.
    async fn apply(&mut self) -> bool {
        let actions = self.engine.take_actions();
        self.perform(actions).await
    }

    async fn perform(&mut self, actions: Vec<Action>) -> bool {
        let mut delivered = true;
        for action in actions {
            match action {
                Action::Connect { peer, endpoint } => {
                    let link = PeerLink::spawn(
                        Some(peer),
                        endpoint,
                        self.config.connect_timeout,
                        self.config.outbox_capacity,
                        self.transport_tx.clone(),
                    );
                    if let Some(old) = self.links.insert(peer, link) {
                        self.closing.push(old.close());
                    }
                }
                Action::Send { peer, envelope } => match self.links.get(&peer) {
                    Some(link) => {
                        if let Err(e) = link.send(envelope) {
                            warn!("Dropping frame for {peer}: {e}");
                        }
                    }
                    None => debug!("No link to {peer}, dropping {}", envelope.message.kind()),
                },
                Action::Disconnect { peer } => {
                    if let Some(link) = self.links.remove(&peer) {
                        self.closing.push(link.close());
                    }
                }
                Action::Emit(event) => {
                    // Waits while the channel is full: a slow reader stalls
                    // the loop instead of losing events.
                    if delivered && self.events.send(event).await.is_err() {
                        delivered = false;
                    }
                }
            }
        }
        delivered
    }

    /// Beacon and greet known peers, once per beacon interval.
    async fn announce(&mut self) {
        let now = Instant::now();
        let due = self.last_announce.is_none_or(|at| {
            now.saturating_duration_since(at) + self.tick / 2 >= self.config.beacon_interval
        });
        if !due {
            return;
        }
        self.last_announce = Some(now);

        if let Some(beacon) = &self.beacon {
            if let Err(e) = beacon.send(self.mailbox_port).await {
                warn!("Beacon send failed: {e}");
            }
        }
        self.greet_known_peers();
    }

    /// Send a one-shot HELLO to every known peer address we are not yet
    /// linked with.
    fn greet_known_peers(&mut self) {
        let own_id = self.engine.identity().peer_id;
        for &endpoint in &self.config.known_peers {
            if self.engine.peers().each().any(|p| p.endpoint == endpoint) {
                continue;
            }
            debug!("Greeting known peer at {endpoint}");
            let link = PeerLink::spawn(
                None,
                endpoint,
                self.config.connect_timeout,
                1,
                self.transport_tx.clone(),
            );
            if let Err(e) = link.send(Envelope::new(own_id, 0, self.engine.hello())) {
                warn!("Greeting {endpoint} failed: {e}");
            }
            self.closing.push(link.close());
        }
    }

    /// Leave beacon, EXIT for every peer, close links, then STOP last.
    async fn shutdown(mut self) {
        if let Some(beacon) = &self.beacon {
            if let Err(e) = beacon.send(0).await {
                debug!("Leave beacon failed: {e}");
            }
        }

        self.engine.shutdown();
        let mut actions = self.engine.take_actions();
        actions.retain(|action| *action != Action::Emit(Event::Stop));
        let delivered = self.perform(actions).await;

        for (_, link) in self.links.drain() {
            self.closing.push(link.close());
        }
        let closing = std::mem::take(&mut self.closing);
        if tokio::time::timeout(self.config.connect_timeout, futures::future::join_all(closing))
            .await
            .is_err()
        {
            debug!("Some peer links did not close in time");
        }
        let _ = self.mailbox_shutdown.send(());

        if delivered {
            let _ = self.events.send(Event::Stop).await;
        }
        info!("Event loop stopped");
    }
}

/// Next beacon, or never when beacons are disabled.
async fn recv_beacon(socket: Option<&BeaconSocket>) -> Result<ReceivedBeacon, NetworkError> {
    match socket {
        Some(socket) => socket.recv().await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> NodeConfig {
        NodeConfig {
            beacon_enabled: false,
            beacon_interval: Duration::from_millis(50),
            evasive_timeout: Duration::from_millis(200),
            expired_timeout: Duration::from_millis(1000),
            ..NodeConfig::default()
        }
    }

    #[test]
    fn test_new_node_uses_config_name() {
        let node = Node::new(NodeConfig {
            name: Some("alpha".into()),
            ..NodeConfig::default()
        });
        assert_eq!(node.name(), "alpha");
        assert!(!node.is_running());
        assert!(node.mailbox_addr().is_none());

        let anonymous = Node::new(NodeConfig::default());
        assert_eq!(anonymous.name(), anonymous.peer_id().short());
    }

    #[tokio::test]
    async fn test_commands_require_running_node() {
        let node = Node::new(quiet_config());
        assert!(matches!(node.join("CHAT").await, Err(NetworkError::NotRunning)));
        assert!(matches!(node.peers().await, Err(NetworkError::NotRunning)));
        assert!(matches!(node.handle(), Err(NetworkError::NotRunning)));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_start() {
        let mut node = Node::new(NodeConfig {
            evasive_timeout: Duration::from_secs(10),
            expired_timeout: Duration::from_secs(1),
            ..quiet_config()
        });
        assert!(matches!(node.start().await, Err(NetworkError::Config(_))));
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_set_header_only_before_start() {
        let mut node = Node::new(quiet_config());
        node.set_header("X-ROLE", "tester").unwrap();
        assert_eq!(node.identity().headers.get("X-ROLE").map(String::as_str), Some("tester"));

        node.start().await.unwrap();
        assert!(matches!(
            node.set_header("X-ROLE", "other"),
            Err(NetworkError::AlreadyRunning)
        ));
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_stop_alone() {
        let mut node = Node::new(quiet_config());
        node.start().await.unwrap();
        // Second start is a no-op.
        node.start().await.unwrap();
        assert!(node.mailbox_addr().unwrap().port() > 0);

        node.join("CHAT").await.unwrap();
        assert_eq!(node.own_groups().await.unwrap(), vec!["CHAT".to_string()]);
        assert!(node.peers().await.unwrap().is_empty());

        let handle = node.handle().unwrap();
        let events = node.stop().await.unwrap();
        assert_eq!(events, vec![Event::Stop]);
        assert!(!node.is_running());
        assert!(matches!(handle.join("OTHER").await, Err(NetworkError::NotRunning)));
        assert!(matches!(node.stop().await, Err(NetworkError::NotRunning)));
    }

    #[tokio::test]
    async fn test_recv_timeout_elapses() {
        let mut node = Node::new(quiet_config());
        node.start().await.unwrap();
        match node.recv_timeout(Duration::from_millis(50)).await {
            Err(NetworkError::Timeout(d)) => assert_eq!(d, Duration::from_millis(50)),
            other => panic!("Expected timeout, got {other:?}"),
        }
        node.stop().await.unwrap();
    }
}
