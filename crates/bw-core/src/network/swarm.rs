//! Swarm Management for Burrow
//!
//! [`PeerNetwork`] builds the libp2p swarm. [`PeerNetwork::spawn`] moves it
//! into a driver task; everything else talks to the swarm through the
//! cloneable [`NetworkHandle`].

use futures::StreamExt;
use libp2p::{
    Multiaddr, PeerId, Stream, Swarm, dcutr, identify,
    multiaddr::Protocol,
    ping, relay,
    swarm::{DialError, SwarmEvent, dial_opts::DialOpts, dial_opts::PeerCondition},
};
use libp2p_stream as stream;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::behaviour::{BurrowBehaviour, BurrowBehaviourEvent, TUNNEL_PROTOCOL};
use super::identity::PeerIdentity;
use crate::brand;
use crate::config::ClientConfig;
use crate::error::{BurrowError, Result};

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 256;

/// Events emitted by the peer network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Listening on an address
    Listening { address: Multiaddr },
    /// A connection to a peer came up
    PeerConnected { peer_id: PeerId, relayed: bool },
    /// A connection not going through a relay came up
    DirectConnection { peer_id: PeerId },
    /// DCUtR gave up on a peer
    HolePunchFailed { peer_id: PeerId, reason: String },
    /// Last connection to a peer closed
    PeerDisconnected { peer_id: PeerId },
    /// The relay server accepted our reservation
    ReservationAccepted { relay_peer_id: PeerId },
}

/// Open connections per peer
#[derive(Debug, Clone, Copy, Default)]
struct ConnectionCount {
    direct: usize,
    relayed: usize,
}

type Connections = Arc<RwLock<HashMap<PeerId, ConnectionCount>>>;

enum Command {
    Dial {
        peer_id: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// High-level peer network, before it is running
pub struct PeerNetwork {
    identity: PeerIdentity,
    swarm: Swarm<BurrowBehaviour>,
    server_addr: Option<Multiaddr>,
    listen_port: u16,
}

impl PeerNetwork {
    /// Create a new peer network from the client configuration
    pub async fn new(config: &ClientConfig) -> Result<Self> {
        let identity = PeerIdentity::load_or_generate(config.resolved_identity_path())?;
        Self::with_identity(identity, config)
    }

    /// Create a new peer network with an explicit identity
    pub fn with_identity(identity: PeerIdentity, config: &ClientConfig) -> Result<Self> {
        let local_peer_id = *identity.peer_id();
        let keypair = identity.keypair().clone();
        let idle_timeout = config.idle_timeout();

        info!("Local peer ID: {}", local_peer_id);

        let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_quic()
            .with_relay_client(libp2p::noise::Config::new, libp2p::yamux::Config::default)
            .map_err(|e| BurrowError::NetworkInitialization(e.to_string()))?
            .with_behaviour(|key, relay| BurrowBehaviour::new(key, relay))
            .map_err(|e| BurrowError::NetworkInitialization(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(idle_timeout))
            .build();

        Ok(Self {
            identity,
            swarm,
            server_addr: config.server_multiaddr()?,
            listen_port: config.listen_port,
        })
    }

    /// Get our peer ID
    pub fn peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    /// Get our `burrow://` link
    pub fn link(&self) -> String {
        self.identity.to_link()
    }

    /// Start listening, reach out to the relay server and hand the swarm
    /// to a driver task.
    pub fn spawn(mut self) -> Result<NetworkHandle> {
        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/udp/{}/quic-v1", self.listen_port)
            .parse()
            .map_err(|e| BurrowError::NetworkInitialization(format!("Invalid address: {}", e)))?;
        self.swarm.listen_on(listen_addr)?;

        // Also try IPv6
        if let Ok(addr) = format!("/ip6/::/udp/{}/quic-v1", self.listen_port).parse::<Multiaddr>() {
            if let Err(e) = self.swarm.listen_on(addr) {
                debug!("IPv6 listener unavailable: {}", e);
            }
        }

        let server_peer = self.server_addr.as_ref().and_then(peer_of);
        if let Some(server_addr) = &self.server_addr {
            info!("Dialing relay server: {}", server_addr);
            self.swarm
                .dial(server_addr.clone())
                .map_err(|e| BurrowError::DialError(e.to_string()))?;

            // Peers reach us through a circuit on the relay.
            self.swarm
                .listen_on(server_addr.clone().with(Protocol::P2pCircuit))?;
        } else {
            warn!("No server_addr configured, only directly reachable peers will connect");
        }

        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let connections: Connections = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let control = self.swarm.behaviour().stream_control();

        let driver = Driver {
            swarm: self.swarm,
            server_addr: self.server_addr,
            server_peer,
            commands: command_rx,
            events: event_tx.clone(),
            connections: Arc::clone(&connections),
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(driver.run());

        Ok(NetworkHandle {
            local_peer_id: *self.identity.peer_id(),
            commands: command_tx,
            events: event_tx,
            control,
            connections,
            shutdown,
            task: Arc::new(std::sync::Mutex::new(Some(task))),
        })
    }
}

fn peer_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|protocol| match protocol {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

/// Owns the swarm and translates its events
struct Driver {
    swarm: Swarm<BurrowBehaviour>,
    server_addr: Option<Multiaddr>,
    server_peer: Option<PeerId>,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<NetworkEvent>,
    connections: Connections,
    shutdown: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        info!("Starting {} network...", brand::PRODUCT_NAME);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command),
                event = self.swarm.select_next_some() => self.handle_swarm_event(event).await,
            }
        }

        info!("{} network stopped", brand::PRODUCT_NAME);
    }

    fn emit(&self, event: NetworkEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { peer_id, reply } => {
                let condition = PeerCondition::DisconnectedAndNotDialing;
                let opts = match &self.server_addr {
                    Some(server_addr) => {
                        let circuit = server_addr
                            .clone()
                            .with(Protocol::P2pCircuit)
                            .with(Protocol::P2p(peer_id));
                        DialOpts::peer_id(peer_id)
                            .condition(condition)
                            .addresses(vec![circuit])
                            .build()
                    }
                    None => DialOpts::peer_id(peer_id).condition(condition).build(),
                };

                let result = dial_outcome(peer_id, self.swarm.dial(opts));
                if let Err(e) = &result {
                    warn!("Failed to dial {}: {}", peer_id, e);
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent<BurrowBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                self.emit(NetworkEvent::Listening { address });
            }

            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                let relayed = endpoint.is_relayed();
                info!(
                    "Connected to peer: {} ({})",
                    peer_id,
                    if relayed { "relayed" } else { "direct" }
                );

                {
                    let mut connections = self.connections.write().await;
                    let count = connections.entry(peer_id).or_default();
                    if relayed {
                        count.relayed += 1;
                    } else {
                        count.direct += 1;
                    }
                }

                self.emit(NetworkEvent::PeerConnected { peer_id, relayed });
                if !relayed && Some(peer_id) != self.server_peer {
                    self.emit(NetworkEvent::DirectConnection { peer_id });
                }
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                endpoint,
                num_established,
                ..
            } => {
                {
                    let mut connections = self.connections.write().await;
                    if let Some(count) = connections.get_mut(&peer_id) {
                        if endpoint.is_relayed() {
                            count.relayed = count.relayed.saturating_sub(1);
                        } else {
                            count.direct = count.direct.saturating_sub(1);
                        }
                    }
                    if num_established == 0 {
                        connections.remove(&peer_id);
                    }
                }

                if num_established == 0 {
                    info!("Disconnected from peer: {}", peer_id);
                    self.emit(NetworkEvent::PeerDisconnected { peer_id });
                }
            }

            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer_id) = peer_id {
                    warn!("Failed to connect to {}: {}", peer_id, error);
                }
            }

            SwarmEvent::ListenerError { error, .. } => {
                error!("Listener error: {}", error);
            }

            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: BurrowBehaviourEvent) {
        match event {
            BurrowBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                debug!("Identified peer {}: {:?}", peer_id, info.agent_version);
                for addr in info.listen_addrs {
                    self.swarm.add_peer_address(peer_id, addr);
                }
            }

            BurrowBehaviourEvent::Relay(relay::client::Event::ReservationReqAccepted {
                relay_peer_id,
                ..
            }) => {
                info!("Relay reservation accepted by {}", relay_peer_id);
                self.emit(NetworkEvent::ReservationAccepted { relay_peer_id });
            }

            BurrowBehaviourEvent::Dcutr(dcutr::Event {
                remote_peer_id,
                result,
            }) => match result {
                Ok(_) => {
                    info!("Hole punch succeeded with {}", remote_peer_id);
                }
                Err(e) => {
                    warn!("Hole punch failed with {}: {}", remote_peer_id, e);
                    self.emit(NetworkEvent::HolePunchFailed {
                        peer_id: remote_peer_id,
                        reason: e.to_string(),
                    });
                }
            },

            BurrowBehaviourEvent::Ping(ping::Event {
                peer,
                result: Err(e),
                ..
            }) => {
                debug!("Ping to {} failed: {}", peer, e);
            }

            // Stream events are handled separately via incoming streams
            _ => {}
        }
    }
}

/// Cloneable access to the running network
#[derive(Clone)]
pub struct NetworkHandle {
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<NetworkEvent>,
    control: stream::Control,
    connections: Connections,
    shutdown: CancellationToken,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl NetworkHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Subscribe to network events from now on
    pub fn events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// Control handle for opening and accepting streams
    pub fn control(&self) -> stream::Control {
        self.control.clone()
    }

    /// Dial a peer through the relay server. DCUtR upgrades the connection
    /// when both sides can hole punch.
    pub async fn dial(&self, peer_id: PeerId) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Dial { peer_id, reply })
            .await
            .map_err(|_| BurrowError::DialError("network is not running".to_string()))?;
        response
            .await
            .map_err(|_| BurrowError::DialError("network stopped while dialing".to_string()))?
    }

    pub async fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.connections.read().await.contains_key(peer_id)
    }

    pub async fn is_directly_connected(&self, peer_id: &PeerId) -> bool {
        self.connections
            .read()
            .await
            .get(peer_id)
            .is_some_and(|count| count.direct > 0)
    }

    /// Resolve once any connection (relayed or direct) to `peer_id` exists
    pub async fn ensure_connected(&self, peer_id: PeerId, limit: Duration) -> Result<()> {
        let mut events = self.events();
        if self.is_connected(&peer_id).await {
            return Ok(());
        }
        self.dial(peer_id).await?;
        // The dial may have been skipped for a connection that just came up.
        if self.is_connected(&peer_id).await {
            return Ok(());
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(NetworkEvent::PeerConnected { peer_id: peer, .. }) if peer == peer_id => {
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.is_connected(&peer_id).await {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(BurrowError::DialError("network stopped".to_string()));
                    }
                }
            }
        };

        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| BurrowError::DialError(format!("no connection to {} after {:?}", peer_id, limit)))?
    }

    /// Resolve once a direct connection to `peer_id` exists. Fails when
    /// hole punching gives up or the network stops.
    pub async fn wait_direct(&self, peer_id: PeerId) -> Result<()> {
        let mut events = self.events();
        if self.is_directly_connected(&peer_id).await {
            return Ok(());
        }
        self.dial(peer_id).await?;
        if self.is_directly_connected(&peer_id).await {
            return Ok(());
        }

        loop {
            match events.recv().await {
                Ok(NetworkEvent::DirectConnection { peer_id: peer }) if peer == peer_id => {
                    return Ok(());
                }
                Ok(NetworkEvent::HolePunchFailed { peer_id: peer, reason }) if peer == peer_id => {
                    return Err(BurrowError::DialError(format!("hole punch failed: {}", reason)));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Missed {} network events while waiting for {}", skipped, peer_id);
                    if self.is_directly_connected(&peer_id).await {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(BurrowError::DialError("network stopped".to_string()));
                }
            }
        }
    }

    /// Open a new outgoing tunnel stream to a peer
    pub async fn open_stream(&self, peer_id: PeerId) -> Result<Stream> {
        self.control
            .clone()
            .open_stream(peer_id, TUNNEL_PROTOCOL)
            .await
            .map_err(|e| BurrowError::StreamError(format!("Failed to open stream: {}", e)))
    }

    /// Incoming tunnel streams. Only one consumer may register.
    pub fn accept_streams(&self) -> Result<stream::IncomingStreams> {
        self.control
            .clone()
            .accept(TUNNEL_PROTOCOL)
            .map_err(|e| BurrowError::ProtocolNegotiation(e.to_string()))
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stop the driver task and drop the swarm
    pub async fn shutdown(&self) {
        info!("Shutting down {} network...", brand::PRODUCT_NAME);
        self.shutdown.cancel();

        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Network task failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for NetworkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkHandle")
            .field("local_peer_id", &self.local_peer_id.to_string())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Map the result of `Swarm::dial`. A dial skipped because the peer is
/// already connected or being dialed is success: callers go on to wait for
/// the connection events.
fn dial_outcome(peer_id: PeerId, result: std::result::Result<(), DialError>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(DialError::DialPeerConditionFalse(condition)) => {
            debug!("Not dialing {}: already connected or dialing ({:?})", peer_id, condition);
            Ok(())
        }
        Err(e) => Err(BurrowError::DialError(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_in_progress_is_not_an_error() {
        let peer = *PeerIdentity::generate().peer_id();

        let pending = Err(DialError::DialPeerConditionFalse(
            PeerCondition::DisconnectedAndNotDialing,
        ));
        dial_outcome(peer, pending).unwrap();
        dial_outcome(peer, Ok(())).unwrap();

        let aborted = dial_outcome(peer, Err(DialError::Aborted));
        assert!(matches!(aborted, Err(BurrowError::DialError(_))));
        let no_route = dial_outcome(peer, Err(DialError::NoAddresses));
        assert!(matches!(no_route, Err(BurrowError::DialError(_))));
    }

    #[test]
    fn test_peer_of_server_addr() {
        let peer = PeerIdentity::generate();
        let addr: Multiaddr = format!("/ip4/1.2.3.4/udp/7000/quic-v1/p2p/{}", peer.peer_id())
            .parse()
            .unwrap();
        assert_eq!(peer_of(&addr), Some(*peer.peer_id()));

        let bare: Multiaddr = "/ip4/1.2.3.4/udp/7000/quic-v1".parse().unwrap();
        assert_eq!(peer_of(&bare), None);
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let config = ClientConfig::default();
        let network = PeerNetwork::with_identity(PeerIdentity::generate(), &config).unwrap();
        let peer_id = *network.peer_id();

        let handle = network.spawn().unwrap();
        let mut events = handle.events();
        assert_eq!(handle.local_peer_id(), peer_id);

        let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, NetworkEvent::Listening { .. }));

        let _incoming = handle.accept_streams().unwrap();
        assert!(handle.accept_streams().is_err());

        handle.shutdown().await;
        assert!(!handle.is_running());
        assert!(handle.dial(*PeerIdentity::generate().peer_id()).await.is_err());
    }
}
