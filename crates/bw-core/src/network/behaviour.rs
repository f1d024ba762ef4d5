//! Network Behaviour for Burrow
//!
//! The protocol stack every Burrow node runs: identify and ping for peer
//! bookkeeping, the relay client and DCUtR to reach peers behind NAT, and
//! raw streams carrying tunnel sessions.

use libp2p::{PeerId, StreamProtocol, dcutr, identify, identity::Keypair, ping, relay, swarm::NetworkBehaviour};
use std::time::Duration;

use crate::brand;

/// Protocol of tunnel streams
pub const TUNNEL_PROTOCOL: StreamProtocol = StreamProtocol::new("/burrow/tunnel/1.0.0");

/// Identify protocol version announced to peers
pub const IDENTIFY_PROTOCOL: &str = "/burrow/id/1.0.0";

/// Liveness probing of open connections. Relayed connections must stay
/// busy enough for the relay not to reap them.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// `burrow/<version>`, sent in identify
pub fn agent_version() -> String {
    format!("{}/{}", brand::BIN_NAME, env!("CARGO_PKG_VERSION"))
}

#[derive(NetworkBehaviour)]
pub struct BurrowBehaviour {
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    /// Handed over by the swarm builder together with its transport
    pub relay: relay::client::Behaviour,
    pub dcutr: dcutr::Behaviour,
    pub stream: libp2p_stream::Behaviour,
}

impl BurrowBehaviour {
    pub fn new(key: &Keypair, relay: relay::client::Behaviour) -> Self {
        let local_peer_id = PeerId::from(key.public());

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), key.public())
                .with_agent_version(agent_version())
                .with_push_listen_addr_updates(true),
        );
        let ping = ping::Behaviour::new(
            ping::Config::new()
                .with_interval(PING_INTERVAL)
                .with_timeout(PING_TIMEOUT),
        );

        Self {
            identify,
            ping,
            relay,
            dcutr: dcutr::Behaviour::new(local_peer_id),
            stream: libp2p_stream::Behaviour::new(),
        }
    }

    /// Handle for opening and accepting tunnel streams
    pub fn stream_control(&self) -> libp2p_stream::Control {
        self.stream.new_control()
    }
}
