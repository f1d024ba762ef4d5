//! P2P Networking
//!
//! libp2p identity, behaviour and swarm driver. Tunnel streams ride on
//! QUIC connections, relayed by the server or hole-punched with DCUtR.

pub mod behaviour;
pub mod identity;
pub mod swarm;

pub use behaviour::{BurrowBehaviour, BurrowBehaviourEvent, TUNNEL_PROTOCOL};
pub use identity::PeerIdentity;
pub use swarm::{NetworkEvent, NetworkHandle, PeerNetwork};
