//! Node identity and `burrow://` links

use libp2p::identity::{Keypair, PeerId};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tracing::info;

use crate::brand;
use crate::error::{BurrowError, Result};

/// Ed25519 keypair of this node and the peer ID derived from it
#[derive(Clone)]
pub struct PeerIdentity {
    keypair: Keypair,
    peer_id: PeerId,
}

impl PeerIdentity {
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate_ed25519())
    }

    pub fn from_keypair(keypair: Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self { keypair, peer_id }
    }

    /// Read the identity at `path`, creating and persisting a fresh one on
    /// first use
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read(path) {
            Ok(bytes) => Self::decode(&bytes, path),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let identity = Self::generate();
                identity.save(path)?;
                info!("Created new identity {} at {}", identity.peer_id, path.display());
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Self::decode(&std::fs::read(path)?, path)
    }

    fn decode(bytes: &[u8], path: &Path) -> Result<Self> {
        let keypair = Keypair::from_protobuf_encoding(bytes).map_err(|e| {
            BurrowError::ConfigError(format!("{}: not a keypair file: {}", path.display(), e))
        })?;
        Ok(Self::from_keypair(keypair))
    }

    /// Persist the keypair. On Unix the file is created owner-only.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let encoded = self
            .keypair
            .to_protobuf_encoding()
            .map_err(|e| BurrowError::ConfigError(format!("cannot encode keypair: {}", e)))?;

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(path)?.write_all(&encoded)?;
        Ok(())
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Link other peers use to address this identity
    pub fn to_link(&self) -> String {
        format!("{}://{}", brand::LINK_SCHEME, self.peer_id)
    }

    /// Parse a peer ID from a `burrow://` link. A bare peer ID is accepted too.
    pub fn parse_link(link: &str) -> Result<PeerId> {
        let link = link.trim();
        let peer_id_str = match link.split_once("://") {
            Some((scheme, rest)) if scheme == brand::LINK_SCHEME => rest.trim_end_matches('/'),
            Some((scheme, _)) => {
                return Err(BurrowError::InvalidPeerId(format!(
                    "Unsupported link scheme {}://",
                    scheme
                )));
            }
            None => link,
        };

        peer_id_str
            .parse()
            .map_err(|e| BurrowError::InvalidPeerId(format!("Invalid peer ID: {}", e)))
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("peer_id", &self.peer_id.to_string())
            .finish()
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_saved_identity_round_trips() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("identity.key");

        let original = PeerIdentity::generate();
        original.save(&path).unwrap();
        assert_eq!(original.peer_id(), PeerIdentity::load(&path).unwrap().peer_id());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_garbage_key_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("identity.key");
        std::fs::write(&path, b"not a key").unwrap();

        assert!(matches!(
            PeerIdentity::load_or_generate(&path),
            Err(BurrowError::ConfigError(_))
        ));
    }

    #[test]
    fn test_link() {
        let identity = PeerIdentity::generate();
        let link = identity.to_link();

        assert!(link.starts_with("burrow://"));

        let parsed = PeerIdentity::parse_link(&link).unwrap();
        assert_eq!(*identity.peer_id(), parsed);

        let bare = PeerIdentity::parse_link(&identity.peer_id().to_string()).unwrap();
        assert_eq!(parsed, bare);
    }

    #[test]
    fn test_bad_links() {
        let identity = PeerIdentity::generate();
        let foreign = format!("ipfs://{}", identity.peer_id());

        assert!(matches!(
            PeerIdentity::parse_link(&foreign),
            Err(BurrowError::InvalidPeerId(_))
        ));
        assert!(PeerIdentity::parse_link("burrow://not-a-peer").is_err());
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("identity.key");

        let first = PeerIdentity::load_or_generate(&path).unwrap();
        let second = PeerIdentity::load_or_generate(&path).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
    }
}
