use anyhow::Result;
use rand::RngCore;
use std::fmt::{self, Display};
use std::str::FromStr;

pub const PEER_ID_LENGTH: usize = 20;

// 160 bit node identifier handed to us by the overlay (DTUN).
// The rdp layer never interprets it, only compares and hashes it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerId([u8; PEER_ID_LENGTH]);

impl PeerId {
    pub fn new(id: [u8; PEER_ID_LENGTH]) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        let mut id = [0u8; PEER_ID_LENGTH];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        anyhow::ensure!(
            bytes.len() == PEER_ID_LENGTH,
            "Peer id must be {} bytes but is {} bytes.",
            PEER_ID_LENGTH,
            bytes.len()
        );
        let mut id = [0u8; PEER_ID_LENGTH];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }
}

impl FromStr for PeerId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(self.0))
    }
}
