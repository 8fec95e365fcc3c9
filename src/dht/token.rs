use std::net::SocketAddr;

use bytes::Bytes;
use sha1::{Digest, Sha1};

/// Write-token length on the wire.
pub const TOKEN_LEN: usize = 4;

/// Issues and validates the 4-byte write tokens that gate `announce_peer`
/// and `put`.
///
/// A token binds (source address, target hash) under one of two rolling
/// secrets: tokens stay valid across exactly one [`rotate`](Self::rotate)
/// and are rejected after two.
pub struct TokenManager {
    secrets: [[u8; 16]; 2],
}

impl TokenManager {
    pub fn new() -> Self {
        Self {
            secrets: [rand::random(), rand::random()],
        }
    }

    fn token_with(&self, addr: &SocketAddr, target: &[u8; 20], secret: usize) -> [u8; TOKEN_LEN] {
        let mut hasher = Sha1::new();
        hasher.update(addr.ip().to_string().as_bytes());
        hasher.update(self.secrets[secret]);
        hasher.update(target);
        let digest = hasher.finalize();
        let mut token = [0u8; TOKEN_LEN];
        token.copy_from_slice(&digest[..TOKEN_LEN]);
        token
    }

    /// Token for the current secret.
    pub fn generate(&self, addr: &SocketAddr, target: &[u8; 20]) -> Bytes {
        Bytes::copy_from_slice(&self.token_with(addr, target, 0))
    }

    /// Accepts tokens minted under either the current or previous secret.
    pub fn verify(&self, token: &[u8], addr: &SocketAddr, target: &[u8; 20]) -> bool {
        if token.len() != TOKEN_LEN {
            return false;
        }
        token == self.token_with(addr, target, 0) || token == self.token_with(addr, target, 1)
    }

    /// Rotates in a fresh secret, demoting the current one.
    pub fn rotate(&mut self) {
        self.secrets[1] = self.secrets[0];
        self.secrets[0] = rand::random();
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}
