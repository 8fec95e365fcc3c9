use std::net::IpAddr;

use sha1::{Digest, Sha1};

/// Fixed-size bloom filter with the BEP-33 indexing scheme: two bit
/// positions derived from the first four bytes of a SHA-1.
///
/// `N` is the filter size in bytes; scrape replies use 256 (2048 bits),
/// per-item announcer counting uses 128.
#[derive(Clone)]
pub struct BloomFilter<const N: usize> {
    bits: [u8; N],
}

impl<const N: usize> BloomFilter<N> {
    pub fn new() -> Self {
        Self { bits: [0u8; N] }
    }

    fn indices(hash: &[u8; 20]) -> (usize, usize) {
        let m = N * 8;
        let index1 = (hash[0] as usize | (hash[1] as usize) << 8) % m;
        let index2 = (hash[2] as usize | (hash[3] as usize) << 8) % m;
        (index1, index2)
    }

    pub fn set(&mut self, hash: &[u8; 20]) {
        let (i1, i2) = Self::indices(hash);
        self.bits[i1 / 8] |= 1 << (i1 % 8);
        self.bits[i2 / 8] |= 1 << (i2 % 8);
    }

    pub fn contains(&self, hash: &[u8; 20]) -> bool {
        let (i1, i2) = Self::indices(hash);
        self.bits[i1 / 8] & (1 << (i1 % 8)) != 0 && self.bits[i2 / 8] & (1 << (i2 % 8)) != 0
    }

    pub fn set_ip(&mut self, ip: IpAddr) {
        self.set(&hash_address(ip));
    }

    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        self.contains(&hash_address(ip))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// BEP-33 population estimate: `log(c/m) / (2 * log(1 - 1/m))` with
    /// `c` the count of zero bits, capped at `m - 1` set bits.
    pub fn estimated_count(&self) -> usize {
        let m = (N * 8) as f64;
        let zero_bits = self
            .bits
            .iter()
            .map(|b| b.count_zeros() as usize)
            .sum::<usize>() as f64;
        let c = zero_bits.max(1.0).min(m - 1.0);
        ((c / m).ln() / (2.0 * (1.0 - 1.0 / m).ln())) as usize
    }
}

impl<const N: usize> Default for BloomFilter<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-1 of an address's raw octets, the key fed into announcer and scrape
/// filters.
pub fn hash_address(ip: IpAddr) -> [u8; 20] {
    let mut hasher = Sha1::new();
    match ip {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    hasher.finalize().into()
}
