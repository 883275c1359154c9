//! Fixed-geometry bloom filter used for probabilistic partial results.
//!
//! Every lane sizes its filter for the same capacity and false-positive rate,
//! so partials from different workers share one bit layout and readers never
//! need side-channel metadata. Hash keys are fixed as well, which makes the
//! encoded bytes a function of the inserted *set* alone.
//!
//! Wire layout (little-endian):
//!
//! | field            | type      |
//! |------------------|-----------|
//! | format version   | `u8`      |
//! | bit count        | `u64`     |
//! | hash functions   | `u32`     |
//! | sip keys         | `4 x u64` |
//! | bitmap length    | `u32`     |
//! | bitmap           | bytes     |

use bloomfilter::Bloom;
use bytes::{Buf, BufMut, BytesMut};
use dynfilter_common::{DynamicFilterError, Result};
use xxhash_rust::xxh3::xxh3_64;

pub const DEFAULT_EXPECTED_INSERTIONS: usize = 1024 * 1024;
pub const DEFAULT_FPP: f64 = 0.1;

const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 8 + 4 + 4 * 8 + 4;
const SIP_KEYS: [(u64, u64); 2] = [
    (0x736f_6d65_7073_6575, 0x646f_7261_6e64_6f6d),
    (0x6c79_6765_6e65_7261, 0x7465_6462_7974_6573),
];

pub struct BloomFilter {
    inner: Bloom<u64>,
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bits", &self.inner.number_of_bits())
            .field("hash_functions", &self.inner.number_of_hash_functions())
            .finish()
    }
}

impl BloomFilter {
    /// Empty filter with the shared default geometry.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EXPECTED_INSERTIONS, DEFAULT_FPP)
    }

    pub fn with_capacity(expected_insertions: usize, fpp: f64) -> Self {
        let n = expected_insertions.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        // optimal bit count rounded up to whole bytes
        let bits = (-n * fpp.ln() / (ln2 * ln2)).ceil().max(8.0) as u64;
        let bytes = bits.div_ceil(8) as usize;
        let bits = bytes as u64 * 8;
        let k = ((bits as f64 / n) * ln2).round().max(1.0) as u32;
        Self {
            inner: Bloom::from_existing(&vec![0u8; bytes], bits, k, SIP_KEYS),
        }
    }

    pub fn insert(&mut self, value: &str) {
        self.inner.set(&xxh3_64(value.as_bytes()));
    }

    /// `false` is definitive; `true` may be a false positive.
    pub fn might_contain(&self, value: &str) -> bool {
        self.inner.check(&xxh3_64(value.as_bytes()))
    }

    pub fn number_of_bits(&self) -> u64 {
        self.inner.number_of_bits()
    }

    pub fn number_of_hash_functions(&self) -> u32 {
        self.inner.number_of_hash_functions()
    }

    pub fn encode(&self) -> Vec<u8> {
        let bitmap = self.inner.bitmap();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + bitmap.len());
        buf.put_u8(FORMAT_VERSION);
        buf.put_u64_le(self.inner.number_of_bits());
        buf.put_u32_le(self.inner.number_of_hash_functions());
        for (k0, k1) in self.inner.sip_keys() {
            buf.put_u64_le(k0);
            buf.put_u64_le(k1);
        }
        buf.put_u32_le(bitmap.len() as u32);
        buf.put_slice(&bitmap);
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if buf.remaining() < HEADER_LEN {
            return Err(DynamicFilterError::BloomDecode(format!(
                "header truncated: {} bytes",
                data.len()
            )));
        }
        let version = buf.get_u8();
        if version != FORMAT_VERSION {
            return Err(DynamicFilterError::BloomDecode(format!(
                "unknown format version {version}"
            )));
        }
        let bits = buf.get_u64_le();
        let k = buf.get_u32_le();
        let sip_keys = [
            (buf.get_u64_le(), buf.get_u64_le()),
            (buf.get_u64_le(), buf.get_u64_le()),
        ];
        let len = buf.get_u32_le() as usize;
        if buf.remaining() != len {
            return Err(DynamicFilterError::BloomDecode(format!(
                "bitmap length {len} does not match payload {}",
                buf.remaining()
            )));
        }
        if k == 0 || bits == 0 || bits.div_ceil(8) as usize != len {
            return Err(DynamicFilterError::BloomDecode(format!(
                "inconsistent geometry: {bits} bits, {k} hashes, {len} bytes"
            )));
        }
        Ok(Self {
            inner: Bloom::from_existing(buf, bits, k, sip_keys),
        })
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes a lane's string-form values with the shared geometry.
pub fn encode_values<'a, I>(values: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut bloom = BloomFilter::new();
    for v in values {
        bloom.insert(v);
    }
    bloom.encode()
}
