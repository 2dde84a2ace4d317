//! Unique tag generation for staging pushes
//!
//! Tags look like `<unix nanoseconds>-<13 base32 chars>`. The timestamp gives
//! rough ordering, the random suffix keeps concurrent pushes from many
//! clients apart even when clocks are coarse. No registry of issued tags is
//! kept: collisions are statistically unlikely, not impossible.

use crate::{LightsailctlError, Result};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;

/// Unpadded base32 alphabet: digits then lowercase a-v, 5 bits per symbol
const ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Random bytes per tag; 8 bytes encode to exactly 13 symbols
const SUFFIX_BYTES: usize = 8;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Source of random bytes
pub trait EntropySource: Send + Sync {
    fn fill(&self, buf: &mut [u8]) -> Result<()>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Operating system CSPRNG
#[derive(Debug, Clone, Copy, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, buf: &mut [u8]) -> Result<()> {
        OsRng.try_fill_bytes(buf)?;
        Ok(())
    }
}

/// Generates push tags from an injected clock and entropy source
pub struct UniqueTagGenerator {
    clock: Box<dyn Clock>,
    entropy: Box<dyn EntropySource>,
}

impl UniqueTagGenerator {
    pub fn new(clock: impl Clock + 'static, entropy: impl EntropySource + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            entropy: Box::new(entropy),
        }
    }

    /// Generate a fresh tag
    pub fn generate(&self) -> Result<String> {
        let now = self.clock.now();
        let nanos = now.timestamp_nanos_opt().ok_or_else(|| {
            LightsailctlError::Clock(format!("{} is out of nanosecond timestamp range", now))
        })?;

        let mut suffix = [0u8; SUFFIX_BYTES];
        self.entropy.fill(&mut suffix)?;

        Ok(format!("{}-{}", nanos, encode_base32(&suffix)))
    }
}

impl Default for UniqueTagGenerator {
    fn default() -> Self {
        Self::new(SystemClock, OsEntropy)
    }
}

/// Encode bytes with the tag alphabet, most significant bits first, no padding
fn encode_base32(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8 + 4) / 5);
    let mut buffer: u32 = 0;
    let mut bits = 0;

    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
        buffer &= (1 << bits) - 1;
    }

    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }

    out
}
