/// Upper 24 bits of the probe magic. The low byte carries the generator id.
pub const LATENCY_MAGIC: u32 = 0x1234_5600;
pub const MAGIC_MASK: u32 = 0xffff_ff00;
/// First sequence number a port sends and expects.
pub const INITIAL_SEQ: u32 = 0x1234_5678;
pub const HEADER_LEN: usize = 16;

/// `[8B timestamp][4B magic|generator][4B sequence]`, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyHeader {
    pub timestamp: u64,
    pub generator: u8,
    pub seq: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    Truncated,
    BadMagic,
}

impl LatencyHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[8..12].copy_from_slice(&(LATENCY_MAGIC | u32::from(self.generator)).to_be_bytes());
        out[12..16].copy_from_slice(&self.seq.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < HEADER_LEN {
            return Err(HeaderError::Truncated);
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[0..8]);
        let magic = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if magic & MAGIC_MASK != LATENCY_MAGIC {
            return Err(HeaderError::BadMagic);
        }
        Ok(Self {
            timestamp: u64::from_be_bytes(ts),
            generator: (magic & 0xff) as u8,
            seq: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        })
    }
}
