use std::collections::HashMap;
use std::net::Ipv4Addr;

/// IPv4 option announcing a flow for translation learning:
/// `[type][len=12][magic u16][flow id u64]`.
pub const NAT_OPTION_TYPE: u8 = 0x10;
pub const NAT_OPTION_LEN: usize = 12;
pub const NAT_OPTION_MAGIC: u16 = 0xee11;

pub fn encode_learn_option(flow: u64) -> [u8; NAT_OPTION_LEN] {
    let mut out = [0u8; NAT_OPTION_LEN];
    out[0] = NAT_OPTION_TYPE;
    out[1] = NAT_OPTION_LEN as u8;
    out[2..4].copy_from_slice(&NAT_OPTION_MAGIC.to_be_bytes());
    out[4..12].copy_from_slice(&flow.to_be_bytes());
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnOptionError {
    Truncated,
    BadMagic,
}

/// Flow id carried by a learn option, as returned by `find_ipv4_option`.
pub fn decode_learn_option(option: &[u8]) -> Result<u64, LearnOptionError> {
    if option.len() < NAT_OPTION_LEN {
        return Err(LearnOptionError::Truncated);
    }
    if u16::from_be_bytes([option[2], option[3]]) != NAT_OPTION_MAGIC {
        return Err(LearnOptionError::BadMagic);
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&option[4..12]);
    Ok(u64::from_be_bytes(id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKey {
    /// The probe flow of a latency port.
    Latency(u16),
    /// A data-plane flow announced with the learn option or a SYN.
    Traffic(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatEntry {
    /// Port the translation was observed on.
    pub port: u16,
    pub external: Ipv4Addr,
    pub external_port: u16,
    pub learned_at: u64,
    pub last_seen: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnOutcome {
    Learned,
    Refreshed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NatStats {
    pub learned: u64,
    pub refreshed: u64,
    pub aged: u64,
    pub removed: u64,
    pub active: u64,
}

/// Learned translations with timeout aging. Owned by the latency core.
#[derive(Debug)]
pub struct NatTable {
    entries: HashMap<FlowKey, NatEntry>,
    timeout_ns: u64,
    stats: NatStats,
}

impl NatTable {
    pub fn new(timeout_ns: u64) -> Self {
        Self {
            entries: HashMap::new(),
            timeout_ns,
            stats: NatStats::default(),
        }
    }

    /// Create the entry on first sight, refresh it afterwards. A refresh also
    /// picks up a changed translation.
    pub fn learn(&mut self, key: FlowKey, port: u16, external: Ipv4Addr, external_port: u16, now: u64) -> LearnOutcome {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.external = external;
                entry.external_port = external_port;
                entry.last_seen = now;
                self.stats.refreshed += 1;
                LearnOutcome::Refreshed
            }
            None => {
                self.entries.insert(
                    key,
                    NatEntry {
                        port,
                        external,
                        external_port,
                        learned_at: now,
                        last_seen: now,
                    },
                );
                self.stats.learned += 1;
                LearnOutcome::Learned
            }
        }
    }

    /// Mark a matching packet. Returns false if the key is not learned.
    pub fn touch(&mut self, key: FlowKey, now: u64) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: FlowKey) -> Option<&NatEntry> {
        self.entries.get(&key)
    }

    /// Explicit removal. Removing an absent key changes nothing.
    pub fn remove(&mut self, key: FlowKey) -> Option<NatEntry> {
        let entry = self.entries.remove(&key)?;
        self.stats.removed += 1;
        Some(entry)
    }

    /// Sync-tick sweep: drop every entry idle longer than the timeout.
    pub fn age(&mut self, now: u64) -> Vec<(FlowKey, NatEntry)> {
        let timeout = self.timeout_ns;
        let expired: Vec<FlowKey> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.last_seen) > timeout)
            .map(|(k, _)| *k)
            .collect();

        let mut aged = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(entry) = self.entries.remove(&key) {
                self.stats.aged += 1;
                aged.push((key, entry));
            }
        }
        aged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> NatStats {
        NatStats { active: self.entries.len() as u64, ..self.stats }
    }

    pub fn reset_counters(&mut self) {
        self.stats = NatStats::default();
    }
}
