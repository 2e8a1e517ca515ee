use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::latency::histogram::{HistogramSnapshot, LatencyHistogram};
use crate::packet::PacketBuf;
use crate::wire::{self, ParseError};

/// IPv4 option type of the tag (copied flag set, class 0, number 8). The
/// IPv6 form reuses it as a destination option type.
pub const RX_CHECK_OPTION_TYPE: u8 = 0x88;
pub const RX_CHECK_MAGIC: u32 = 0x5a3c_9e01;
pub const TAG_LEN: usize = 26;
/// Tag plus two NOPs, keeping the IPv4 header a multiple of 4 bytes.
pub const TAG_V4_LEN: usize = 28;
/// Destination-options header: next header, length, tag, PadN.
pub const TAG_V6_LEN: usize = 32;
/// Largest reorder window a flow tracker keeps.
pub const MAX_TOLERANCE: u32 = 4096;

pub const FLAG_SERVER_DIR: u32 = 0x1;
pub const FLAG_FIRST_IN_FLOW: u32 = 0x2;

/// `[type][len][8B timestamp][4B magic][4B packet id][4B flow id][4B flags]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxCheckTag {
    pub timestamp: u64,
    pub packet_id: u32,
    pub flow_id: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagError {
    Truncated,
    BadMagic,
}

impl RxCheckTag {
    fn encode_body(&self, out: &mut [u8]) {
        out[0] = RX_CHECK_OPTION_TYPE;
        out[1] = TAG_LEN as u8;
        out[2..10].copy_from_slice(&self.timestamp.to_be_bytes());
        out[10..14].copy_from_slice(&RX_CHECK_MAGIC.to_be_bytes());
        out[14..18].copy_from_slice(&self.packet_id.to_be_bytes());
        out[18..22].copy_from_slice(&self.flow_id.to_be_bytes());
        out[22..26].copy_from_slice(&self.flags.to_be_bytes());
    }

    pub fn encode_v4(&self) -> [u8; TAG_V4_LEN] {
        let mut out = [1u8; TAG_V4_LEN];
        self.encode_body(&mut out[..TAG_LEN]);
        out
    }

    /// Destination-options extension header: next header, length, the tag
    /// as an option (IPv6 lengths exclude type and length), then a PadN
    /// option to an 8-byte multiple.
    pub fn encode_v6(&self, next_header: u8) -> [u8; TAG_V6_LEN] {
        let mut out = [0u8; TAG_V6_LEN];
        out[0] = next_header;
        out[1] = (TAG_V6_LEN / 8 - 1) as u8;
        self.encode_body(&mut out[2..2 + TAG_LEN]);
        out[3] = (TAG_LEN - 2) as u8;
        out[28] = 1;
        out[29] = 2;
        out
    }

    /// Decode the option as returned by `find_tag`.
    pub fn decode(option: &[u8]) -> Result<Self, TagError> {
        if option.len() < TAG_LEN {
            return Err(TagError::Truncated);
        }
        let be32 = |at: usize| u32::from_be_bytes([option[at], option[at + 1], option[at + 2], option[at + 3]]);
        if be32(10) != RX_CHECK_MAGIC {
            return Err(TagError::BadMagic);
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&option[2..10]);
        Ok(Self {
            timestamp: u64::from_be_bytes(ts),
            packet_id: be32(14),
            flow_id: be32(18),
            flags: be32(22),
        })
    }

    pub fn is_server(&self) -> bool {
        self.flags & FLAG_SERVER_DIR != 0
    }

    pub fn is_first_in_flow(&self) -> bool {
        self.flags & FLAG_FIRST_IN_FLOW != 0
    }
}

/// The tag option of `frame`: an IPv4 option, or an option of the IPv6
/// destination-options header.
pub fn find_tag(frame: &[u8]) -> Option<&[u8]> {
    match wire::parse_ipv4(frame) {
        Ok(view) => wire::find_ipv4_option(view.options(frame), RX_CHECK_OPTION_TYPE),
        Err(ParseError::NotIpv4) => {
            let view = wire::parse_ipv6(frame).ok()?;
            let ext = view.dest_options(frame)?;
            wire::find_ipv6_option(&ext[2..], RX_CHECK_OPTION_TYPE)
        }
        Err(_) => None,
    }
}

/// Sender side: selects every Nth packet and assigns per-flow packet ids.
#[derive(Debug)]
pub struct RxCheckSampler {
    interval: u32,
    countdown: u32,
    next_ids: HashMap<u32, u32>,
    tagged: u64,
}

impl RxCheckSampler {
    pub fn new(interval: u32) -> Self {
        Self {
            interval,
            countdown: interval,
            next_ids: HashMap::new(),
            tagged: 0,
        }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// True for every Nth call. Never true when the interval is 0.
    #[inline]
    pub fn should_sample(&mut self) -> bool {
        if self.interval == 0 {
            return false;
        }
        self.countdown -= 1;
        if self.countdown == 0 {
            self.countdown = self.interval;
            true
        } else {
            false
        }
    }

    /// Build the next tag of `flow_id` and insert it into `buf`, as an IPv4
    /// option or an IPv6 destination-options header.
    pub fn tag(&mut self, buf: &mut PacketBuf, flow_id: u32, server: bool, now: u64) -> bool {
        let next = self.next_ids.entry(flow_id).or_insert(1);
        let mut flags = if server { FLAG_SERVER_DIR } else { 0 };
        if *next == 1 {
            flags |= FLAG_FIRST_IN_FLOW;
        }
        let tag = RxCheckTag {
            timestamp: now,
            packet_id: *next,
            flow_id,
            flags,
        };
        let inserted = if wire::is_ipv6(buf.data()) {
            wire::insert_ipv6_dest_options(buf, &tag.encode_v6(0))
        } else {
            wire::insert_ipv4_option(buf, &tag.encode_v4())
        };
        if inserted {
            *next = next.wrapping_add(1);
            self.tagged += 1;
        }
        inserted
    }

    pub fn tagged(&self) -> u64 {
        self.tagged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagVerdict {
    InOrder,
    /// Ids skipped and now waiting for their deadline.
    Gap(u32),
    /// A skipped id arrived before its deadline.
    OutOfOrder,
    /// Ahead of the reorder window. Held until the ids before it arrive.
    Early,
    /// Below the window and no longer awaited.
    Late,
    /// Already accepted.
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RxCheckStats {
    pub total: u64,
    pub in_order: u64,
    pub out_of_order: u64,
    pub early: u64,
    pub late: u64,
    pub duplicate: u64,
    pub timeout: u64,
    pub no_magic: u64,
    pub open_without_fif: u64,
    pub fif_seen_twice: u64,
    pub flows_active: u64,
    pub flows_aged: u64,
    pub delay: HistogramSnapshot,
}

/// Skipped ids `[start, end)`, keyed by `start`.
#[derive(Debug, Clone, Copy)]
struct GapRange {
    end: u32,
    deadline: u64,
    arrived: u32,
}

/// An id ahead of the window and the window position when it arrived.
#[derive(Debug, Clone, Copy)]
struct HeldTag {
    deadline: u64,
    next_at: u32,
}

#[derive(Debug)]
struct FlowTrack {
    next: u32,
    gaps: BTreeMap<u32, GapRange>,
    early: BTreeMap<u32, HeldTag>,
    // Recently accepted ids, for duplicate detection
    seen: BTreeSet<u32>,
    last_seen: u64,
}

impl FlowTrack {
    fn open(id: u32, now: u64) -> Self {
        Self {
            next: id.wrapping_add(1),
            gaps: BTreeMap::new(),
            early: BTreeMap::new(),
            seen: BTreeSet::from([id]),
            last_seen: now,
        }
    }

    fn accept(&mut self, id: u32, window: usize) {
        self.seen.insert(id);
        while self.seen.len() > window {
            self.seen.pop_first();
        }
    }

    /// Mark `next..id` missing until `deadline` and accept `id`.
    fn skip_to(&mut self, id: u32, deadline: u64, window: usize) {
        if id > self.next {
            self.gaps.insert(self.next, GapRange { end: id, deadline, arrived: 0 });
        }
        self.next = id.wrapping_add(1);
        self.accept(id, window);
    }

    /// A skipped id arrived. False if it is not awaited any more.
    fn fill(&mut self, id: u32, window: usize) -> bool {
        let Some((&start, gap)) = self.gaps.range_mut(..=id).next_back() else {
            return false;
        };
        if id >= gap.end {
            return false;
        }
        gap.arrived += 1;
        if gap.arrived == gap.end - start {
            self.gaps.remove(&start);
        }
        self.accept(id, window);
        true
    }

    /// Release held ids the window has reached.
    fn drain_early(&mut self, deadline: u64, window: usize) {
        while let Some((&id, _)) = self.early.first_key_value() {
            if id > self.next {
                break;
            }
            self.early.remove(&id);
            if id == self.next {
                self.skip_to(id, deadline, window);
            } else {
                self.fill(id, window);
            }
        }
    }

    /// Held ids whose deadline passed. If the window has not moved since one
    /// arrived, everything below it is declared missing and the window
    /// jumps to it; otherwise it was a stray id and is dropped.
    fn expire_early(&mut self, now: u64, window: usize) {
        let expired: Vec<u32> = self.early.iter().filter(|(_, held)| held.deadline <= now).map(|(&id, _)| id).collect();
        for id in expired {
            let Some(held) = self.early.remove(&id) else {
                continue;
            };
            if held.next_at != self.next || id < self.next {
                continue;
            }
            self.skip_to(id, held.deadline, window);
            self.drain_early(held.deadline, window);
            let next = self.next;
            for other in self.early.values_mut() {
                other.next_at = next;
            }
        }
    }

    fn unfilled(&self) -> u64 {
        self.gaps.iter().map(|(&start, gap)| u64::from(gap.end - start - gap.arrived)).sum()
    }

    fn expire_gaps(&mut self, now: u64) -> u64 {
        let mut lost = 0;
        self.gaps.retain(|&start, gap| {
            if gap.deadline > now {
                true
            } else {
                lost += u64::from(gap.end - start - gap.arrived);
                false
            }
        });
        lost
    }
}

/// Receive side: per-flow ordering with a reorder window. Missing ids are
/// declared lost only by `sweep`, never while a packet is handled.
#[derive(Debug)]
pub struct RxCheckManager {
    flows: HashMap<(u32, bool), FlowTrack>,
    timeout_ns: u64,
    tolerance: u32,
    stats: RxCheckStats,
    delay: LatencyHistogram,
}

impl RxCheckManager {
    pub fn new(timeout_ns: u64, tolerance: u32) -> Self {
        Self {
            flows: HashMap::new(),
            timeout_ns,
            tolerance: tolerance.clamp(1, MAX_TOLERANCE),
            stats: RxCheckStats::default(),
            delay: LatencyHistogram::new(),
        }
    }

    fn seen_window(&self) -> usize {
        self.tolerance as usize * 2
    }

    /// Handle a received frame. Returns `None` when it carries no valid tag.
    pub fn on_frame(&mut self, frame: &[u8], now: u64) -> Option<TagVerdict> {
        match RxCheckTag::decode(find_tag(frame)?) {
            Ok(tag) => Some(self.on_tag(&tag, now)),
            Err(_) => {
                self.stats.no_magic += 1;
                None
            }
        }
    }

    pub fn on_tag(&mut self, tag: &RxCheckTag, now: u64) -> TagVerdict {
        self.stats.total += 1;
        self.delay.add(now.saturating_sub(tag.timestamp));

        let window = self.seen_window();
        let tolerance = self.tolerance;
        let deadline = now.saturating_add(self.timeout_ns);
        let key = (tag.flow_id, tag.is_server());
        let track = match self.flows.get_mut(&key) {
            Some(track) => {
                if tag.is_first_in_flow() {
                    self.stats.fif_seen_twice += 1;
                }
                track
            }
            None => {
                if !tag.is_first_in_flow() {
                    self.stats.open_without_fif += 1;
                }
                self.flows.insert(key, FlowTrack::open(tag.packet_id, now));
                self.stats.in_order += 1;
                return TagVerdict::InOrder;
            }
        };
        track.last_seen = now;

        let id = tag.packet_id;
        if track.seen.contains(&id) || track.early.contains_key(&id) {
            self.stats.duplicate += 1;
            return TagVerdict::Duplicate;
        }

        if id > track.next && id - track.next > tolerance && track.early.len() >= tolerance as usize {
            // Too many ids held: the stream moved on. Jump to the oldest one;
            // the ids below it wait for their deadline like any gap.
            if let Some((held, _)) = track.early.pop_first() {
                track.skip_to(held, deadline, window);
                track.drain_early(deadline, window);
            }
        }

        if id < track.next {
            return if track.fill(id, window) {
                self.stats.out_of_order += 1;
                TagVerdict::OutOfOrder
            } else {
                self.stats.late += 1;
                TagVerdict::Late
            };
        }

        let missing = id - track.next;
        if missing > tolerance {
            track.early.insert(id, HeldTag { deadline, next_at: track.next });
            self.stats.early += 1;
            self.stats.out_of_order += 1;
            return TagVerdict::Early;
        }
        track.skip_to(id, deadline, window);
        track.drain_early(deadline, window);
        if missing == 0 {
            self.stats.in_order += 1;
            TagVerdict::InOrder
        } else {
            TagVerdict::Gap(missing)
        }
    }

    /// Expire ids past their deadline and drop flows idle longer than the
    /// timeout. An idle flow's known gaps count as timeouts; ids it held
    /// ahead of the window are discarded.
    pub fn sweep(&mut self, now: u64) {
        let idle_limit = self.timeout_ns;
        let window = self.seen_window();
        let mut timed_out = 0u64;
        let mut aged = 0u64;
        self.flows.retain(|_, track| {
            if now.saturating_sub(track.last_seen) > idle_limit {
                timed_out += track.unfilled();
                aged += 1;
                return false;
            }
            track.expire_early(now, window);
            timed_out += track.expire_gaps(now);
            true
        });

        self.stats.timeout += timed_out;
        self.stats.flows_aged += aged;
    }

    pub fn stats(&self) -> RxCheckStats {
        RxCheckStats {
            flows_active: self.flows.len() as u64,
            delay: self.delay.snapshot(),
            ..self.stats.clone()
        }
    }

    pub fn reset_counters(&mut self) {
        self.stats = RxCheckStats::default();
        self.delay.reset();
    }
}
