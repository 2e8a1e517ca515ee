use std::fmt;
use std::sync::Arc;

use arrayvec::ArrayVec;

use crate::mbuf_pool::PoolShared;

/// Largest frame a buffer can hold.
pub const FRAME_CAPACITY: usize = 2048;

pub type Frame = ArrayVec<u8, FRAME_CAPACITY>;

/// Traffic direction served by one side of a data-plane core. Client traffic
/// leaves the even port of a pair, server traffic the odd one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Client = 0,
    Server = 1,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Client, Direction::Server];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn of_port(port: u16) -> Self {
        if port & 1 == 0 { Direction::Client } else { Direction::Server }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Client => Direction::Server,
            Direction::Server => Direction::Client,
        }
    }
}

/// Hardware side-band data attached on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SideBand {
    #[default]
    None,
    RssHash(u32),
    Color(u32),
}

/// One packet buffer. Exactly one owner at any time; moving it into a ring or
/// a send burst transfers ownership. Dropping it returns the frame to its pool.
pub struct PacketBuf {
    frame: Option<Box<Frame>>,
    pool: Option<Arc<PoolShared>>,
    pub port: u16,
    pub queue: u16,
    pub side_band: SideBand,
}

impl PacketBuf {
    pub(crate) fn from_pool(frame: Box<Frame>, pool: Arc<PoolShared>) -> Self {
        Self {
            frame: Some(frame),
            pool: Some(pool),
            port: 0,
            queue: 0,
            side_band: SideBand::None,
        }
    }

    /// Heap buffer outside any pool. Returns `None` if `data` does not fit.
    pub fn unpooled(data: &[u8]) -> Option<Self> {
        let mut frame = Box::new(Frame::new());
        frame.try_extend_from_slice(data).ok()?;
        Some(Self {
            frame: Some(frame),
            pool: None,
            port: 0,
            queue: 0,
            side_band: SideBand::None,
        })
    }

    pub fn data(&self) -> &[u8] {
        match &self.frame {
            Some(frame) => frame.as_slice(),
            None => &[],
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.frame {
            Some(frame) => frame.as_mut_slice(),
            None => &mut [],
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the contents. Fails without modifying the buffer if `data`
    /// exceeds the frame capacity.
    pub fn set_data(&mut self, data: &[u8]) -> bool {
        match &mut self.frame {
            Some(frame) if data.len() <= FRAME_CAPACITY => {
                frame.clear();
                frame.try_extend_from_slice(data).is_ok()
            }
            _ => false,
        }
    }

    pub fn truncate(&mut self, len: usize) {
        if let Some(frame) = &mut self.frame {
            frame.truncate(len);
        }
    }

    /// Insert `bytes` at `offset`, shifting the tail. Used to grow the IPv4
    /// header when an option is added.
    pub fn insert_at(&mut self, offset: usize, bytes: &[u8]) -> bool {
        let Some(frame) = &mut self.frame else {
            return false;
        };
        if offset > frame.len() || frame.len() + bytes.len() > FRAME_CAPACITY {
            return false;
        }
        let tail: Frame = frame.drain(offset..).collect();
        frame.try_extend_from_slice(bytes).is_ok() && frame.try_extend_from_slice(&tail).is_ok()
    }
}

impl Drop for PacketBuf {
    fn drop(&mut self) {
        if let (Some(mut frame), Some(pool)) = (self.frame.take(), self.pool.take()) {
            frame.clear();
            pool.release(frame);
        }
    }
}

impl fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuf")
            .field("len", &self.len())
            .field("port", &self.port)
            .field("queue", &self.queue)
            .field("side_band", &self.side_band)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}
