use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use super::{Burst, NicPort, PortCounters, PortIo, PortStats, SteerDecision, SteeringState};
use crate::error::EngineError;
use crate::mbuf_pool::MbufPool;
use crate::packet::{SideBand, FRAME_CAPACITY};

/// Port backed by non-blocking loopback UDP sockets, one per RX queue. Each
/// frame travels as one datagram; steering runs on the sending side against
/// the receiver's rules.
pub struct UdpPort {
    id: u16,
    rx_sockets: Vec<UdpSocket>,
    rx_addrs: Vec<SocketAddr>,
    tx_queues: u16,
    rx_claims: Vec<AtomicBool>,
    tx_claims: Vec<AtomicBool>,
    link: AtomicBool,
    steering: SteeringState,
    counters: PortCounters,
    pool: MbufPool,
    this: Weak<UdpPort>,
    peer: OnceLock<Weak<UdpPort>>,
}

fn setup_socket(port: u16, bind: bool) -> Result<UdpSocket, EngineError> {
    let fail = |e: std::io::Error| EngineError::PortSetup { port, reason: e.to_string() };
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(fail)?;
    if let Err(e) = socket.set_recv_buffer_size(1024 * 1024) {
        warn!("Failed to set receive buffer for port {}: {}", port, e);
    }
    socket.set_nonblocking(true).map_err(fail)?;
    if bind {
        let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
        socket.bind(&addr.into()).map_err(fail)?;
    }
    Ok(socket.into())
}

impl UdpPort {
    fn new(id: u16, rx_queues: u16, tx_queues: u16, pool: MbufPool) -> Result<Arc<Self>, EngineError> {
        let mut rx_sockets = Vec::with_capacity(usize::from(rx_queues));
        let mut rx_addrs = Vec::with_capacity(usize::from(rx_queues));
        for _ in 0..rx_queues {
            let socket = setup_socket(id, true)?;
            let addr = socket
                .local_addr()
                .map_err(|e| EngineError::PortSetup { port: id, reason: e.to_string() })?;
            rx_sockets.push(socket);
            rx_addrs.push(addr);
        }
        debug!("UDP port {} listening on {:?}", id, rx_addrs);
        Ok(Arc::new_cyclic(|this| Self {
            id,
            rx_sockets,
            rx_addrs,
            tx_queues,
            rx_claims: (0..rx_queues).map(|_| AtomicBool::new(false)).collect(),
            tx_claims: (0..tx_queues).map(|_| AtomicBool::new(false)).collect(),
            link: AtomicBool::new(true),
            steering: SteeringState::default(),
            counters: PortCounters::default(),
            pool,
            this: this.clone(),
            peer: OnceLock::new(),
        }))
    }

    pub fn pair(
        a: u16,
        b: u16,
        rx_queues: u16,
        tx_queues: u16,
        pool: &MbufPool,
    ) -> Result<(Arc<UdpPort>, Arc<UdpPort>), EngineError> {
        let pa = UdpPort::new(a, rx_queues, tx_queues, pool.clone())?;
        let pb = UdpPort::new(b, rx_queues, tx_queues, pool.clone())?;
        let _ = pa.peer.set(Arc::downgrade(&pb));
        let _ = pb.peer.set(Arc::downgrade(&pa));
        Ok((pa, pb))
    }

    pub fn pairs(count: u16, rx_queues: u16, tx_queues: u16, pool: &MbufPool) -> Result<Vec<Arc<dyn NicPort>>, EngineError> {
        let mut ports: Vec<Arc<dyn NicPort>> = Vec::with_capacity(usize::from(count));
        for first in (0..count).step_by(2) {
            let (a, b) = UdpPort::pair(first, first + 1, rx_queues, tx_queues, pool)?;
            ports.push(a);
            ports.push(b);
        }
        Ok(ports)
    }

    pub fn set_link(&self, up: bool) {
        self.link.store(up, Ordering::Release);
    }

    fn claim(claims: &[AtomicBool], queue: u16) -> bool {
        claims
            .get(usize::from(queue))
            .is_some_and(|c| c.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok())
    }
}

impl NicPort for UdpPort {
    fn id(&self) -> u16 {
        self.id
    }

    fn driver_name(&self) -> &str {
        "udp"
    }

    fn rx_queue_count(&self) -> u16 {
        self.rx_sockets.len() as u16
    }

    fn tx_queue_count(&self) -> u16 {
        self.tx_queues
    }

    fn link_up(&self) -> bool {
        self.link.load(Ordering::Acquire)
    }

    fn open_queues(&self, rx: Option<u16>, tx: Option<u16>) -> Result<Box<dyn PortIo>, EngineError> {
        let rx_socket = match rx {
            Some(q) => {
                let socket = self
                    .rx_sockets
                    .get(usize::from(q))
                    .ok_or(EngineError::QueueBusy { port: self.id, queue: q })?
                    .try_clone()
                    .map_err(|e| EngineError::PortSetup { port: self.id, reason: e.to_string() })?;
                if !Self::claim(&self.rx_claims, q) {
                    return Err(EngineError::QueueBusy { port: self.id, queue: q });
                }
                Some(socket)
            }
            None => None,
        };
        let release_rx = || {
            if let Some(q) = rx {
                self.rx_claims[usize::from(q)].store(false, Ordering::Release);
            }
        };
        let tx_socket = match tx {
            Some(q) => {
                if !Self::claim(&self.tx_claims, q) {
                    release_rx();
                    return Err(EngineError::QueueBusy { port: self.id, queue: q });
                }
                match setup_socket(self.id, false) {
                    Ok(socket) => Some(socket),
                    Err(e) => {
                        release_rx();
                        self.tx_claims[usize::from(q)].store(false, Ordering::Release);
                        return Err(e);
                    }
                }
            }
            None => None,
        };
        Ok(Box::new(UdpQueue {
            port: self.this.clone(),
            rx,
            tx,
            rx_socket,
            tx_socket,
        }))
    }

    fn steering(&self) -> &SteeringState {
        &self.steering
    }

    fn counters(&self) -> &PortCounters {
        &self.counters
    }
}

pub struct UdpQueue {
    port: Weak<UdpPort>,
    rx: Option<u16>,
    tx: Option<u16>,
    rx_socket: Option<UdpSocket>,
    tx_socket: Option<UdpSocket>,
}

impl PortIo for UdpQueue {
    fn port_id(&self) -> u16 {
        self.port.upgrade().map_or(u16::MAX, |p| p.id)
    }

    fn tx_queue(&self) -> Option<u16> {
        self.tx
    }

    fn rx_queue(&self) -> Option<u16> {
        self.rx
    }

    fn send_burst(&mut self, pkts: &mut Burst) -> usize {
        let (Some(socket), Some(port)) = (&self.tx_socket, self.port.upgrade()) else {
            return 0;
        };
        let Some(peer) = port.peer.get().and_then(Weak::upgrade) else {
            return 0;
        };
        if !port.link_up() || !peer.link_up() {
            port.counters.oerrors.fetch_add(pkts.len() as u64, Ordering::Relaxed);
            return 0;
        }

        let rx_count = peer.rx_queue_count();
        let mut sent = 0;
        for pkt in pkts.iter() {
            let target = match peer.steering.decide(pkt.data(), rx_count) {
                SteerDecision::DropError => {
                    peer.counters.ierrors.fetch_add(1, Ordering::Relaxed);
                    None
                }
                SteerDecision::DropQueue => {
                    peer.counters.hw_drops.fetch_add(1, Ordering::Relaxed);
                    None
                }
                SteerDecision::Queue { queue, .. } => peer.rx_addrs.get(usize::from(queue)).copied(),
            };
            if let Some(addr) = target {
                match socket.send_to(pkt.data(), addr) {
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!("UDP port {} send failed: {}", port.id, e);
                        break;
                    }
                }
            }
            port.counters.record_tx(pkt.len());
            sent += 1;
        }
        // Accepted buffers are released; the rest stay with the caller
        pkts.drain(..sent);
        if !pkts.is_empty() {
            port.counters.oerrors.fetch_add(pkts.len() as u64, Ordering::Relaxed);
        }
        sent
    }

    fn receive_burst(&mut self, max: usize, out: &mut Burst) -> usize {
        let (Some(socket), Some(port), Some(q)) = (&self.rx_socket, self.port.upgrade(), self.rx) else {
            return 0;
        };
        let mut scratch = [0u8; FRAME_CAPACITY];
        let mut taken = 0;
        while taken < max {
            let Some(mut buf) = port.pool.alloc() else {
                break;
            };
            match socket.recv(&mut scratch) {
                Ok(len) => {
                    if !buf.set_data(&scratch[..len]) {
                        port.counters.ierrors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    buf.port = port.id;
                    buf.queue = q;
                    buf.side_band = SideBand::None;
                    port.counters.record_rx(len);
                    out.push(buf);
                    taken += 1;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("UDP port {} receive failed: {}", port.id, e);
                    break;
                }
            }
        }
        taken
    }

    fn link_up(&self) -> bool {
        self.port.upgrade().is_some_and(|p| p.link_up())
    }

    fn stats(&self) -> PortStats {
        self.port.upgrade().map(|p| p.counters.snapshot()).unwrap_or_default()
    }
}

impl Drop for UdpQueue {
    fn drop(&mut self) {
        if let Some(port) = self.port.upgrade() {
            if let Some(q) = self.rx {
                port.rx_claims[usize::from(q)].store(false, Ordering::Release);
            }
            if let Some(q) = self.tx {
                port.tx_claims[usize::from(q)].store(false, Ordering::Release);
            }
        }
    }
}
