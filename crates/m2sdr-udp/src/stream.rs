//! Datagram sample rings.
//!
//! Both directions are host-side rings of `num_slots × buf_size` bytes with
//! the same cursor discipline as the DMA rings; the "hardware" side of each
//! counter is advanced by the socket pump instead of an interrupt handler.
//!
//! The pump is caller-driven: `pump_rx`/`pump_tx` move as much as the
//! socket allows and yield back on `EAGAIN` without advancing mid-slot
//! state. A slot becomes available exactly when its byte count reaches
//! `buf_size`; a slot is emitted as exactly one datagram.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use tracing::{debug, trace};

use m2sdr_dma::{AccessMode, BufferPool, DirectionState, DmaError, DmaResult, UserRing};
use m2sdr_proto::Direction;

/// Sample transport over one bound UDP socket with a fixed peer.
pub struct UdpStreamer {
    socket: UdpSocket,
    peer: SocketAddr,
    rx_pool: Arc<BufferPool>,
    rx_state: Arc<DirectionState>,
    tx_pool: Arc<BufferPool>,
    tx_state: Arc<DirectionState>,
    /// Fill level of the RX slot currently being assembled.
    rx_assembling_bytes: usize,
    buf_size: usize,
}

impl UdpStreamer {
    /// Wraps `socket` (set non-blocking here) with rings of
    /// `num_slots × buf_size` bytes per direction.
    pub fn new(
        socket: UdpSocket,
        peer: SocketAddr,
        num_slots: usize,
        buf_size: usize,
    ) -> DmaResult<Self> {
        socket.set_nonblocking(true)?;
        let rx_pool = Arc::new(BufferPool::new(0, num_slots, buf_size)?);
        let tx_pool = Arc::new(BufferPool::new(0, num_slots, buf_size)?);
        debug!(%peer, num_slots, buf_size, "udp streamer ready");
        Ok(Self {
            socket,
            peer,
            rx_pool,
            rx_state: Arc::new(DirectionState::new(Direction::Rx, num_slots)),
            tx_pool,
            tx_state: Arc::new(DirectionState::new(Direction::Tx, num_slots)),
            rx_assembling_bytes: 0,
            buf_size,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn rx_state(&self) -> &Arc<DirectionState> {
        &self.rx_state
    }

    pub fn tx_state(&self) -> &Arc<DirectionState> {
        &self.tx_state
    }

    /// User-side cursor over the RX ring.
    pub fn rx_ring(&self, mode: AccessMode) -> DmaResult<UserRing> {
        UserRing::new(Arc::clone(&self.rx_pool), Arc::clone(&self.rx_state), mode)
    }

    /// User-side cursor over the TX ring.
    pub fn tx_ring(&self, mode: AccessMode) -> DmaResult<UserRing> {
        UserRing::new(Arc::clone(&self.tx_pool), Arc::clone(&self.tx_state), mode)
    }

    /// Drains the socket into the RX ring. Returns the number of slots
    /// completed by this call; `EAGAIN` yields back without touching the
    /// in-flight accumulator.
    pub fn pump_rx(&mut self) -> DmaResult<usize> {
        let num_slots = self.rx_pool.len() as u64;
        let mut completed = 0;
        loop {
            let slot = (self.rx_state.hw() % num_slots) as usize;
            // SAFETY: the slot at hw mod N is the transport's working slot;
            // the user ring only reads at sw mod N, and overflow recovery
            // keeps the cursors apart.
            let dst = unsafe { self.rx_pool.slot_mut(slot) };
            match self.socket.recv_from(&mut dst[self.rx_assembling_bytes..]) {
                Ok((n, src)) => {
                    if src != self.peer {
                        trace!(%src, "dropping datagram from foreign source");
                        continue;
                    }
                    self.rx_assembling_bytes += n;
                    if self.rx_assembling_bytes >= self.buf_size {
                        self.rx_assembling_bytes = 0;
                        self.rx_state.add_hw(1);
                        completed += 1;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(completed);
                }
                Err(e) => return Err(DmaError::Io(e)),
            }
        }
    }

    /// Emits submitted TX slots, one datagram per slot. Returns the number
    /// of slots sent; `EAGAIN` leaves the unsent remainder for the next
    /// call.
    pub fn pump_tx(&mut self) -> DmaResult<usize> {
        let num_slots = self.tx_pool.len() as u64;
        let mut sent = 0;
        while self.tx_state.tx_level() > 0 {
            let slot = (self.tx_state.hw() % num_slots) as usize;
            // SAFETY: slots in [hw, sw) were published by submit(); the
            // user ring will not touch them again until hw passes them.
            let data = unsafe { self.tx_pool.slot(slot) };
            match self.socket.send_to(data, self.peer) {
                Ok(_) => {
                    self.tx_state.add_hw(1);
                    sent += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(DmaError::Io(e)),
            }
        }
        Ok(sent)
    }
}
