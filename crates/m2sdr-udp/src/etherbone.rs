//! Etherbone register access over UDP.
//!
//! One request per datagram, big-endian on the wire, single-record packets
//! with 32-bit addresses and data. Writes are posted (no acknowledgement,
//! as the bus bridge does them); reads round-trip and retry on timeout.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use tracing::{debug, trace};

use m2sdr_dma::{DmaError, DmaResult, RegisterPort};
use m2sdr_proto::csr;

/// Wire magic of every Etherbone packet.
pub const MAGIC: u16 = 0x4e6f;
/// Protocol version carried in the header.
pub const VERSION: u8 = 1;

/// Header flag bits (low nibble of byte 2).
const FLAG_PF: u8 = 0x01; // probe request
const FLAG_PR: u8 = 0x02; // probe response

/// 32-bit address and port sizes, packed into byte 3.
const SIZES: u8 = 0x44;

const HEADER_LEN: usize = 8;
const RECORD_HEADER_LEN: usize = 4;

/// A decoded single-record request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Packet {
    Probe,
    ProbeResponse,
    /// One posted write: `(addr, value)`.
    Write { addr: u32, value: u32 },
    /// One read of `addr`; the response targets `ret_addr`.
    Read { addr: u32 },
    /// Read response carrying the value.
    ReadResponse { value: u32 },
}

fn header(flags: u8) -> [u8; HEADER_LEN] {
    let magic = MAGIC.to_be_bytes();
    [magic[0], magic[1], VERSION << 4 | flags, SIZES, 0, 0, 0, 0]
}

pub(crate) fn encode(packet: &Packet) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + RECORD_HEADER_LEN + 8);
    match packet {
        Packet::Probe => out.extend_from_slice(&header(FLAG_PF)),
        Packet::ProbeResponse => out.extend_from_slice(&header(FLAG_PR)),
        Packet::Write { addr, value } => {
            out.extend_from_slice(&header(0));
            // flags, byte-enable, wcount, rcount
            out.extend_from_slice(&[0x00, 0x0f, 1, 0]);
            out.extend_from_slice(&addr.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
        }
        Packet::Read { addr } => {
            out.extend_from_slice(&header(0));
            out.extend_from_slice(&[0x00, 0x0f, 0, 1]);
            // Return address: unused by this client, zero by convention.
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&addr.to_be_bytes());
        }
        Packet::ReadResponse { value } => {
            out.extend_from_slice(&header(0));
            out.extend_from_slice(&[0x00, 0x0f, 1, 0]);
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
        }
    }
    out
}

fn word(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn decode(buf: &[u8]) -> Option<Packet> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    if u16::from_be_bytes([buf[0], buf[1]]) != MAGIC || buf[2] >> 4 != VERSION {
        return None;
    }
    let flags = buf[2] & 0x0f;
    if flags & FLAG_PF != 0 {
        return Some(Packet::Probe);
    }
    if flags & FLAG_PR != 0 {
        return Some(Packet::ProbeResponse);
    }

    let record = &buf[HEADER_LEN..];
    if record.len() < RECORD_HEADER_LEN {
        return None;
    }
    let wcount = record[2];
    let rcount = record[3];
    match (wcount, rcount) {
        (1, 0) => {
            let base = word(record, RECORD_HEADER_LEN)?;
            let value = word(record, RECORD_HEADER_LEN + 4)?;
            // A write to return-address zero is a read response; anything
            // else is a posted register write.
            if base == 0 {
                Some(Packet::ReadResponse { value })
            } else {
                Some(Packet::Write { addr: base, value })
            }
        }
        (0, 1) => {
            let _ret = word(record, RECORD_HEADER_LEN)?;
            let addr = word(record, RECORD_HEADER_LEN + 4)?;
            Some(Packet::Read { addr })
        }
        _ => None,
    }
}

/// Register port over a bound UDP socket with a fixed peer.
pub struct EtherbonePort {
    socket: UdpSocket,
    peer: SocketAddr,
    retries: u32,
}

/// Per-attempt response timeout.
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(200);
/// Read attempts before the access is declared failed.
const DEFAULT_RETRIES: u32 = 3;

impl EtherbonePort {
    /// Binds a socket and probes the peer once to confirm something is
    /// listening.
    pub fn connect(peer: SocketAddr) -> DmaResult<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_read_timeout(Some(RESPONSE_TIMEOUT))?;
        let port = Self {
            socket,
            peer,
            retries: DEFAULT_RETRIES,
        };
        port.probe()?;
        debug!(%peer, "etherbone peer probed");
        Ok(port)
    }

    fn probe(&self) -> DmaResult<()> {
        self.roundtrip(&Packet::Probe, |p| matches!(p, Packet::ProbeResponse).then_some(()))
    }

    /// Sends `request` and waits for a response `accept` recognizes,
    /// retrying the whole exchange on timeout. Datagrams from other sources
    /// and unrelated packets are dropped.
    fn roundtrip<T>(
        &self,
        request: &Packet,
        accept: impl Fn(Packet) -> Option<T>,
    ) -> DmaResult<T> {
        let wire = encode(request);
        let mut last_err: Option<std::io::Error> = None;
        for attempt in 0..self.retries {
            self.socket.send_to(&wire, self.peer)?;
            let mut buf = [0u8; 64];
            loop {
                match self.socket.recv_from(&mut buf) {
                    Ok((n, src)) => {
                        if src != self.peer {
                            continue;
                        }
                        if let Some(packet) = decode(&buf[..n]) {
                            if let Some(value) = accept(packet) {
                                return Ok(value);
                            }
                        }
                        // Stale or foreign packet; keep listening until the
                        // attempt times out.
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        trace!(attempt, peer = %self.peer, "etherbone response timeout");
                        last_err = Some(e);
                        break;
                    }
                    Err(e) => return Err(DmaError::Io(e)),
                }
            }
        }
        Err(DmaError::Io(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "etherbone peer silent")
        })))
    }
}

impl RegisterPort for EtherbonePort {
    fn read_reg(&self, addr: u32) -> DmaResult<u32> {
        if !csr::addr_in_region(addr) {
            return Err(DmaError::InvalidAddress { addr });
        }
        self.roundtrip(&Packet::Read { addr }, |p| match p {
            Packet::ReadResponse { value } => Some(value),
            _ => None,
        })
    }

    fn write_reg(&self, addr: u32, value: u32) -> DmaResult<()> {
        if !csr::addr_in_region(addr) {
            return Err(DmaError::InvalidAddress { addr });
        }
        // Posted: the bridge applies it without acknowledgement.
        let wire = encode(&Packet::Write { addr, value });
        self.socket.send_to(&wire, self.peer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        for packet in [
            Packet::Probe,
            Packet::ProbeResponse,
            Packet::Write {
                addr: 0x1004,
                value: 0xdead_beef,
            },
            Packet::Read { addr: 0x000c },
            Packet::ReadResponse { value: 42 },
        ] {
            assert_eq!(decode(&encode(&packet)), Some(packet));
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(decode(&[]), None);
        assert_eq!(decode(&[0x12, 0x34, 0, 0, 0, 0, 0, 0]), None);
        // Right magic, wrong version nibble.
        assert_eq!(decode(&[0x4e, 0x6f, 0x20, 0x44, 0, 0, 0, 0]), None);
        // Truncated record.
        assert_eq!(decode(&[0x4e, 0x6f, 0x10, 0x44, 0, 0, 0, 0, 0x00, 0x0f]), None);
    }

    #[test]
    fn header_layout() {
        let wire = encode(&Packet::Probe);
        assert_eq!(&wire[..2], &MAGIC.to_be_bytes());
        assert_eq!(wire[2], VERSION << 4 | FLAG_PF);
        assert_eq!(wire[3], SIZES);
        assert_eq!(wire.len(), 8);
    }
}
