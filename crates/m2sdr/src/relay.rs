//! Handoff between a stream and the shared-memory ring.
//!
//! An RX relay drains the device into a [`RingProducer`] another process
//! consumes; a TX relay feeds the device from a [`RingConsumer`]. Ring
//! over/underflow observed on the streaming side is mirrored into the
//! ring's `error_count`, whose meaning is direction-dependent: lost
//! buffers on the RX producer, underflows on the TX consumer.

use std::time::Duration;

use tracing::debug;

use m2sdr_shmring::{RingConsumer, RingProducer};

use crate::error::{Error, Result};
use crate::stream::{StreamHandle, StreamStats};

fn chunk_matches(chunk_bytes: usize, buf_size: usize) -> Result<()> {
    if chunk_bytes != buf_size {
        return Err(Error::InvalidArgument(format!(
            "ring chunk of {chunk_bytes} bytes does not match the {buf_size}-byte dma buffer"
        )));
    }
    Ok(())
}

fn ring_deadline(timeout_ms: Option<i64>) -> Option<Duration> {
    match timeout_ms {
        Some(ms) if ms < 0 => None,
        Some(ms) => Some(Duration::from_millis(ms as u64)),
        None => Some(Duration::from_secs(1)),
    }
}

/// Moves `buffers` received buffers into the ring, one chunk per buffer.
/// Lost-buffer counts accrued on the way are added to the ring's error
/// counter. Returns the number of buffers relayed.
pub fn rx_to_ring(
    stream: &mut StreamHandle,
    ring: &mut RingProducer,
    buffers: u64,
    timeout_ms: Option<i64>,
) -> Result<u64> {
    chunk_matches(ring.chunk_bytes(), stream.buf_size())?;
    let deadline = ring_deadline(timeout_ms);

    let mut chunk = vec![0u8; ring.chunk_bytes()];
    let mut lost_seen = stream.stats().lost_buffers;
    for relayed in 0..buffers {
        let mut stats = StreamStats::default();
        stream.rx(&mut chunk, Some(&mut stats), timeout_ms)?;
        if stats.lost_buffers > lost_seen {
            ring.add_errors(stats.lost_buffers - lost_seen);
            lost_seen = stats.lost_buffers;
        }
        if let Err(e) = ring.write(&chunk, deadline) {
            debug!(relayed, error = %e, "ring refused chunk, stopping relay");
            return Err(e.into());
        }
    }
    Ok(buffers)
}

/// Feeds the device from the ring until the producer marks it done or
/// `buffers` chunks have moved (`u64::MAX` for "until done"). Underflow
/// counts accrued on the way are added to the ring's error counter.
/// Returns the number of buffers relayed.
pub fn ring_to_tx(
    ring: &mut RingConsumer,
    stream: &mut StreamHandle,
    buffers: u64,
    timeout_ms: Option<i64>,
) -> Result<u64> {
    chunk_matches(ring.chunk_bytes(), stream.buf_size())?;
    let deadline = ring_deadline(timeout_ms);

    let mut underflows_seen = stream.stats().underflows;
    let mut relayed = 0;
    while relayed < buffers {
        let chunk = match ring.read(deadline)? {
            Some(chunk) => chunk.to_vec(),
            None => break, // writer done, ring drained
        };
        let mut stats = StreamStats::default();
        stream.tx(&chunk, Some(&mut stats), timeout_ms)?;
        if stats.underflows > underflows_seen {
            ring.add_errors(stats.underflows - underflows_seen);
            underflows_seen = stats.underflows;
        }
        relayed += 1;
    }
    Ok(relayed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Device, Direction, SampleFormat, SimConfig, StreamConfig};
    use m2sdr_shmring::RingConfig;

    const B: usize = 8192;

    fn sim() -> Device {
        Device::open_sim(SimConfig {
            num_channels: 1,
            buf_count: 64,
            buf_size: B,
        })
        .unwrap()
    }

    fn ring_config() -> RingConfig {
        RingConfig {
            chunk_size: 2048,
            num_slots: 16,
            num_channels: 1,
            sample_size: 4,
        }
    }

    #[test]
    fn rx_relay_moves_device_buffers_into_the_ring() {
        let device = sim();
        let mut rx = device
            .config(&StreamConfig {
                direction: Direction::Rx,
                format: SampleFormat::ComplexInt16,
                samples_per_buffer: 2048,
                ..StreamConfig::default()
            })
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rx.shm");
        let mut producer = RingProducer::create(&path, &ring_config()).unwrap();
        let mut consumer = m2sdr_shmring::RingConsumer::open(&path).unwrap();

        device.sim().unwrap().step(0, Direction::Rx, 8);
        let relayed = rx_to_ring(&mut rx, &mut producer, 8, Some(2_000)).unwrap();
        assert_eq!(relayed, 8);

        let mut chunks = 0;
        while consumer.try_read().is_some() {
            chunks += 1;
        }
        assert_eq!(chunks, 8);
        assert_eq!(producer.error_count(), 0);
    }

    #[test]
    fn rx_relay_mirrors_lost_buffers_into_error_count() {
        let device = sim();
        let mut rx = device
            .config(&StreamConfig {
                direction: Direction::Rx,
                samples_per_buffer: 2048,
                ..StreamConfig::default()
            })
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rx.shm");
        let mut producer = RingProducer::create(&path, &ring_config()).unwrap();
        let _consumer = m2sdr_shmring::RingConsumer::open(&path).unwrap();

        // Overrun the ring: 64 completions against a 32-buffer watermark.
        device.sim().unwrap().step(0, Direction::Rx, 64);
        rx_to_ring(&mut rx, &mut producer, 4, Some(2_000)).unwrap();
        assert!(producer.error_count() >= 10);
    }

    #[test]
    fn tx_relay_feeds_device_until_writer_done() {
        let device = sim();
        device.set_loopback(0, true).unwrap();
        let mut tx = device
            .config(&StreamConfig {
                direction: Direction::Tx,
                samples_per_buffer: 2048,
                ..StreamConfig::default()
            })
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.shm");
        let mut producer = RingProducer::create(&path, &ring_config()).unwrap();
        let mut consumer = m2sdr_shmring::RingConsumer::open(&path).unwrap();

        let chunk = vec![0x5au8; B];
        for _ in 0..6 {
            producer.try_write(&chunk).unwrap().unwrap();
        }
        producer.finish();

        let relayed = ring_to_tx(&mut consumer, &mut tx, u64::MAX, Some(2_000)).unwrap();
        assert_eq!(relayed, 6);
        assert_eq!(tx.stats().sw_count, 6);
    }

    #[test]
    fn mismatched_chunk_geometry_is_rejected() {
        let device = sim();
        let mut rx = device
            .config(&StreamConfig {
                direction: Direction::Rx,
                samples_per_buffer: 2048,
                ..StreamConfig::default()
            })
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.shm");
        let mut producer = RingProducer::create(
            &path,
            &RingConfig {
                chunk_size: 1024, // half a buffer
                ..ring_config()
            },
        )
        .unwrap();

        assert!(rx_to_ring(&mut rx, &mut producer, 1, Some(100)).is_err());
    }
}
