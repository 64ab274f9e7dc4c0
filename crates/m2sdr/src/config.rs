//! Stream configuration.

use serde::{Deserialize, Serialize};

use m2sdr_proto::Direction;

use crate::error::{Error, Result};

/// On-wire sample format. Streaming is passthrough: the format only fixes
/// the per-sample byte count the buffer geometry is validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    /// 8-bit I + 8-bit Q
    ComplexInt8,
    /// 16-bit I + 16-bit Q
    ComplexInt16,
    /// 32-bit float I + Q
    ComplexFloat32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::ComplexInt8 => 2,
            SampleFormat::ComplexInt16 => 4,
            SampleFormat::ComplexFloat32 => 8,
        }
    }
}

/// Behavior flags for a stream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StreamFlags {
    /// Hand out slices straight into the DMA buffers instead of staging
    /// through a private copy.
    #[serde(default)]
    pub zero_copy: bool,
    /// Keep the end-of-frame marker on every descriptor (aligned-frame
    /// gateware mode).
    #[serde(default)]
    pub aligned_frames: bool,
}

/// Parameters for [`crate::Device::config`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamConfig {
    pub direction: Direction,
    pub format: SampleFormat,
    pub channel: usize,
    /// Samples per DMA buffer. `samples_per_buffer * bytes_per_sample`
    /// must be non-zero and divide the buffer size evenly.
    pub samples_per_buffer: u32,
    #[serde(default)]
    pub flags: StreamFlags,
    /// Default deadline for blocking stream operations that do not carry
    /// their own, in milliseconds. `0` = non-blocking, negative = forever.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: i64,
}

fn default_timeout_ms() -> i64 {
    1_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            direction: Direction::Rx,
            format: SampleFormat::ComplexInt16,
            channel: 0,
            samples_per_buffer: (m2sdr_proto::DMA_BUFFER_SIZE / 4) as u32,
            flags: StreamFlags::default(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl StreamConfig {
    /// Bytes one buffer's worth of samples occupies.
    pub fn bytes_per_buffer(&self) -> usize {
        self.samples_per_buffer as usize * self.format.bytes_per_sample()
    }

    /// Validates the sample geometry against the DMA buffer size `b`.
    pub fn validate(&self, b: usize, num_channels: usize) -> Result<()> {
        if self.channel >= num_channels {
            return Err(Error::InvalidArgument(format!(
                "channel {} out of range (device has {})",
                self.channel, num_channels
            )));
        }
        let bytes = self.bytes_per_buffer();
        if bytes == 0 || bytes > b || b % bytes != 0 {
            return Err(Error::InvalidArgument(format!(
                "samples_per_buffer {} x {} bytes/sample does not divide buffer size {}",
                self.samples_per_buffer,
                self.format.bytes_per_sample(),
                b
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const B: usize = 8192;

    fn config(samples: u32, format: SampleFormat) -> StreamConfig {
        StreamConfig {
            samples_per_buffer: samples,
            format,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn exact_buffer_geometry_is_accepted() {
        config(2048, SampleFormat::ComplexInt16).validate(B, 1).unwrap();
    }

    #[test]
    fn dividing_geometry_is_accepted() {
        config(1024, SampleFormat::ComplexInt16).validate(B, 1).unwrap();
        config(512, SampleFormat::ComplexFloat32).validate(B, 1).unwrap();
    }

    #[test]
    fn non_dividing_geometry_is_rejected() {
        assert!(config(1000, SampleFormat::ComplexInt16).validate(B, 1).is_err());
        assert!(config(3000, SampleFormat::ComplexInt16).validate(B, 1).is_err());
        assert!(config(0, SampleFormat::ComplexInt16).validate(B, 1).is_err());
        // Larger than a buffer.
        assert!(config(4096, SampleFormat::ComplexFloat32).validate(B, 1).is_err());
    }

    #[test]
    fn channel_out_of_range_is_rejected() {
        let cfg = StreamConfig {
            channel: 2,
            ..StreamConfig::default()
        };
        assert!(cfg.validate(B, 2).is_err());
    }

    #[test]
    fn config_roundtrips_through_json() {
        let cfg = StreamConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: StreamConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.samples_per_buffer, cfg.samples_per_buffer);
        assert_eq!(back.format, cfg.format);
    }
}
