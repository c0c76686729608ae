//! # Media Parameters and Audio Frames
//!
//! Types describing the negotiated audio streams (format, rate, channel
//! layout) and decoding of the raw binary WebSocket frames that carry the
//! samples once a session is active.

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Media kind offered in the open transaction. Only audio is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
}

/// Sample encoding of a media stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaFormat {
    #[serde(rename = "PCMU")]
    Pcmu,
    #[serde(rename = "L16")]
    L16,
}

impl MediaFormat {
    /// Bytes per sample per channel.
    pub const fn bytes_per_sample(&self) -> usize {
        match self {
            MediaFormat::Pcmu => 1,
            MediaFormat::L16 => 2,
        }
    }
}

/// Logical channel of a call leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaChannel {
    External,
    Internal,
}

/// One offered (or selected) media stream description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaParameter {
    #[serde(rename = "type")]
    pub media_type: MediaType,
    pub format: MediaFormat,
    pub channels: Vec<MediaChannel>,
    pub rate: u32,
}

impl MediaParameter {
    /// Stereo PCMU at 8 kHz with the conventional external/internal layout.
    pub fn pcmu_stereo_8k() -> Self {
        Self {
            media_type: MediaType::Audio,
            format: MediaFormat::Pcmu,
            channels: vec![MediaChannel::External, MediaChannel::Internal],
            rate: 8000,
        }
    }

    /// Exact match on type, format, rate, and the ordered channel list.
    pub fn matches(&self, other: &MediaParameter) -> bool {
        self == other
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AudioFrameError {
    #[error("empty audio frame")]
    Empty,
    #[error("frame length {length} is not a multiple of the {frame_size}-byte sample frame")]
    Misaligned { length: usize, frame_size: usize },
}

/// A decoded binary audio message: interleaved samples for the selected media.
#[derive(Debug, Clone)]
pub struct MediaDataFrame {
    pub format: MediaFormat,
    pub rate: u32,
    pub channels: Vec<MediaChannel>,
    pub data: Vec<u8>,
    /// Samples per channel in this frame.
    pub sample_count: u64,
}

impl MediaDataFrame {
    /// Validate and wrap a binary message against the selected media.
    pub fn from_message(data: Vec<u8>, media: &MediaParameter) -> Result<Self, AudioFrameError> {
        if data.is_empty() {
            return Err(AudioFrameError::Empty);
        }
        let frame_size = media.format.bytes_per_sample() * media.channels.len().max(1);
        if data.len() % frame_size != 0 {
            return Err(AudioFrameError::Misaligned {
                length: data.len(),
                frame_size,
            });
        }
        Ok(Self {
            format: media.format,
            rate: media.rate,
            channels: media.channels.clone(),
            sample_count: (data.len() / frame_size) as u64,
            data,
        })
    }

    /// Interleaved L16 samples decoded little-endian. Empty for PCMU frames.
    pub fn samples_l16(&self) -> Vec<i16> {
        if self.format != MediaFormat::L16 {
            return Vec::new();
        }
        let mut cursor = Cursor::new(self.data.as_slice());
        let mut samples = Vec::with_capacity(self.data.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_parameter_serde() {
        let media = MediaParameter::pcmu_stereo_8k();
        let json = serde_json::to_value(&media).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "audio",
                "format": "PCMU",
                "channels": ["external", "internal"],
                "rate": 8000
            })
        );
        let back: MediaParameter = serde_json::from_value(json).unwrap();
        assert_eq!(back, media);
    }

    #[test]
    fn test_frame_sample_count_stereo_pcmu() {
        let media = MediaParameter::pcmu_stereo_8k();
        let frame = MediaDataFrame::from_message(vec![0u8; 320], &media).unwrap();
        assert_eq!(frame.sample_count, 160);
    }

    #[test]
    fn test_frame_rejects_misaligned_l16() {
        let media = MediaParameter {
            format: MediaFormat::L16,
            channels: vec![MediaChannel::External],
            ..MediaParameter::pcmu_stereo_8k()
        };
        let err = MediaDataFrame::from_message(vec![0u8; 3], &media).unwrap_err();
        assert!(matches!(err, AudioFrameError::Misaligned { .. }));
        assert!(MediaDataFrame::from_message(Vec::new(), &media).is_err());
    }

    #[test]
    fn test_l16_decode() {
        let media = MediaParameter {
            format: MediaFormat::L16,
            channels: vec![MediaChannel::External],
            ..MediaParameter::pcmu_stereo_8k()
        };
        let frame = MediaDataFrame::from_message(vec![0x01, 0x00, 0xff, 0xff], &media).unwrap();
        assert_eq!(frame.samples_l16(), vec![1, -1]);
    }
}
