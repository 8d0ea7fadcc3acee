//! AAC AudioSpecificConfig and ADTS framing
//!
//! Inside the crate AAC access units are raw. ADTS headers are only added
//! when writing MPEG-TS.

use bytes::Bytes;

use crate::error::{MediaError, Result};

const SAMPLING_FREQUENCIES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// The two leading bytes of an AudioSpecificConfig that ADTS needs
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSpecificConfig {
    /// Audio object type (2 = AAC LC)
    pub audio_object_type: u8,
    pub sampling_frequency_index: u8,
    pub sampling_frequency: u32,
    pub channel_configuration: u8,
    pub raw: Bytes,
}

impl AudioSpecificConfig {
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < 2 {
            return Err(MediaError::InvalidAudioConfig.into());
        }

        // objectType(5) frequencyIndex(4) channelConfig(4) ...
        let audio_object_type = data[0] >> 3;
        let sampling_frequency_index = ((data[0] & 0x07) << 1) | (data[1] >> 7);
        let channel_configuration = (data[1] >> 3) & 0x0F;

        let sampling_frequency = *SAMPLING_FREQUENCIES
            .get(sampling_frequency_index as usize)
            .ok_or(MediaError::InvalidAudioConfig)?;

        Ok(Self {
            audio_object_type,
            sampling_frequency_index,
            sampling_frequency,
            channel_configuration,
            raw: data,
        })
    }

    /// Samples per AAC frame
    pub fn samples_per_frame(&self) -> u32 {
        1024
    }

    /// 7-byte ADTS header (no CRC) for a raw frame of `frame_length` bytes
    pub fn adts_header(&self, frame_length: usize) -> [u8; 7] {
        let profile = self.audio_object_type.saturating_sub(1) & 0x03;
        let freq = self.sampling_frequency_index & 0x0F;
        let channels = self.channel_configuration;
        let len = frame_length + 7;

        [
            0xFF,
            0xF1, // MPEG-4, layer 0, no CRC
            (profile << 6) | (freq << 2) | ((channels >> 2) & 0x01),
            ((channels & 0x03) << 6) | ((len >> 11) & 0x03) as u8,
            ((len >> 3) & 0xFF) as u8,
            (((len & 0x07) << 5) | 0x1F) as u8,
            0xFC,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lc_44100_stereo() {
        let asc = AudioSpecificConfig::parse(Bytes::from_static(&[0x12, 0x10])).unwrap();
        assert_eq!(asc.audio_object_type, 2);
        assert_eq!(asc.sampling_frequency_index, 4);
        assert_eq!(asc.sampling_frequency, 44100);
        assert_eq!(asc.channel_configuration, 2);
    }

    #[test]
    fn test_parse_48000_stereo() {
        // 0x11 0x90 is what RTSP cameras typically announce
        let asc = AudioSpecificConfig::parse(Bytes::from_static(&[0x11, 0x90])).unwrap();
        assert_eq!(asc.audio_object_type, 2);
        assert_eq!(asc.sampling_frequency, 48000);
        assert_eq!(asc.channel_configuration, 2);
    }

    #[test]
    fn test_invalid_config() {
        assert!(AudioSpecificConfig::parse(Bytes::from_static(&[0x12])).is_err());
        // frequency index 15 (explicit) is not accepted
        assert!(AudioSpecificConfig::parse(Bytes::from_static(&[0x17, 0x90])).is_err());
    }

    #[test]
    fn test_adts_header() {
        let asc = AudioSpecificConfig::parse(Bytes::from_static(&[0x12, 0x10])).unwrap();
        let h = asc.adts_header(100);
        assert_eq!(h[0], 0xFF);
        assert_eq!(h[1], 0xF1);
        assert_eq!(h[2] >> 6, 1); // LC profile - 1
        assert_eq!((h[2] >> 2) & 0x0F, 4);
        let len = (((h[3] & 0x03) as usize) << 11) | ((h[4] as usize) << 3) | ((h[5] >> 5) as usize);
        assert_eq!(len, 107);
    }
}
