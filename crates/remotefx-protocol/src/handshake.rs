//! Session handshake and negotiated audio format.

use crate::error::{ProtocolError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u32 = 1;

pub const HANDSHAKE_SIZE: usize = 32;

pub const MAX_CHANNELS: u32 = 64;
pub const MAX_BLOCK_SIZE: u32 = 8192;
pub const MIN_SAMPLE_RATE: f64 = 8_000.0;
pub const MAX_SAMPLE_RATE: f64 = 384_000.0;

/// Sample precision of an audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    F32,
    F64,
}

impl SampleFormat {
    pub fn from_is_double(is_double: bool) -> Self {
        if is_double {
            SampleFormat::F64
        } else {
            SampleFormat::F32
        }
    }

    pub fn is_double(self) -> bool {
        self == SampleFormat::F64
    }

    /// Bytes per sample
    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }
}

/// Format fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioFormat {
    pub channels: u32,
    pub sample_rate: f64,
    pub block_size: u32,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    pub fn new(channels: u32, sample_rate: f64, block_size: u32) -> Self {
        Self {
            channels,
            sample_rate,
            block_size,
            sample_format: SampleFormat::F32,
        }
    }

    pub fn double_precision(mut self) -> Self {
        self.sample_format = SampleFormat::F64;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(ProtocolError::InvalidHandshake(format!(
                "channel count {} outside 1..={}",
                self.channels, MAX_CHANNELS
            )));
        }
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(ProtocolError::InvalidHandshake(format!(
                "block size {} outside 1..={}",
                self.block_size, MAX_BLOCK_SIZE
            )));
        }
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(ProtocolError::InvalidHandshake(format!(
                "sample rate {} outside {}..={}",
                self.sample_rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
            )));
        }
        Ok(())
    }
}

/// First bytes a client sends on the control stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Handshake {
    pub version: u32,
    /// Port the server connects back to for the audio and screen streams
    pub client_port: u16,
    pub format: AudioFormat,
}

impl Handshake {
    pub fn new(client_port: u16, format: AudioFormat) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            client_port,
            format,
        }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut out = [0u8; HANDSHAKE_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..6].copy_from_slice(&self.client_port.to_le_bytes());
        out[8..12].copy_from_slice(&self.format.channels.to_le_bytes());
        out[12..20].copy_from_slice(&self.format.sample_rate.to_le_bytes());
        out[20..24].copy_from_slice(&self.format.block_size.to_le_bytes());
        out[24] = self.format.sample_format.is_double() as u8;
        out
    }

    /// Parse and validate a handshake.
    pub fn from_bytes(bytes: &[u8; HANDSHAKE_SIZE]) -> Result<Self> {
        let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

        let version = u32_at(0);
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                got: version,
                expected: PROTOCOL_VERSION,
            });
        }

        let mut rate = [0u8; 8];
        rate.copy_from_slice(&bytes[12..20]);
        let format = AudioFormat {
            channels: u32_at(8),
            sample_rate: f64::from_le_bytes(rate),
            block_size: u32_at(20),
            sample_format: match bytes[24] {
                0 => SampleFormat::F32,
                1 => SampleFormat::F64,
                other => {
                    return Err(ProtocolError::InvalidHandshake(format!(
                        "precision flag {}",
                        other
                    )))
                }
            },
        };
        format.validate()?;

        Ok(Self {
            version,
            client_port: u16::from_le_bytes([bytes[4], bytes[5]]),
            format,
        })
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HANDSHAKE_SIZE];
        reader.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ProtocolError::ConnectionClosed
            } else {
                ProtocolError::Io(e)
            }
        })?;
        Self::from_bytes(&buf)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_48k() -> AudioFormat {
        AudioFormat::new(2, 48_000.0, 512)
    }

    #[test]
    fn test_handshake_roundtrip() {
        let hs = Handshake::new(55055, stereo_48k().double_precision());
        let parsed = Handshake::from_bytes(&hs.to_bytes()).unwrap();
        assert_eq!(parsed, hs);
        assert_eq!(parsed.format.sample_format, SampleFormat::F64);
    }

    #[test]
    fn test_version_mismatch() {
        let mut hs = Handshake::new(1, stereo_48k());
        hs.version = 7;
        assert!(matches!(
            Handshake::from_bytes(&hs.to_bytes()),
            Err(ProtocolError::VersionMismatch { got: 7, .. })
        ));
    }

    #[test]
    fn test_format_limits() {
        assert!(AudioFormat::new(0, 48_000.0, 512).validate().is_err());
        assert!(AudioFormat::new(65, 48_000.0, 512).validate().is_err());
        assert!(AudioFormat::new(2, 48_000.0, 0).validate().is_err());
        assert!(AudioFormat::new(2, 48_000.0, 8193).validate().is_err());
        assert!(AudioFormat::new(2, 1_000.0, 512).validate().is_err());
        assert!(AudioFormat::new(2, f64::NAN, 512).validate().is_err());
        assert!(AudioFormat::new(64, 384_000.0, 8192).validate().is_ok());
    }

    #[test]
    fn test_bad_precision_flag() {
        let mut bytes = Handshake::new(1, stereo_48k()).to_bytes();
        bytes[24] = 3;
        assert!(matches!(
            Handshake::from_bytes(&bytes),
            Err(ProtocolError::InvalidHandshake(_))
        ));
    }

    #[tokio::test]
    async fn test_handshake_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let hs = Handshake::new(40000, stereo_48k());
        hs.write_to(&mut client).await.unwrap();
        let got = Handshake::read_from(&mut server).await.unwrap();
        assert_eq!(got.client_port, 40000);
        assert_eq!(got.format.channels, 2);
    }

    #[tokio::test]
    async fn test_handshake_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(matches!(
            Handshake::read_from(&mut server).await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }
}
