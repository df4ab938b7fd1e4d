//! Audio stream chunk framing and planar sample (de)serialization.
//!
//! Request: `channels u32, samples u32, is_double u8, pad[3], midi_events u32`,
//! then `channels * samples` planar little-endian samples, `midi_events` MIDI
//! events and one [`TransportPosition`] block.
//!
//! Response: `channels u32, samples u32, latency u32, is_double u8, pad[3],
//! midi_events u32`, then the processed samples and the MIDI events that came
//! out of the chain.
//!
//! A MIDI event is `sample_offset u32, size u32` followed by `size` bytes.

use crate::error::{ProtocolError, Result};
use crate::handshake::{AudioFormat, SampleFormat};
use smallvec::SmallVec;

pub const CHUNK_HEADER_SIZE: usize = 16;
pub const RESPONSE_HEADER_SIZE: usize = 20;
pub const MIDI_EVENT_HEADER_SIZE: usize = 8;
pub const POSITION_SIZE: usize = 56;

pub const MAX_MIDI_EVENTS: u32 = 4096;
/// Largest single event, sysex included.
pub const MAX_MIDI_EVENT_SIZE: u32 = 64 * 1024;

const FLAG_PLAYING: u8 = 1;
const FLAG_RECORDING: u8 = 1 << 1;
const FLAG_LOOPING: u8 = 1 << 2;

#[inline]
fn u32_at(b: &[u8], i: usize) -> u32 {
    u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]])
}

#[inline]
fn f64_at(b: &[u8], i: usize) -> f64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&b[i..i + 8]);
    f64::from_le_bytes(word)
}

/// Wire representation of one sample width.
pub trait Sample: Copy + Default + Send + 'static {
    const SIZE: usize;
    const FORMAT: SampleFormat;

    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut Vec<u8>);
}

impl Sample for f32 {
    const SIZE: usize = 4;
    const FORMAT: SampleFormat = SampleFormat::F32;

    #[inline]
    fn read_le(b: &[u8]) -> Self {
        f32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    #[inline]
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl Sample for f64 {
    const SIZE: usize = 8;
    const FORMAT: SampleFormat = SampleFormat::F64;

    #[inline]
    fn read_le(b: &[u8]) -> Self {
        f64_at(b, 0)
    }

    #[inline]
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

/// One timestamped MIDI message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiEvent {
    /// Sample position inside the chunk.
    pub sample_offset: u32,
    pub data: SmallVec<[u8; 4]>,
}

impl MidiEvent {
    pub fn new(sample_offset: u32, data: &[u8]) -> Self {
        Self {
            sample_offset,
            data: SmallVec::from_slice(data),
        }
    }

    pub fn encoded_len(&self) -> usize {
        MIDI_EVENT_HEADER_SIZE + self.data.len()
    }
}

/// Offset and size of the event whose header starts at `b[0]`.
fn midi_event_header(b: &[u8], samples: u32) -> Result<(u32, usize)> {
    let offset = u32_at(b, 0);
    let size = u32_at(b, 4);
    if size == 0 || size > MAX_MIDI_EVENT_SIZE {
        return Err(ProtocolError::Malformed {
            kind: "MidiEvent",
            reason: format!("event size {}", size),
        });
    }
    if offset >= samples {
        return Err(ProtocolError::Malformed {
            kind: "MidiEvent",
            reason: format!("offset {} outside chunk of {} samples", offset, samples),
        });
    }
    Ok((offset, size as usize))
}

/// Decode `count` events from the front of `data` into `out`.
/// Returns the number of bytes consumed.
pub fn read_midi_events(
    data: &[u8],
    count: u32,
    samples: u32,
    out: &mut Vec<MidiEvent>,
) -> Result<usize> {
    out.clear();
    let mut pos = 0;
    for _ in 0..count {
        let truncated = || ProtocolError::Malformed {
            kind: "MidiEvent",
            reason: format!("truncated after {} bytes", data.len()),
        };
        let header = data.get(pos..pos + MIDI_EVENT_HEADER_SIZE).ok_or_else(truncated)?;
        let (sample_offset, size) = midi_event_header(header, samples)?;
        pos += MIDI_EVENT_HEADER_SIZE;
        let bytes = data.get(pos..pos + size).ok_or_else(truncated)?;
        out.push(MidiEvent::new(sample_offset, bytes));
        pos += size;
    }
    Ok(pos)
}

pub fn write_midi_events(events: &[MidiEvent], out: &mut Vec<u8>) {
    for event in events {
        out.extend_from_slice(&event.sample_offset.to_le_bytes());
        out.extend_from_slice(&(event.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&event.data);
    }
}

/// Host transport state at the start of a chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportPosition {
    pub bpm: f64,
    pub time_in_samples: i64,
    pub ppq_position: f64,
    pub ppq_last_bar_start: f64,
    pub ppq_loop_start: f64,
    pub ppq_loop_end: f64,
    pub time_sig_numerator: u16,
    pub time_sig_denominator: u16,
    pub is_playing: bool,
    pub is_recording: bool,
    pub is_looping: bool,
}

impl Default for TransportPosition {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            time_in_samples: 0,
            ppq_position: 0.0,
            ppq_last_bar_start: 0.0,
            ppq_loop_start: 0.0,
            ppq_loop_end: 0.0,
            time_sig_numerator: 4,
            time_sig_denominator: 4,
            is_playing: false,
            is_recording: false,
            is_looping: false,
        }
    }
}

impl TransportPosition {
    pub fn time_in_seconds(&self, sample_rate: f64) -> f64 {
        self.time_in_samples as f64 / sample_rate
    }

    pub fn to_bytes(&self) -> [u8; POSITION_SIZE] {
        let mut out = [0u8; POSITION_SIZE];
        out[0..8].copy_from_slice(&self.bpm.to_le_bytes());
        out[8..16].copy_from_slice(&self.time_in_samples.to_le_bytes());
        out[16..24].copy_from_slice(&self.ppq_position.to_le_bytes());
        out[24..32].copy_from_slice(&self.ppq_last_bar_start.to_le_bytes());
        out[32..40].copy_from_slice(&self.ppq_loop_start.to_le_bytes());
        out[40..48].copy_from_slice(&self.ppq_loop_end.to_le_bytes());
        out[48..50].copy_from_slice(&self.time_sig_numerator.to_le_bytes());
        out[50..52].copy_from_slice(&self.time_sig_denominator.to_le_bytes());
        let mut flags = 0;
        if self.is_playing {
            flags |= FLAG_PLAYING;
        }
        if self.is_recording {
            flags |= FLAG_RECORDING;
        }
        if self.is_looping {
            flags |= FLAG_LOOPING;
        }
        out[52] = flags;
        out
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() < POSITION_SIZE {
            return Err(ProtocolError::Malformed {
                kind: "TransportPosition",
                reason: format!("{} bytes, need {}", b.len(), POSITION_SIZE),
            });
        }
        let mut time = [0u8; 8];
        time.copy_from_slice(&b[8..16]);
        let flags = b[52];
        Ok(Self {
            bpm: f64_at(b, 0),
            time_in_samples: i64::from_le_bytes(time),
            ppq_position: f64_at(b, 16),
            ppq_last_bar_start: f64_at(b, 24),
            ppq_loop_start: f64_at(b, 32),
            ppq_loop_end: f64_at(b, 40),
            time_sig_numerator: u16::from_le_bytes([b[48], b[49]]),
            time_sig_denominator: u16::from_le_bytes([b[50], b[51]]),
            is_playing: flags & FLAG_PLAYING != 0,
            is_recording: flags & FLAG_RECORDING != 0,
            is_looping: flags & FLAG_LOOPING != 0,
        })
    }
}

/// Progress of a request sitting in a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkScan {
    /// The whole request is buffered and spans this many bytes.
    Complete(usize),
    /// At least this many bytes must be buffered before scanning again.
    Need(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioChunkHeader {
    pub channels: u32,
    pub samples: u32,
    pub sample_format: SampleFormat,
    pub midi_events: u32,
}

impl AudioChunkHeader {
    pub fn new(channels: u32, samples: u32, sample_format: SampleFormat) -> Self {
        Self {
            channels,
            samples,
            sample_format,
            midi_events: 0,
        }
    }

    pub fn with_midi_events(mut self, count: u32) -> Self {
        self.midi_events = count;
        self
    }

    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut out = [0u8; CHUNK_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.channels.to_le_bytes());
        out[4..8].copy_from_slice(&self.samples.to_le_bytes());
        out[8] = self.sample_format.is_double() as u8;
        out[12..16].copy_from_slice(&self.midi_events.to_le_bytes());
        out
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() < CHUNK_HEADER_SIZE {
            return Err(ProtocolError::Malformed {
                kind: "AudioChunkHeader",
                reason: format!("{} bytes, need {}", b.len(), CHUNK_HEADER_SIZE),
            });
        }
        let sample_format = match b[8] {
            0 => SampleFormat::F32,
            1 => SampleFormat::F64,
            other => {
                return Err(ProtocolError::Malformed {
                    kind: "AudioChunkHeader",
                    reason: format!("precision flag {}", other),
                })
            }
        };
        Ok(Self {
            channels: u32_at(b, 0),
            samples: u32_at(b, 4),
            sample_format,
            midi_events: u32_at(b, 12),
        })
    }

    /// Byte length of the sample data following this header.
    pub fn payload_len(&self) -> usize {
        self.channels as usize * self.samples as usize * self.sample_format.sample_size()
    }

    /// Check the chunk against the negotiated session format.
    pub fn validate(&self, format: &AudioFormat) -> Result<()> {
        if self.channels != format.channels {
            return Err(ProtocolError::FormatMismatch(format!(
                "chunk has {} channels, session negotiated {}",
                self.channels, format.channels
            )));
        }
        if self.samples == 0 || self.samples > format.block_size {
            return Err(ProtocolError::FormatMismatch(format!(
                "chunk has {} samples, session block size is {}",
                self.samples, format.block_size
            )));
        }
        if self.midi_events > MAX_MIDI_EVENTS {
            return Err(ProtocolError::Malformed {
                kind: "AudioChunkHeader",
                reason: format!("{} MIDI events, limit {}", self.midi_events, MAX_MIDI_EVENTS),
            });
        }
        Ok(())
    }

    /// Measure the request whose header starts at `buf[0]`. MIDI event
    /// headers are checked as soon as they arrive.
    pub fn scan(&self, buf: &[u8]) -> Result<ChunkScan> {
        let mut pos = CHUNK_HEADER_SIZE + self.payload_len();
        for _ in 0..self.midi_events {
            let end = pos + MIDI_EVENT_HEADER_SIZE;
            if buf.len() < end {
                return Ok(ChunkScan::Need(end));
            }
            let (_, size) = midi_event_header(&buf[pos..end], self.samples)?;
            pos = end + size;
        }
        pos += POSITION_SIZE;
        if buf.len() < pos {
            Ok(ChunkScan::Need(pos))
        } else {
            Ok(ChunkScan::Complete(pos))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioResponseHeader {
    pub channels: u32,
    pub samples: u32,
    pub latency_samples: u32,
    pub sample_format: SampleFormat,
    pub midi_events: u32,
}

impl AudioResponseHeader {
    pub fn to_bytes(&self) -> [u8; RESPONSE_HEADER_SIZE] {
        let mut out = [0u8; RESPONSE_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.channels.to_le_bytes());
        out[4..8].copy_from_slice(&self.samples.to_le_bytes());
        out[8..12].copy_from_slice(&self.latency_samples.to_le_bytes());
        out[12] = self.sample_format.is_double() as u8;
        out[16..20].copy_from_slice(&self.midi_events.to_le_bytes());
        out
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() < RESPONSE_HEADER_SIZE {
            return Err(ProtocolError::Malformed {
                kind: "AudioResponseHeader",
                reason: format!("{} bytes, need {}", b.len(), RESPONSE_HEADER_SIZE),
            });
        }
        Ok(Self {
            channels: u32_at(b, 0),
            samples: u32_at(b, 4),
            latency_samples: u32_at(b, 8),
            sample_format: SampleFormat::from_is_double(b[12] != 0),
            midi_events: u32_at(b, 16),
        })
    }

    /// Byte length of the samples following this header. MIDI events follow
    /// the samples.
    pub fn payload_len(&self) -> usize {
        self.channels as usize * self.samples as usize * self.sample_format.sample_size()
    }
}

/// Fill `channels` (each at least `samples` long) from planar bytes.
pub fn read_planar<T: Sample>(data: &[u8], samples: usize, channels: &mut [Vec<T>]) {
    let stride = samples * T::SIZE;
    for (ch, bytes) in channels.iter_mut().zip(data.chunks_exact(stride)) {
        for (dst, src) in ch[..samples].iter_mut().zip(bytes.chunks_exact(T::SIZE)) {
            *dst = T::read_le(src);
        }
    }
}

/// Append the first `samples` of each channel as planar bytes.
pub fn write_planar<T: Sample>(channels: &[Vec<T>], samples: usize, out: &mut Vec<u8>) {
    out.reserve(channels.len() * samples * T::SIZE);
    for ch in channels {
        for &s in &ch[..samples] {
            s.write_le(out);
        }
    }
}

/// Encode a complete request, as a client sends it.
pub fn write_request<T: Sample>(
    channels: &[Vec<T>],
    samples: usize,
    midi: &[MidiEvent],
    position: &TransportPosition,
    out: &mut Vec<u8>,
) {
    let header = AudioChunkHeader::new(channels.len() as u32, samples as u32, T::FORMAT)
        .with_midi_events(midi.len() as u32);
    out.extend_from_slice(&header.to_bytes());
    write_planar(channels, samples, out);
    write_midi_events(midi, out);
    out.extend_from_slice(&position.to_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_chunk_header_layout() {
        let header = AudioChunkHeader::new(2, 512, SampleFormat::F64).with_midi_events(3);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &2u32.to_le_bytes());
        assert_eq!(bytes[8], 1);
        assert_eq!(&bytes[12..16], &3u32.to_le_bytes());
        assert_eq!(AudioChunkHeader::from_bytes(&bytes).unwrap(), header);
        assert_eq!(header.payload_len(), 2 * 512 * 8);
    }

    #[test]
    fn test_chunk_validation() {
        let format = AudioFormat::new(2, 48_000.0, 512);
        assert!(AudioChunkHeader::new(2, 512, SampleFormat::F32).validate(&format).is_ok());
        assert!(AudioChunkHeader::new(2, 64, SampleFormat::F32).validate(&format).is_ok());
        assert!(AudioChunkHeader::new(1, 512, SampleFormat::F32).validate(&format).is_err());
        assert!(AudioChunkHeader::new(2, 513, SampleFormat::F32).validate(&format).is_err());
        assert!(AudioChunkHeader::new(2, 0, SampleFormat::F32).validate(&format).is_err());
        // Precision is chosen per chunk.
        assert!(AudioChunkHeader::new(2, 64, SampleFormat::F64).validate(&format).is_ok());
        assert!(AudioChunkHeader::new(2, 64, SampleFormat::F32)
            .with_midi_events(MAX_MIDI_EVENTS + 1)
            .validate(&format)
            .is_err());
    }

    #[test]
    fn test_bad_precision_flag() {
        let mut bytes = AudioChunkHeader::new(2, 4, SampleFormat::F32).to_bytes();
        bytes[8] = 9;
        assert!(AudioChunkHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_response_header_layout() {
        let header = AudioResponseHeader {
            channels: 2,
            samples: 128,
            latency_samples: 30,
            sample_format: SampleFormat::F32,
            midi_events: 1,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[8..12], &30u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &1u32.to_le_bytes());
        assert_eq!(AudioResponseHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_planar_is_channel_major() {
        let channels = vec![vec![1.0f32, 2.0], vec![3.0f32, 4.0]];
        let mut bytes = Vec::new();
        write_planar(&channels, 2, &mut bytes);
        assert_eq!(&bytes[8..12], &3.0f32.to_le_bytes());

        let mut decoded = vec![vec![0.0f32; 4]; 2];
        read_planar(&bytes, 2, &mut decoded);
        assert_relative_eq!(decoded[1][1], 4.0);
        assert_relative_eq!(decoded[0][2], 0.0);
    }

    #[test]
    fn test_planar_f64() {
        let channels = vec![vec![0.25f64; 3]];
        let mut bytes = Vec::new();
        write_planar(&channels, 3, &mut bytes);
        assert_eq!(bytes.len(), 24);
        let mut decoded = vec![vec![0.0f64; 3]];
        read_planar(&bytes, 3, &mut decoded);
        assert_relative_eq!(decoded[0][2], 0.25);
    }

    #[test]
    fn test_scan_waits_for_midi_and_position() {
        let midi = [MidiEvent::new(0, &[0x90, 60, 100]), MidiEvent::new(3, &[0xF0; 12])];
        let mut bytes = Vec::new();
        write_request(&[vec![0.0f32; 4]], 4, &midi, &TransportPosition::default(), &mut bytes);
        let header = AudioChunkHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.midi_events, 2);

        let samples_end = CHUNK_HEADER_SIZE + 16;
        assert_eq!(
            header.scan(&bytes[..samples_end]).unwrap(),
            ChunkScan::Need(samples_end + MIDI_EVENT_HEADER_SIZE)
        );
        // First event header visible, its data not yet.
        let ChunkScan::Need(n) = header.scan(&bytes[..samples_end + 9]).unwrap() else {
            panic!("expected Need");
        };
        assert!(n > samples_end + 9);
        assert_eq!(
            header.scan(&bytes[..bytes.len() - 1]).unwrap(),
            ChunkScan::Need(bytes.len())
        );

        // Trailing bytes of the next request do not count.
        let total = bytes.len();
        bytes.extend_from_slice(&[0u8; 7]);
        assert_eq!(header.scan(&bytes).unwrap(), ChunkScan::Complete(total));

        let mut events = Vec::new();
        let used = read_midi_events(&bytes[samples_end..], 2, 4, &mut events).unwrap();
        assert_eq!(used, total - samples_end - POSITION_SIZE);
        assert_eq!(events, midi);
    }

    #[test]
    fn test_midi_event_bounds() {
        let mut bytes = Vec::new();
        write_midi_events(&[MidiEvent::new(8, &[0x80, 60, 0])], &mut bytes);
        let mut events = Vec::new();
        // Offset 8 in an 8-sample chunk is out of range.
        assert!(read_midi_events(&bytes, 1, 8, &mut events).is_err());
        assert!(read_midi_events(&bytes, 1, 9, &mut events).is_ok());
        assert!(read_midi_events(&bytes[..6], 1, 9, &mut events).is_err());

        let header = AudioChunkHeader::new(1, 4, SampleFormat::F32).with_midi_events(1);
        let mut request = header.to_bytes().to_vec();
        request.extend_from_slice(&[0u8; 16]);
        request.extend_from_slice(&0u32.to_le_bytes());
        request.extend_from_slice(&(MAX_MIDI_EVENT_SIZE + 1).to_le_bytes());
        assert!(header.scan(&request).is_err());
    }

    #[test]
    fn test_transport_position_layout() {
        let position = TransportPosition {
            bpm: 98.5,
            time_in_samples: 96_000,
            ppq_position: 3.25,
            ppq_last_bar_start: 0.0,
            ppq_loop_start: 1.0,
            ppq_loop_end: 9.0,
            time_sig_numerator: 7,
            time_sig_denominator: 8,
            is_playing: true,
            is_recording: false,
            is_looping: true,
        };
        let bytes = position.to_bytes();
        assert_eq!(bytes[52], FLAG_PLAYING | FLAG_LOOPING);
        assert_eq!(TransportPosition::from_bytes(&bytes).unwrap(), position);
        assert_relative_eq!(position.time_in_seconds(48_000.0), 2.0);
        assert!(TransportPosition::from_bytes(&bytes[..40]).is_err());
    }
}
