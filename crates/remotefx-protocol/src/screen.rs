//! Screen frame payload and its run-length pixel codec.
//!
//! Pixels are `0xAARRGGBB` words. A frame carries the full editor size plus
//! the dirty rectangle that changed since the previous frame; `data` holds the
//! rectangle's pixels, row-major, as `(run: u16 LE, pixel: u32 LE)` pairs.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

const RUN_BYTES: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenFrame {
    /// Full editor width in pixels
    pub width: u32,
    /// Full editor height in pixels
    pub height: u32,
    /// Dirty rectangle origin
    pub x: u32,
    pub y: u32,
    pub rect_width: u32,
    pub rect_height: u32,
    /// RLE-encoded pixels of the dirty rectangle
    pub data: Vec<u8>,
}

impl ScreenFrame {
    /// Zero-sized frame telling the client the editor went away.
    pub fn hidden() -> Self {
        Self {
            width: 0,
            height: 0,
            x: 0,
            y: 0,
            rect_width: 0,
            rect_height: 0,
            data: Vec::new(),
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.width == 0 && self.height == 0
    }

    pub fn is_full(&self) -> bool {
        self.x == 0 && self.y == 0 && self.rect_width == self.width && self.rect_height == self.height
    }

    /// Decode the rectangle and paint it into `canvas` (`width * height` pixels).
    pub fn apply_to(&self, canvas: &mut [u32]) -> Result<()> {
        let expected = (self.width as usize) * (self.height as usize);
        if canvas.len() != expected {
            return Err(ProtocolError::Malformed {
                kind: "ScreenCapture",
                reason: format!("canvas holds {} pixels, frame is {}", canvas.len(), expected),
            });
        }
        if self.x + self.rect_width > self.width || self.y + self.rect_height > self.height {
            return Err(ProtocolError::Malformed {
                kind: "ScreenCapture",
                reason: "dirty rectangle outside frame".into(),
            });
        }

        let pixels = rle_decode(&self.data)?;
        let rect_len = (self.rect_width as usize) * (self.rect_height as usize);
        if pixels.len() != rect_len {
            return Err(ProtocolError::Malformed {
                kind: "ScreenCapture",
                reason: format!("decoded {} pixels, rectangle needs {}", pixels.len(), rect_len),
            });
        }

        let rw = self.rect_width as usize;
        for (row, chunk) in pixels.chunks(rw.max(1)).enumerate() {
            let start = (self.y as usize + row) * self.width as usize + self.x as usize;
            canvas[start..start + chunk.len()].copy_from_slice(chunk);
        }
        Ok(())
    }
}

/// Run-length encode pixels as `(run u16, pixel u32)` pairs.
pub fn rle_encode(pixels: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pixels.len().min(4096) * RUN_BYTES);
    let mut iter = pixels.iter().copied();
    let Some(mut current) = iter.next() else {
        return out;
    };
    let mut run: u16 = 1;

    for px in iter {
        if px == current && run < u16::MAX {
            run += 1;
        } else {
            out.extend_from_slice(&run.to_le_bytes());
            out.extend_from_slice(&current.to_le_bytes());
            current = px;
            run = 1;
        }
    }
    out.extend_from_slice(&run.to_le_bytes());
    out.extend_from_slice(&current.to_le_bytes());
    out
}

pub fn rle_decode(data: &[u8]) -> Result<Vec<u32>> {
    if data.len() % RUN_BYTES != 0 {
        return Err(ProtocolError::Malformed {
            kind: "ScreenCapture",
            reason: format!("RLE data length {} is not a multiple of {}", data.len(), RUN_BYTES),
        });
    }
    let mut out = Vec::new();
    for pair in data.chunks_exact(RUN_BYTES) {
        let run = u16::from_le_bytes([pair[0], pair[1]]);
        let px = u32::from_le_bytes([pair[2], pair[3], pair[4], pair[5]]);
        if run == 0 {
            return Err(ProtocolError::Malformed {
                kind: "ScreenCapture",
                reason: "zero-length run".into(),
            });
        }
        out.extend(std::iter::repeat(px).take(run as usize));
    }
    Ok(out)
}
