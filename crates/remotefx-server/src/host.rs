//! Contracts with the host audio-processing and windowing subsystems.
//!
//! The session engine never instantiates plugins, draws editors or touches
//! real windows itself; it goes through these traits.

use crate::error::{CaptureError, RenderError, Result, StateError};
use remotefx_protocol::{
    MidiEvent, MouseEventKind, ParameterInfo, PluginDescription, Sample, TransportPosition,
};
use std::sync::Arc;

/// Planar audio buffer processed in place.
///
/// Channel storage only grows; `ensure_size` reallocates when the channel
/// count changes or a longer block arrives.
#[derive(Debug, Clone, Default)]
pub struct AudioBuffer<T> {
    channels: Vec<Vec<T>>,
    num_samples: usize,
}

impl<T: Sample> AudioBuffer<T> {
    pub fn new(num_channels: usize, num_samples: usize) -> Self {
        Self {
            channels: vec![vec![T::default(); num_samples]; num_channels],
            num_samples,
        }
    }

    pub fn ensure_size(&mut self, num_channels: usize, num_samples: usize) {
        if self.channels.len() != num_channels {
            self.channels = vec![vec![T::default(); num_samples]; num_channels];
        } else if self.channels.first().map_or(0, Vec::len) < num_samples {
            for ch in &mut self.channels {
                ch.resize(num_samples, T::default());
            }
        }
        self.num_samples = num_samples;
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn channel(&self, index: usize) -> &[T] {
        &self.channels[index][..self.num_samples]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [T] {
        let n = self.num_samples;
        &mut self.channels[index][..n]
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut [T]> {
        let n = self.num_samples;
        self.channels.iter_mut().map(move |ch| &mut ch[..n])
    }

    /// Backing storage, each channel at least `num_samples` long.
    pub fn storage(&self) -> &[Vec<T>] {
        &self.channels
    }

    pub fn storage_mut(&mut self) -> &mut [Vec<T>] {
        &mut self.channels
    }

    pub fn copy_from(&mut self, other: &AudioBuffer<T>) {
        self.ensure_size(other.num_channels(), other.num_samples());
        for (dst, src) in self.channels.iter_mut().zip(&other.channels) {
            dst[..other.num_samples].copy_from_slice(&src[..other.num_samples]);
        }
    }

    pub fn clear(&mut self) {
        let n = self.num_samples;
        for ch in &mut self.channels {
            ch[..n].fill(T::default());
        }
    }
}

/// Screen rectangle of an editor, in global coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bounds {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Bounds {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Captured image, `0xAARRGGBB` pixels row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u32>,
}

impl Frame {
    pub fn new(width: u32, height: u32, fill: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![fill; width as usize * height as usize],
        }
    }

    pub fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: u32) {
        let x_end = (x + w).min(self.width);
        let y_end = (y + h).min(self.height);
        for row in y.min(self.height)..y_end {
            let start = (row * self.width) as usize;
            self.pixels[start + x.min(x_end) as usize..start + x_end as usize].fill(color);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Modifiers {
    pub shift: bool,
    pub ctrl: bool,
    pub alt: bool,
}

/// A hosted plugin instance.
pub trait Processor: Send {
    fn name(&self) -> &str;

    fn latency_samples(&self) -> u32;

    fn supports_f64(&self) -> bool {
        false
    }

    fn prepare(&mut self, sample_rate: f64, block_size: usize);

    fn process_f32(&mut self, buffer: &mut AudioBuffer<f32>) -> std::result::Result<(), RenderError>;

    fn process_f64(&mut self, _buffer: &mut AudioBuffer<f64>) -> std::result::Result<(), RenderError> {
        Err(RenderError::new("double precision not supported"))
    }

    /// Runs right before the audio of the same block. Events may be edited,
    /// dropped or added in place; the default passes them through.
    fn process_midi(&mut self, _events: &mut Vec<MidiEvent>, _num_samples: usize) {}

    /// Host transport state for the block about to be rendered.
    fn set_transport(&mut self, _position: &TransportPosition) {}

    fn parameter_count(&self) -> usize;

    /// Normalized 0..1.
    fn parameter(&self, index: usize) -> Option<f32>;

    /// Normalized 0..1. Returns false for an unknown index.
    fn set_parameter(&mut self, index: usize, value: f32) -> bool;

    fn parameters(&self) -> Vec<ParameterInfo>;

    fn presets(&self) -> Vec<String> {
        Vec::new()
    }

    fn set_preset(&mut self, _index: usize) -> bool {
        false
    }

    fn state(&self) -> Vec<u8>;

    fn set_state(&mut self, data: &[u8]) -> std::result::Result<(), StateError>;

    fn has_editor(&self) -> bool;

    /// The processor keeps the only strong reference to its editor.
    fn create_editor_if_needed(&mut self) -> Option<Arc<dyn EditorSurface>>;

    fn release_resources(&mut self) {}
}

/// Instantiates processors by identifier.
pub trait PluginHost: Send + Sync {
    fn available_plugins(&self) -> Vec<PluginDescription>;

    fn instantiate(
        &self,
        identifier: &str,
        sample_rate: f64,
        block_size: usize,
    ) -> Result<Box<dyn Processor>>;

    fn describe(&self, identifier: &str) -> Option<PluginDescription> {
        self.available_plugins()
            .into_iter()
            .find(|d| d.identifier == identifier)
    }
}

/// An on-screen editor owned by a processor.
pub trait EditorSurface: Send + Sync {
    fn bounds(&self) -> Bounds;

    fn local_to_global(&self, x: f32, y: f32) -> (f32, f32) {
        let b = self.bounds();
        (x + b.x as f32, y + b.y as f32)
    }

    /// Draw into `frame` (sized to `bounds()`). Native editors draw to the
    /// screen themselves and leave this empty.
    fn paint(&self, _frame: &mut Frame) {}
}

/// Screen capture and input synthesis.
///
/// One window system serves every session, so capture and hide name the
/// editor they mean. Showing an editor displaces whatever was on screen.
pub trait WindowSystem: Send + Sync {
    fn show_editor(&self, _editor: &Arc<dyn EditorSurface>) {}

    /// Hide `editor` if it is still the one on screen.
    fn hide_editor(&self, _editor: &Arc<dyn EditorSurface>) {}

    /// Capture `editor`. Fails with [`CaptureError::NotShown`] once another
    /// editor took its place.
    fn capture(&self, editor: &Arc<dyn EditorSurface>) -> std::result::Result<Frame, CaptureError>;

    fn mouse_event(&self, kind: MouseEventKind, x: f32, y: f32, modifiers: Modifiers);

    fn key_event(&self, codes: &[u16]);
}
