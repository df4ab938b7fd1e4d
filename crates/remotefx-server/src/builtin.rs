//! Built-in processors and a headless window system.
//!
//! These make the server runnable without native plugins:
//!
//! - `builtin:gain` scales the signal (normalized 0.5 is unity).
//! - `builtin:delay` / `builtin:delay:<n>` delays by `n` samples (default 64)
//!   and reports it as latency.
//! - `builtin:invert` flips polarity.
//! - `builtin:transpose` shifts MIDI notes by up to two octaves and leaves
//!   audio untouched.
//!
//! Each one exposes parameters, presets, JSON state and a software-rendered
//! editor that [`HeadlessWindowSystem`] can capture.

use crate::delay::DelayLine;
use crate::error::{CaptureError, RenderError, Result, ServerError, StateError};
use crate::host::{
    AudioBuffer, Bounds, EditorSurface, Frame, Modifiers, PluginHost, Processor, WindowSystem,
};
use parking_lot::Mutex;
use remotefx_protocol::{MidiEvent, MouseEventKind, ParameterInfo, PluginDescription, Sample};
use std::ops::Mul;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

const PREFIX: &str = "builtin:";
const VENDOR: &str = "remotefx";
const FORMAT: &str = "Builtin";

pub const DEFAULT_DELAY_SAMPLES: u32 = 64;
const MAX_DELAY_SAMPLES: u32 = 1 << 20;
const MAX_TRANSPOSE: i32 = 24;

const EDITOR_WIDTH: u32 = 240;
const EDITOR_ROW_HEIGHT: u32 = 24;
const EDITOR_BACKGROUND: u32 = 0xFF20_2020;
const EDITOR_BAR: u32 = 0xFF40_A0FF;
const HEADLESS_BACKGROUND: u32 = 0xFF00_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuiltinKind {
    Gain,
    Delay(u32),
    Invert,
    Transpose,
}

impl BuiltinKind {
    fn parse(identifier: &str) -> Option<Self> {
        let rest = identifier.strip_prefix(PREFIX)?;
        match rest {
            "gain" => Some(BuiltinKind::Gain),
            "invert" => Some(BuiltinKind::Invert),
            "transpose" => Some(BuiltinKind::Transpose),
            "delay" => Some(BuiltinKind::Delay(DEFAULT_DELAY_SAMPLES)),
            _ => {
                let samples: u32 = rest.strip_prefix("delay:")?.parse().ok()?;
                (samples <= MAX_DELAY_SAMPLES).then_some(BuiltinKind::Delay(samples))
            }
        }
    }

    fn name(self) -> String {
        match self {
            BuiltinKind::Gain => "Gain".to_string(),
            BuiltinKind::Delay(n) if n == DEFAULT_DELAY_SAMPLES => "Delay".to_string(),
            BuiltinKind::Delay(n) => format!("Delay ({})", n),
            BuiltinKind::Invert => "Invert".to_string(),
            BuiltinKind::Transpose => "Transpose".to_string(),
        }
    }

    fn identifier(self) -> String {
        match self {
            BuiltinKind::Gain => format!("{PREFIX}gain"),
            BuiltinKind::Delay(n) if n == DEFAULT_DELAY_SAMPLES => format!("{PREFIX}delay"),
            BuiltinKind::Delay(n) => format!("{PREFIX}delay:{n}"),
            BuiltinKind::Invert => format!("{PREFIX}invert"),
            BuiltinKind::Transpose => format!("{PREFIX}transpose"),
        }
    }

    fn description(self) -> PluginDescription {
        PluginDescription::new(self.identifier(), self.name())
            .vendor(VENDOR)
            .format(FORMAT)
    }

    fn parameter_infos(self) -> Vec<ParameterInfo> {
        match self {
            BuiltinKind::Gain => vec![ParameterInfo::new(0, "Gain").label("x2").default_value(0.5)],
            BuiltinKind::Delay(_) => vec![ParameterInfo::new(0, "Level").default_value(1.0)],
            BuiltinKind::Invert => {
                let mut info = ParameterInfo::new(0, "Polarity").default_value(1.0);
                info.num_steps = 2;
                vec![info]
            }
            BuiltinKind::Transpose => {
                vec![ParameterInfo::new(0, "Semitones").label("st").default_value(0.5)]
            }
        }
    }

    fn presets(self) -> &'static [(&'static str, f32)] {
        match self {
            BuiltinKind::Gain => &[("Unity", 0.5), ("Silence", 0.0), ("Boost", 1.0)],
            BuiltinKind::Delay(_) => &[("Full", 1.0), ("Half", 0.5)],
            BuiltinKind::Invert => &[],
            BuiltinKind::Transpose => &[("Octave Down", 0.25), ("None", 0.5), ("Octave Up", 0.75)],
        }
    }
}

/// Parameter values shared between a processor and its editor.
struct ParamBank {
    values: Vec<AtomicU32>,
}

impl ParamBank {
    fn new(infos: &[ParameterInfo]) -> Self {
        Self {
            values: infos
                .iter()
                .map(|i| AtomicU32::new(i.default_value.to_bits()))
                .collect(),
        }
    }

    fn get(&self, index: usize) -> Option<f32> {
        self.values
            .get(index)
            .map(|v| f32::from_bits(v.load(Ordering::Relaxed)))
    }

    fn set(&self, index: usize, value: f32) -> bool {
        match self.values.get(index) {
            Some(v) => {
                v.store(value.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn snapshot(&self) -> Vec<f32> {
        (0..self.values.len())
            .filter_map(|i| self.get(i))
            .collect()
    }
}

/// Editor drawing one horizontal bar per parameter.
pub struct SoftwareEditor {
    bounds: Bounds,
    params: Arc<ParamBank>,
}

impl EditorSurface for SoftwareEditor {
    fn bounds(&self) -> Bounds {
        self.bounds
    }

    fn paint(&self, frame: &mut Frame) {
        frame.pixels.fill(EDITOR_BACKGROUND);
        for (row, value) in self.params.snapshot().into_iter().enumerate() {
            let y = row as u32 * EDITOR_ROW_HEIGHT + 4;
            let width = ((EDITOR_WIDTH - 8) as f32 * value) as u32;
            frame.fill_rect(4, y, width, EDITOR_ROW_HEIGHT - 8, EDITOR_BAR);
        }
    }
}

fn scale<T: Sample + Mul<Output = T> + From<f32>>(buffer: &mut AudioBuffer<T>, gain: f32) {
    let gain = T::from(gain);
    for ch in buffer.channels_mut() {
        for s in ch.iter_mut() {
            *s = *s * gain;
        }
    }
}

pub struct BuiltinProcessor {
    kind: BuiltinKind,
    name: String,
    params: Arc<ParamBank>,
    editor: Option<Arc<SoftwareEditor>>,
    delay_f32: DelayLine<f32>,
    delay_f64: DelayLine<f64>,
}

impl BuiltinProcessor {
    fn new(kind: BuiltinKind) -> Self {
        let delay = match kind {
            BuiltinKind::Delay(n) => n as usize,
            _ => 0,
        };
        Self {
            kind,
            name: kind.name(),
            params: Arc::new(ParamBank::new(&kind.parameter_infos())),
            editor: None,
            delay_f32: DelayLine::new(0, delay),
            delay_f64: DelayLine::new(0, delay),
        }
    }

    fn render<T: Sample + Mul<Output = T> + From<f32>>(
        kind: BuiltinKind,
        params: &ParamBank,
        delay: &mut DelayLine<T>,
        buffer: &mut AudioBuffer<T>,
    ) {
        let value = params.get(0).unwrap_or(1.0);
        match kind {
            BuiltinKind::Gain => scale(buffer, value * 2.0),
            BuiltinKind::Delay(_) => {
                delay.process(buffer);
                scale(buffer, value);
            }
            BuiltinKind::Invert => {
                if value >= 0.5 {
                    scale(buffer, -1.0);
                }
            }
            BuiltinKind::Transpose => {}
        }
    }
}

/// Normalized 0..1 to -24..=24 semitones; 0.5 is no shift.
fn semitones(value: f32) -> i32 {
    ((value - 0.5) * (2 * MAX_TRANSPOSE) as f32).round() as i32
}

impl Processor for BuiltinProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn latency_samples(&self) -> u32 {
        match self.kind {
            BuiltinKind::Delay(n) => n,
            _ => 0,
        }
    }

    fn supports_f64(&self) -> bool {
        true
    }

    fn prepare(&mut self, _sample_rate: f64, _block_size: usize) {
        self.delay_f32.clear();
        self.delay_f64.clear();
    }

    fn process_f32(&mut self, buffer: &mut AudioBuffer<f32>) -> std::result::Result<(), RenderError> {
        Self::render(self.kind, &self.params, &mut self.delay_f32, buffer);
        Ok(())
    }

    fn process_f64(&mut self, buffer: &mut AudioBuffer<f64>) -> std::result::Result<(), RenderError> {
        Self::render(self.kind, &self.params, &mut self.delay_f64, buffer);
        Ok(())
    }

    fn process_midi(&mut self, events: &mut Vec<MidiEvent>, _num_samples: usize) {
        if self.kind != BuiltinKind::Transpose {
            return;
        }
        let shift = semitones(self.params.get(0).unwrap_or(0.5));
        for event in events.iter_mut() {
            // Note off, note on, poly aftertouch
            if let [status, note, ..] = &mut event.data[..] {
                if matches!(*status & 0xF0, 0x80 | 0x90 | 0xA0) {
                    *note = (*note as i32 + shift).clamp(0, 127) as u8;
                }
            }
        }
    }

    fn parameter_count(&self) -> usize {
        self.params.values.len()
    }

    fn parameter(&self, index: usize) -> Option<f32> {
        self.params.get(index)
    }

    fn set_parameter(&mut self, index: usize, value: f32) -> bool {
        self.params.set(index, value)
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        self.kind.parameter_infos()
    }

    fn presets(&self) -> Vec<String> {
        self.kind
            .presets()
            .iter()
            .map(|(name, _)| name.to_string())
            .collect()
    }

    fn set_preset(&mut self, index: usize) -> bool {
        match self.kind.presets().get(index) {
            Some(&(_, value)) => self.params.set(0, value),
            None => false,
        }
    }

    fn state(&self) -> Vec<u8> {
        serde_json::to_vec(&self.params.snapshot()).unwrap_or_default()
    }

    fn set_state(&mut self, data: &[u8]) -> std::result::Result<(), StateError> {
        let values: Vec<f32> =
            serde_json::from_slice(data).map_err(|e| StateError(e.to_string()))?;
        if values.len() != self.params.values.len() {
            return Err(StateError(format!(
                "expected {} values, got {}",
                self.params.values.len(),
                values.len()
            )));
        }
        for (i, v) in values.into_iter().enumerate() {
            self.params.set(i, v);
        }
        Ok(())
    }

    fn has_editor(&self) -> bool {
        true
    }

    fn create_editor_if_needed(&mut self) -> Option<Arc<dyn EditorSurface>> {
        let params = &self.params;
        let rows = params.values.len().max(1) as u32;
        let editor = self.editor.get_or_insert_with(|| {
            Arc::new(SoftwareEditor {
                bounds: Bounds::new(0, 0, EDITOR_WIDTH, rows * EDITOR_ROW_HEIGHT),
                params: Arc::clone(params),
            })
        });
        Some(Arc::clone(editor) as Arc<dyn EditorSurface>)
    }

    fn release_resources(&mut self) {
        self.editor = None;
    }
}

/// Host serving the `builtin:*` processors.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinHost;

impl BuiltinHost {
    pub fn new() -> Self {
        Self
    }
}

impl PluginHost for BuiltinHost {
    fn available_plugins(&self) -> Vec<PluginDescription> {
        [
            BuiltinKind::Gain,
            BuiltinKind::Delay(DEFAULT_DELAY_SAMPLES),
            BuiltinKind::Invert,
            BuiltinKind::Transpose,
        ]
        .into_iter()
        .map(BuiltinKind::description)
        .collect()
    }

    fn instantiate(
        &self,
        identifier: &str,
        _sample_rate: f64,
        _block_size: usize,
    ) -> Result<Box<dyn Processor>> {
        let kind = BuiltinKind::parse(identifier)
            .ok_or_else(|| ServerError::instantiation(identifier, "unknown identifier"))?;
        Ok(Box::new(BuiltinProcessor::new(kind)))
    }

    fn describe(&self, identifier: &str) -> Option<PluginDescription> {
        BuiltinKind::parse(identifier).map(BuiltinKind::description)
    }
}

/// Input event recorded by [`HeadlessWindowSystem`].
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Mouse {
        kind: MouseEventKind,
        x: f32,
        y: f32,
        modifiers: Modifiers,
    },
    Key(Vec<u16>),
}

/// Window system without a display.
///
/// Like a single screen, it shows one editor at a time: showing another
/// editor displaces the current one, and capturing a displaced editor fails.
/// Captures ask the editor to paint itself; synthesized input is recorded for
/// inspection.
#[derive(Default)]
pub struct HeadlessWindowSystem {
    shown: Mutex<Option<Weak<dyn EditorSurface>>>,
    events: Mutex<Vec<InputEvent>>,
}

impl HeadlessWindowSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_events(&self) -> Vec<InputEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    fn is_shown(&self, editor: &Arc<dyn EditorSurface>) -> bool {
        self.shown
            .lock()
            .as_ref()
            .is_some_and(|shown| same_surface(shown, editor))
    }
}

/// Identity by allocation; vtable pointers of the same object may differ.
fn same_surface(shown: &Weak<dyn EditorSurface>, editor: &Arc<dyn EditorSurface>) -> bool {
    Weak::as_ptr(shown) as *const () == Arc::as_ptr(editor) as *const ()
}

impl WindowSystem for HeadlessWindowSystem {
    fn show_editor(&self, editor: &Arc<dyn EditorSurface>) {
        *self.shown.lock() = Some(Arc::downgrade(editor));
    }

    fn hide_editor(&self, editor: &Arc<dyn EditorSurface>) {
        let mut shown = self.shown.lock();
        if shown.as_ref().is_some_and(|s| same_surface(s, editor)) {
            *shown = None;
        }
    }

    fn capture(&self, editor: &Arc<dyn EditorSurface>) -> std::result::Result<Frame, CaptureError> {
        if !self.is_shown(editor) {
            return Err(CaptureError::NotShown);
        }
        let bounds = editor.bounds();
        let mut frame = Frame::new(bounds.width, bounds.height, HEADLESS_BACKGROUND);
        editor.paint(&mut frame);
        Ok(frame)
    }

    fn mouse_event(&self, kind: MouseEventKind, x: f32, y: f32, modifiers: Modifiers) {
        self.events.lock().push(InputEvent::Mouse {
            kind,
            x,
            y,
            modifiers,
        });
    }

    fn key_event(&self, codes: &[u16]) {
        self.events.lock().push(InputEvent::Key(codes.to_vec()));
    }
}
