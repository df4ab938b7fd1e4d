//! Ordered, mutable chain of hosted processors.
//!
//! One coarse lock guards the chain: structural changes, parameter access and
//! `process_*` are mutually exclusive. Structural changes are rare compared to
//! per-block rendering, so contention stays low.
//!
//! Latency compensation happens once per block for the whole chain. The chain
//! reports the sum of all entry latencies; entries that did not delay the
//! signal in a given block (bypassed or failed) are made up for by a single
//! delay line at the end, so output is always aligned to the reported value.
//!
//! MIDI and transport state travel through the chain with the samples: every
//! active entry sees the events as the previous entry left them.

use crate::delay::DelayLine;
use crate::error::{RenderError, Result, ServerError};
use crate::host::{AudioBuffer, EditorSurface, PluginHost, Processor};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use remotefx_protocol::{AudioFormat, MidiEvent, ParameterInfo, Sample, TransportPosition};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Samples of silence rendered through a new processor before it joins.
pub const WARMUP_SAMPLES: usize = 8192;

const SLOW_BLOCK: Duration = Duration::from_millis(20);
const FAILURE_QUEUE: usize = 64;

/// Serializes plugin loading across all sessions.
static LOADER_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// A processor failed while rendering a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderFailure {
    pub index: usize,
    pub reason: String,
}

/// Everything that accompanies the samples of one block.
#[derive(Debug, Clone, Default)]
pub struct BlockEvents {
    pub midi: Vec<MidiEvent>,
    pub position: TransportPosition,
}

struct ChainEntry {
    processor: Box<dyn Processor>,
    bypassed: bool,
    failures: u64,
}

struct ChainState {
    entries: Vec<ChainEntry>,
    compensation_f32: DelayLine<f32>,
    compensation_f64: DelayLine<f64>,
    backup_f32: AudioBuffer<f32>,
    backup_f64: AudioBuffer<f64>,
    backup_midi: Vec<MidiEvent>,
    convert: AudioBuffer<f32>,
}

impl ChainState {
    fn check(&self, index: usize) -> Result<()> {
        if index < self.entries.len() {
            Ok(())
        } else {
            Err(ServerError::InvalidIndex {
                index,
                len: self.entries.len(),
            })
        }
    }

    fn latency(&self) -> u32 {
        self.entries
            .iter()
            .map(|e| e.processor.latency_samples())
            .sum()
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Run one render call, turning a panic into a `RenderError`.
fn guarded(f: impl FnOnce() -> std::result::Result<(), RenderError>) -> std::result::Result<(), RenderError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(RenderError::new(panic_reason(payload))),
    }
}

pub struct ProcessorChain {
    host: Arc<dyn PluginHost>,
    format: AudioFormat,
    state: Mutex<ChainState>,
    failures_tx: Sender<RenderFailure>,
    failures_rx: Receiver<RenderFailure>,
}

impl ProcessorChain {
    pub fn new(host: Arc<dyn PluginHost>, format: AudioFormat) -> Self {
        let channels = format.channels as usize;
        let block = format.block_size as usize;
        let (failures_tx, failures_rx) = crossbeam_channel::bounded(FAILURE_QUEUE);
        Self {
            host,
            format,
            state: Mutex::new(ChainState {
                entries: Vec::new(),
                compensation_f32: DelayLine::new(channels, 0),
                compensation_f64: DelayLine::new(channels, 0),
                backup_f32: AudioBuffer::new(channels, block),
                backup_f64: AudioBuffer::new(channels, block),
                backup_midi: Vec::new(),
                convert: AudioBuffer::new(channels, block),
            }),
            failures_tx,
            failures_rx,
        }
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Receiving end of render failure notifications.
    pub fn failures(&self) -> Receiver<RenderFailure> {
        self.failures_rx.clone()
    }

    /// Instantiate, prepare and warm up a processor, then append it.
    /// Returns the new entry's index.
    pub fn add(&self, identifier: &str) -> Result<usize> {
        let sample_rate = self.format.sample_rate;
        let block = self.format.block_size as usize;

        let processor = {
            let _loading = LOADER_LOCK.lock();
            let mut processor = self.host.instantiate(identifier, sample_rate, block)?;
            processor.prepare(sample_rate, block);
            self.warm_up(identifier, processor.as_mut())?;
            processor
        };

        let mut state = self.state.lock();
        state.entries.push(ChainEntry {
            processor,
            bypassed: false,
            failures: 0,
        });
        debug!(identifier, index = state.entries.len() - 1, "processor added");
        Ok(state.entries.len() - 1)
    }

    /// Render silence in the precision the session will mostly use.
    fn warm_up(&self, identifier: &str, processor: &mut dyn Processor) -> Result<()> {
        let result = if self.format.sample_format.is_double() && processor.supports_f64() {
            self.warm_up_with::<f64>(processor, |p, buf| p.process_f64(buf))
        } else {
            self.warm_up_with::<f32>(processor, |p, buf| p.process_f32(buf))
        };
        result.map_err(|e| ServerError::instantiation(identifier, format!("warm-up failed: {}", e)))
    }

    fn warm_up_with<T: Sample>(
        &self,
        processor: &mut dyn Processor,
        mut render: impl FnMut(&mut dyn Processor, &mut AudioBuffer<T>) -> std::result::Result<(), RenderError>,
    ) -> std::result::Result<(), RenderError> {
        let block = self.format.block_size as usize;
        let mut buffer = AudioBuffer::<T>::new(self.format.channels as usize, block);
        let mut rendered = 0;
        while rendered < WARMUP_SAMPLES {
            buffer.clear();
            guarded(|| render(&mut *processor, &mut buffer))?;
            rendered += block;
        }
        Ok(())
    }

    pub fn remove(&self, index: usize) -> Result<()> {
        let mut removed = {
            let mut state = self.state.lock();
            state.check(index)?;
            state.entries.remove(index)
        };
        removed.processor.release_resources();
        Ok(())
    }

    /// Swap two entries. Equal indices are a no-op.
    pub fn exchange(&self, a: usize, b: usize) -> Result<()> {
        let mut state = self.state.lock();
        state.check(a)?;
        state.check(b)?;
        if a != b {
            state.entries.swap(a, b);
        }
        Ok(())
    }

    pub fn clear(&self) {
        let removed = std::mem::take(&mut self.state.lock().entries);
        for mut entry in removed {
            entry.processor.release_resources();
        }
    }

    pub fn size(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Sum of all entry latencies, bypassed ones included.
    pub fn latency_samples(&self) -> u32 {
        self.state.lock().latency()
    }

    /// Run `f` against the processor at `index` under the chain lock.
    pub fn with_processor<R>(&self, index: usize, f: impl FnOnce(&mut dyn Processor) -> R) -> Result<R> {
        let mut state = self.state.lock();
        state.check(index)?;
        Ok(f(state.entries[index].processor.as_mut()))
    }

    pub fn set_bypass(&self, index: usize, bypassed: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.check(index)?;
        state.entries[index].bypassed = bypassed;
        Ok(())
    }

    pub fn is_bypassed(&self, index: usize) -> Result<bool> {
        let state = self.state.lock();
        state.check(index)?;
        Ok(state.entries[index].bypassed)
    }

    /// Render failures seen by the entry at `index`.
    pub fn failure_count(&self, index: usize) -> Result<u64> {
        let state = self.state.lock();
        state.check(index)?;
        Ok(state.entries[index].failures)
    }

    pub fn parameter(&self, index: usize, param: usize) -> Result<f32> {
        self.with_processor(index, |p| {
            p.parameter(param).ok_or(ServerError::InvalidIndex {
                index: param,
                len: p.parameter_count(),
            })
        })?
    }

    pub fn set_parameter(&self, index: usize, param: usize, value: f32) -> Result<()> {
        self.with_processor(index, |p| {
            if p.set_parameter(param, value) {
                Ok(())
            } else {
                Err(ServerError::InvalidIndex {
                    index: param,
                    len: p.parameter_count(),
                })
            }
        })?
    }

    pub fn parameters(&self, index: usize) -> Result<Vec<ParameterInfo>> {
        self.with_processor(index, |p| p.parameters())
    }

    pub fn presets(&self, index: usize) -> Result<Vec<String>> {
        self.with_processor(index, |p| p.presets())
    }

    pub fn set_preset(&self, index: usize, preset: usize) -> Result<()> {
        self.with_processor(index, |p| {
            if p.set_preset(preset) {
                Ok(())
            } else {
                Err(ServerError::InvalidIndex {
                    index: preset,
                    len: p.presets().len(),
                })
            }
        })?
    }

    pub fn state(&self, index: usize) -> Result<Vec<u8>> {
        self.with_processor(index, |p| p.state())
    }

    pub fn set_state(&self, index: usize, data: &[u8]) -> Result<()> {
        self.with_processor(index, |p| p.set_state(data))?
            .map_err(ServerError::from)
    }

    /// The entry's editor, created on first use.
    pub fn editor(&self, index: usize) -> Result<Option<Arc<dyn EditorSurface>>> {
        self.with_processor(index, |p| {
            if p.has_editor() {
                p.create_editor_if_needed()
            } else {
                None
            }
        })
    }

    /// Processor names in chain order, for logging (`a > b > c`).
    pub fn names(&self) -> String {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .map(|e| e.processor.name())
            .collect::<Vec<_>>()
            .join(" > ")
    }

    /// Render one block. Returns the latency the output is aligned to.
    pub fn process_f32(&self, buffer: &mut AudioBuffer<f32>, events: &mut BlockEvents) -> u32 {
        let mut guard = self.state.lock();
        let ChainState {
            entries,
            compensation_f32,
            backup_f32,
            backup_midi,
            ..
        } = &mut *guard;
        let backup = Backup {
            audio: backup_f32,
            midi: backup_midi,
        };
        self.process_with(entries, buffer, events, backup, compensation_f32, |p, buf| {
            p.process_f32(buf)
        })
    }

    /// Processors without native f64 support render a converted f32 copy.
    pub fn process_f64(&self, buffer: &mut AudioBuffer<f64>, events: &mut BlockEvents) -> u32 {
        let mut guard = self.state.lock();
        let ChainState {
            entries,
            compensation_f64,
            backup_f64,
            backup_midi,
            convert,
            ..
        } = &mut *guard;
        let backup = Backup {
            audio: backup_f64,
            midi: backup_midi,
        };
        self.process_with(entries, buffer, events, backup, compensation_f64, |p, buf| {
            if p.supports_f64() {
                return p.process_f64(buf);
            }
            convert.ensure_size(buf.num_channels(), buf.num_samples());
            for ch in 0..buf.num_channels() {
                for (dst, &src) in convert.channel_mut(ch).iter_mut().zip(buf.channel(ch)) {
                    *dst = src as f32;
                }
            }
            p.process_f32(convert)?;
            for ch in 0..buf.num_channels() {
                for (dst, &src) in buf.channel_mut(ch).iter_mut().zip(convert.channel(ch)) {
                    *dst = src as f64;
                }
            }
            Ok(())
        })
    }

    fn process_with<T: Sample>(
        &self,
        entries: &mut [ChainEntry],
        buffer: &mut AudioBuffer<T>,
        events: &mut BlockEvents,
        mut backup: Backup<'_, T>,
        compensation: &mut DelayLine<T>,
        mut render: impl FnMut(&mut dyn Processor, &mut AudioBuffer<T>) -> std::result::Result<(), RenderError>,
    ) -> u32 {
        let start = Instant::now();
        let num_samples = buffer.num_samples();
        let mut reported = 0u32;
        let mut applied = 0u32;

        for (index, entry) in entries.iter_mut().enumerate() {
            let latency = entry.processor.latency_samples();
            reported += latency;
            if entry.bypassed {
                continue;
            }

            backup.audio.copy_from(buffer);
            backup.midi.clone_from(&events.midi);
            let rendered = guarded(|| {
                let processor = entry.processor.as_mut();
                processor.set_transport(&events.position);
                processor.process_midi(&mut events.midi, num_samples);
                render(processor, buffer)
            });
            match rendered {
                Ok(()) => applied += latency,
                Err(err) => {
                    buffer.copy_from(backup.audio);
                    events.midi.clone_from(backup.midi);
                    entry.failures += 1;
                    self.report_failure(index, entry.processor.name(), err);
                }
            }
        }

        compensation.set_delay(reported.saturating_sub(applied) as usize);
        compensation.process(buffer);

        // Processors may emit events past the end of the block.
        let last = num_samples.saturating_sub(1) as u32;
        for event in &mut events.midi {
            event.sample_offset = event.sample_offset.min(last);
        }

        let elapsed = start.elapsed();
        if elapsed > SLOW_BLOCK {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                samples = buffer.num_samples(),
                "slow block"
            );
        }
        reported
    }

    fn report_failure(&self, index: usize, name: &str, err: RenderError) {
        warn!(index, processor = name, reason = %err, "render failed, passing input through");
        let failure = RenderFailure {
            index,
            reason: err.reason,
        };
        if let Err(TrySendError::Full(_)) = self.failures_tx.try_send(failure) {
            debug!(index, "failure queue full, dropping notification");
        }
    }
}

/// Scratch copies restored when an entry fails.
struct Backup<'a, T> {
    audio: &'a mut AudioBuffer<T>,
    midi: &'a mut Vec<MidiEvent>,
}

impl Drop for ProcessorChain {
    fn drop(&mut self) {
        self.clear();
    }
}
