//! Multichannel delay line for latency compensation.

use crate::host::AudioBuffer;
use remotefx_protocol::Sample;

/// Circular per-channel delay sharing a single write position.
///
/// Each buffer is exactly `delay_samples` long, so the read position always
/// equals the write position.
pub struct DelayLine<T> {
    lines: Vec<Vec<T>>,
    write_pos: usize,
    delay_samples: usize,
}

impl<T: Sample> DelayLine<T> {
    pub fn new(num_channels: usize, delay_samples: usize) -> Self {
        Self {
            lines: vec![vec![T::default(); delay_samples.max(1)]; num_channels],
            write_pos: 0,
            delay_samples,
        }
    }

    pub fn delay_samples(&self) -> usize {
        self.delay_samples
    }

    /// Change the delay. Clears history when it actually changes.
    pub fn set_delay(&mut self, delay_samples: usize) {
        if delay_samples == self.delay_samples {
            return;
        }
        self.delay_samples = delay_samples;
        for line in &mut self.lines {
            line.resize(delay_samples.max(1), T::default());
        }
        self.clear();
    }

    pub fn clear(&mut self) {
        for line in &mut self.lines {
            line.fill(T::default());
        }
        self.write_pos = 0;
    }

    pub fn process(&mut self, buffer: &mut AudioBuffer<T>) {
        if self.delay_samples == 0 {
            return;
        }
        if self.lines.len() != buffer.num_channels() {
            self.lines = vec![vec![T::default(); self.delay_samples]; buffer.num_channels()];
            self.write_pos = 0;
        }

        let len = self.delay_samples;
        let nframes = buffer.num_samples();
        for (line, samples) in self.lines.iter_mut().zip(buffer.channels_mut()) {
            let mut pos = self.write_pos;
            for s in samples.iter_mut() {
                let delayed = line[pos];
                line[pos] = *s;
                *s = delayed;
                pos += 1;
                if pos == len {
                    pos = 0;
                }
            }
        }
        self.write_pos = (self.write_pos + nframes) % len;
    }
}
