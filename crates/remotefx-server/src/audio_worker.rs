//! Real-time sample exchange over the audio stream.

use crate::chain::{BlockEvents, ProcessorChain};
use crate::error::{Result, ServerError};
use crate::host::AudioBuffer;
use remotefx_protocol::audio::{
    read_midi_events, read_planar, write_midi_events, write_planar, CHUNK_HEADER_SIZE,
};
use remotefx_protocol::{
    AudioChunkHeader, AudioFormat, AudioResponseHeader, ChunkScan, ProtocolError, Sample,
    SampleFormat, StreamReader, TransportPosition,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tracing::{debug, info};

type CompletionCallback = Box<dyn FnOnce(&Result<()>) + Send + Sync>;

/// Stops a running [`AudioWorker`] from any thread.
#[derive(Clone)]
pub struct AudioWorkerHandle {
    shutdown: Arc<AtomicBool>,
}

impl AudioWorkerHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

pub struct AudioWorker {
    chain: Arc<ProcessorChain>,
    format: AudioFormat,
    read_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    on_complete: Option<CompletionCallback>,
    buffer_f32: AudioBuffer<f32>,
    buffer_f64: AudioBuffer<f64>,
    events: BlockEvents,
    out: Vec<u8>,
}

impl AudioWorker {
    pub fn new(chain: Arc<ProcessorChain>, format: AudioFormat, read_timeout: Duration) -> Self {
        let channels = format.channels as usize;
        let block = format.block_size as usize;
        Self {
            chain,
            format,
            read_timeout,
            shutdown: Arc::new(AtomicBool::new(false)),
            on_complete: None,
            buffer_f32: AudioBuffer::new(channels, block),
            buffer_f64: AudioBuffer::new(channels, block),
            events: BlockEvents::default(),
            out: Vec::new(),
        }
    }

    /// Invoked exactly once when `run` returns.
    pub fn on_complete(mut self, f: impl FnOnce(&Result<()>) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn handle(&self) -> AudioWorkerHandle {
        AudioWorkerHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    pub fn chain(&self) -> &Arc<ProcessorChain> {
        &self.chain
    }

    /// Empty the chain without stopping the worker.
    pub fn clear(&self) {
        self.chain.clear();
    }

    /// Serve the audio stream until it closes, fails, or shutdown is requested.
    pub async fn run<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!(
            channels = self.format.channels,
            rate = self.format.sample_rate,
            block = self.format.block_size,
            "audio worker started"
        );
        let on_complete = self.on_complete.take();
        let result = self.serve(stream).await;
        match &result {
            Ok(()) => info!("audio worker stopped"),
            Err(e) => debug!(error = %e, "audio worker terminated"),
        }
        if let Some(callback) = on_complete {
            callback(&result);
        }
        result
    }

    async fn serve<S>(&mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = StreamReader::new(read_half);

        loop {
            match self.next_chunk(&mut reader).await {
                Ok(Some((header, total))) => {
                    self.process_chunk(header, total, &mut reader, &mut write_half)
                        .await?
                }
                Ok(None) => return Ok(()),
                Err(ServerError::Protocol(ProtocolError::ConnectionClosed)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Wait until `n` bytes are buffered. `false` once shutdown was requested.
    async fn fill<R: AsyncRead + Unpin>(&mut self, reader: &mut StreamReader<R>, n: usize) -> Result<bool> {
        loop {
            if self.stopping() {
                return Ok(false);
            }
            if reader.poll_bytes(n, self.read_timeout).await? {
                return Ok(true);
            }
        }
    }

    /// Wait for a complete request: header, samples, MIDI and transport.
    /// Returns the header and the request's total length, or `None` once
    /// shutdown was requested.
    async fn next_chunk<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut StreamReader<R>,
    ) -> Result<Option<(AudioChunkHeader, usize)>> {
        if !self.fill(reader, CHUNK_HEADER_SIZE).await? {
            return Ok(None);
        }
        let header = AudioChunkHeader::from_bytes(&reader.buffered()[..CHUNK_HEADER_SIZE])?;
        header.validate(&self.format)?;

        loop {
            let needed = match header.scan(reader.buffered())? {
                ChunkScan::Complete(total) => return Ok(Some((header, total))),
                ChunkScan::Need(n) => n,
            };
            if !self.fill(reader, needed).await? {
                return Ok(None);
            }
        }
    }

    async fn process_chunk<R, W>(
        &mut self,
        header: AudioChunkHeader,
        total: usize,
        reader: &mut StreamReader<R>,
        writer: &mut WriteHalf<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncRead + AsyncWrite,
    {
        let channels = header.channels as usize;
        let samples = header.samples as usize;
        let samples_end = CHUNK_HEADER_SIZE + header.payload_len();
        let request = &reader.buffered()[..total];

        let midi_len = read_midi_events(
            &request[samples_end..],
            header.midi_events,
            header.samples,
            &mut self.events.midi,
        )?;
        self.events.position = TransportPosition::from_bytes(&request[samples_end + midi_len..])?;

        let data = &request[CHUNK_HEADER_SIZE..samples_end];
        let chain = &self.chain;
        let events = &mut self.events;
        let latency_samples = match header.sample_format {
            SampleFormat::F32 => {
                load(&mut self.buffer_f32, data, channels, samples);
                chain.process_f32(&mut self.buffer_f32, events)
            }
            SampleFormat::F64 => {
                load(&mut self.buffer_f64, data, channels, samples);
                chain.process_f64(&mut self.buffer_f64, events)
            }
        };
        reader.consume(total);

        let response = AudioResponseHeader {
            channels: header.channels,
            samples: header.samples,
            latency_samples,
            sample_format: header.sample_format,
            midi_events: self.events.midi.len() as u32,
        };
        self.out.clear();
        self.out.extend_from_slice(&response.to_bytes());
        match header.sample_format {
            SampleFormat::F32 => write_planar(self.buffer_f32.storage(), samples, &mut self.out),
            SampleFormat::F64 => write_planar(self.buffer_f64.storage(), samples, &mut self.out),
        }
        write_midi_events(&self.events.midi, &mut self.out);

        writer.write_all(&self.out).await?;
        writer.flush().await?;
        Ok(())
    }
}

fn load<T: Sample>(buffer: &mut AudioBuffer<T>, data: &[u8], channels: usize, samples: usize) {
    buffer.ensure_size(channels, samples);
    read_planar(data, samples, buffer.storage_mut());
}
