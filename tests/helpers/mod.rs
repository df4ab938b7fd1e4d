//! Test helpers and fixtures for RemoteFX integration tests
//!
//! Every test runs a real server on a loopback port and talks to it through
//! [`TestClient`], which plays the client side of all three streams.

use remotefx::prelude::*;
use remotefx::protocol::audio::{
    read_midi_events, read_planar, write_request, MIDI_EVENT_HEADER_SIZE, RESPONSE_HEADER_SIZE,
};
use remotefx::protocol::{descriptions_from_lines, Sample};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Upper bound for any single reply.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub const TEST_SAMPLE_RATE: f64 = 48000.0;

pub const TEST_BLOCK_SIZE: u32 = 256;

pub fn stereo_format() -> AudioFormat {
    AudioFormat::new(2, TEST_SAMPLE_RATE, TEST_BLOCK_SIZE)
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: ServerHandle,
    pub windows: Arc<HeadlessWindowSystem>,
    pub task: JoinHandle<remotefx::server::Result<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::with_config(ServerConfig::default()).await
    }

    pub async fn with_config(config: ServerConfig) -> Self {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            read_timeout_ms: 20,
            screen_capture_interval_ms: 10,
            ..config
        };
        let windows = Arc::new(HeadlessWindowSystem::new());
        let server = Server::new(config, Arc::new(BuiltinHost::new()), windows.clone())
            .expect("valid test config");
        let handle = server.handle();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(server.serve(listener));
        Self {
            addr,
            handle,
            windows,
            task,
        }
    }

    pub async fn stop(self) {
        self.handle.shutdown();
        tokio::time::timeout(REPLY_TIMEOUT, self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

/// Client side of a session.
pub struct TestClient {
    pub reader: StreamReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
    pub audio: TcpStream,
    pub screen: StreamReader<TcpStream>,
    pub plugins: Vec<PluginDescription>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr, format: AudioFormat) -> Self {
        let callback = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = callback.local_addr().unwrap().port();

        let mut control = TcpStream::connect(addr).await.unwrap();
        Handshake::new(port, format)
            .write_to(&mut control)
            .await
            .unwrap();

        let (audio, _) = tokio::time::timeout(REPLY_TIMEOUT, callback.accept())
            .await
            .expect("no audio connect-back")
            .unwrap();
        let (screen, _) = tokio::time::timeout(REPLY_TIMEOUT, callback.accept())
            .await
            .expect("no screen connect-back")
            .unwrap();

        let (read_half, writer) = control.into_split();
        let mut reader = StreamReader::new(read_half);
        let Message::PluginList(lines) = reader.read_message(REPLY_TIMEOUT).await.unwrap() else {
            panic!("expected PluginList first");
        };

        Self {
            reader,
            writer,
            audio,
            screen: StreamReader::new(screen),
            plugins: descriptions_from_lines(&lines),
        }
    }

    pub async fn send(&mut self, msg: Message) {
        write_message(&mut self.writer, &msg).await.unwrap();
    }

    pub async fn recv(&mut self) -> Message {
        self.reader.read_message(REPLY_TIMEOUT).await.unwrap()
    }

    /// Full AddPlugin exchange. Returns the reported latency, or -1.
    pub async fn add_plugin(&mut self, identifier: &str) -> i32 {
        self.send(Message::AddPlugin {
            identifier: identifier.into(),
        })
        .await;
        let Message::Result { rc, .. } = self.recv().await else {
            panic!("expected Result");
        };
        if rc < 0 {
            return rc;
        }
        assert!(matches!(self.recv().await, Message::Presets(_)));
        assert!(matches!(self.recv().await, Message::Parameters(_)));
        self.send(Message::PluginSettings(Vec::new())).await;
        rc
    }

    /// Send one block and wait for the processed block.
    pub async fn process<T: Sample>(
        &mut self,
        channels: &[Vec<T>],
    ) -> (AudioResponseHeader, Vec<Vec<T>>) {
        let (header, out, _) = self
            .process_events(channels, &[], &TransportPosition::default())
            .await;
        (header, out)
    }

    /// Send one block with MIDI and transport state; returns the processed
    /// block and the MIDI that came out of the chain.
    pub async fn process_events<T: Sample>(
        &mut self,
        channels: &[Vec<T>],
        midi: &[MidiEvent],
        position: &TransportPosition,
    ) -> (AudioResponseHeader, Vec<Vec<T>>, Vec<MidiEvent>) {
        let samples = channels[0].len();
        let mut bytes = Vec::new();
        write_request(channels, samples, midi, position, &mut bytes);
        self.audio.write_all(&bytes).await.unwrap();

        let mut head = [0u8; RESPONSE_HEADER_SIZE];
        tokio::time::timeout(REPLY_TIMEOUT, self.audio.read_exact(&mut head))
            .await
            .expect("no audio response")
            .unwrap();
        let response = AudioResponseHeader::from_bytes(&head).unwrap();
        let mut data = vec![0u8; response.payload_len()];
        self.audio.read_exact(&mut data).await.unwrap();

        let mut out = vec![vec![T::default(); response.samples as usize]; response.channels as usize];
        read_planar(&data, response.samples as usize, &mut out);

        let mut encoded = Vec::new();
        for _ in 0..response.midi_events {
            let start = encoded.len();
            encoded.resize(start + MIDI_EVENT_HEADER_SIZE, 0);
            self.audio.read_exact(&mut encoded[start..]).await.unwrap();
            let size = u32::from_le_bytes(encoded[start + 4..start + 8].try_into().unwrap()) as usize;
            encoded.resize(start + MIDI_EVENT_HEADER_SIZE + size, 0);
            self.audio
                .read_exact(&mut encoded[start + MIDI_EVENT_HEADER_SIZE..])
                .await
                .unwrap();
        }
        let mut events = Vec::new();
        read_midi_events(&encoded, response.midi_events, response.samples, &mut events).unwrap();
        (response, out, events)
    }

    pub async fn next_frame(&mut self) -> ScreenFrame {
        match self.screen.read_message(REPLY_TIMEOUT).await.unwrap() {
            Message::ScreenCapture(frame) => frame,
            other => panic!("unexpected {} on screen stream", other.name()),
        }
    }
}

/// Stream `blocks` blocks of `block` samples with an impulse at sample 0
/// and return the index where it shows up in the left channel.
pub async fn impulse_position(client: &mut TestClient, block: usize, blocks: usize) -> Option<usize> {
    for n in 0..blocks {
        let mut left = vec![0.0f32; block];
        if n == 0 {
            left[0] = 1.0;
        }
        let (_, out) = client.process(&[left, vec![0.0f32; block]]).await;
        if let Some(i) = out[0].iter().position(|&s| s.abs() > 0.5) {
            return Some(n * block + i);
        }
    }
    None
}
