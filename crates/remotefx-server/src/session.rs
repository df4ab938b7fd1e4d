//! Per-connection session: handshake, worker startup and command dispatch.

use crate::audio_worker::{AudioWorker, AudioWorkerHandle};
use crate::chain::{ProcessorChain, RenderFailure};
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::host::{PluginHost, WindowSystem};
use crate::recents::RecentsRegistry;
use crate::screen_worker::ScreenWorker;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use remotefx_protocol::{
    descriptions_to_lines, write_message, AudioFormat, Handshake, Message, ProtocolError,
    StreamReader,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long the client gets to answer a server request (plugin settings).
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_POLL: Duration = Duration::from_millis(100);
/// Workers blocked writing to a stalled peer are aborted after this long.
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything a session shares with the rest of the process.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<ServerConfig>,
    pub host: Arc<dyn PluginHost>,
    pub windows: Arc<dyn WindowSystem>,
    pub recents: Arc<RecentsRegistry>,
}

impl SessionContext {
    pub fn new(
        config: ServerConfig,
        host: Arc<dyn PluginHost>,
        windows: Arc<dyn WindowSystem>,
    ) -> Self {
        let recents = Arc::new(RecentsRegistry::new(config.num_recents));
        Self {
            config: Arc::new(config),
            host,
            windows,
            recents,
        }
    }
}

/// Requests shutdown of a session from any thread. Idempotent.
#[derive(Clone, Default)]
pub struct SessionHandle {
    shutdown: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

enum Flow {
    Continue,
    Quit,
}

pub struct Session {
    ctx: SessionContext,
    peer_host: String,
    format: AudioFormat,
    chain: Arc<ProcessorChain>,
    screen: Arc<ScreenWorker>,
    audio: AudioWorkerHandle,
    audio_worker: Mutex<Option<AudioWorker>>,
    handle: SessionHandle,
    hide_editor: AtomicBool,
    failures: Receiver<RenderFailure>,
}

impl Session {
    pub fn new(
        ctx: SessionContext,
        peer_host: impl Into<String>,
        format: AudioFormat,
        handle: SessionHandle,
    ) -> Self {
        let chain = Arc::new(ProcessorChain::new(Arc::clone(&ctx.host), format));
        let screen = Arc::new(ScreenWorker::new(
            Arc::clone(&ctx.windows),
            ctx.config.capture_interval(),
            ctx.config.screen_diff_detection,
        ));

        let on_audio_done = handle.clone();
        let audio_worker = AudioWorker::new(Arc::clone(&chain), format, ctx.config.read_timeout())
            .on_complete(move |result| {
                if let Err(e) = result {
                    error!(error = %e, "audio stream failed");
                }
                on_audio_done.shutdown();
            });

        Self {
            peer_host: peer_host.into(),
            format,
            audio: audio_worker.handle(),
            audio_worker: Mutex::new(Some(audio_worker)),
            failures: chain.failures(),
            chain,
            screen,
            handle,
            hide_editor: AtomicBool::new(false),
            ctx,
        }
    }

    /// Read the handshake from a fresh control connection, connect back for
    /// the audio and screen streams, then run until the session ends.
    pub async fn accept(
        ctx: SessionContext,
        mut control: TcpStream,
        peer: SocketAddr,
        handle: SessionHandle,
    ) -> Result<()> {
        let (handshake, audio, screen) = match establish(&mut control, peer).await {
            Ok(streams) => streams,
            Err(e) => {
                warn!(error = %e, "session setup failed");
                return Err(e);
            }
        };
        if handle.is_shutdown() {
            return Ok(());
        }

        Session::new(ctx, peer.ip().to_string(), handshake.format, handle)
            .run(control, audio, screen)
            .await
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn chain(&self) -> &Arc<ProcessorChain> {
        &self.chain
    }

    pub fn screen(&self) -> &Arc<ScreenWorker> {
        &self.screen
    }

    /// Set by `HidePlugin`, cleared by `EditPlugin`; consulted by the
    /// application shell for window visibility.
    pub fn should_hide_editor(&self) -> bool {
        self.hide_editor.load(Ordering::Acquire)
    }

    /// Stop all workers. Safe to call repeatedly and from any thread.
    pub fn shutdown(&self) {
        self.handle.shutdown();
        self.audio.shutdown();
        self.screen.shutdown();
    }

    /// Run the session on already-established streams.
    pub async fn run<C, A, S>(self, control: C, audio: A, screen: S) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let span = info_span!("session", peer = %self.peer_host);
        async move {
            info!(
                channels = self.format.channels,
                rate = self.format.sample_rate,
                block = self.format.block_size,
                double = self.format.sample_format.is_double(),
                "session started"
            );

            let worker = self.audio_worker.lock().take();
            let audio_task = match worker {
                Some(worker) => tokio::spawn(worker.run(audio).in_current_span()),
                None => return Err(ServerError::Config("session already ran".into())),
            };
            let screen_task = tokio::spawn(Arc::clone(&self.screen).run(screen).in_current_span());

            let (read_half, mut write_half) = tokio::io::split(control);
            let mut reader = StreamReader::new(read_half);

            let result = match self.send_plugin_list(&mut write_half).await {
                Ok(()) => self.control_loop(&mut reader, &mut write_half).await,
                Err(e) => Err(e),
            };

            self.shutdown();
            join_worker("screen", screen_task).await;
            join_worker("audio", audio_task).await;
            self.chain.clear();
            let _ = write_half.shutdown().await;

            match &result {
                Ok(()) => info!("session ended"),
                Err(e) => error!(error = %e, "session failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn send_plugin_list<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let plugins: Vec<_> = self
            .ctx
            .host
            .available_plugins()
            .into_iter()
            .filter(|p| !self.ctx.config.is_excluded(&p.identifier))
            .collect();
        debug!(count = plugins.len(), "sending plugin list");
        write_message(writer, &Message::PluginList(descriptions_to_lines(&plugins))).await?;
        Ok(())
    }

    async fn control_loop<R, W>(&self, reader: &mut StreamReader<R>, writer: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let poll = self.ctx.config.read_timeout().min(CONTROL_POLL);
        loop {
            if self.handle.is_shutdown() {
                return Ok(());
            }
            self.forward_failures(writer).await?;

            let msg = match reader.poll_message(poll).await {
                Ok(Some(msg)) => msg,
                Ok(None) => continue,
                Err(ProtocolError::ConnectionClosed) => {
                    info!("client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            if let Flow::Quit = self.dispatch(msg, reader, writer).await? {
                info!("quit requested");
                return Ok(());
            }
        }
    }

    async fn forward_failures<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        while let Ok(failure) = self.failures.try_recv() {
            write_message(
                writer,
                &Message::RenderFailed {
                    index: failure.index as u32,
                    reason: failure.reason,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// One handler per command; anything else from the client is a protocol error.
    async fn dispatch<R, W>(
        &self,
        msg: Message,
        reader: &mut StreamReader<R>,
        writer: &mut W,
    ) -> Result<Flow>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        debug!(kind = msg.name(), "command");
        match msg {
            Message::Quit => return Ok(Flow::Quit),
            Message::AddPlugin { identifier } => self.add_plugin(&identifier, reader, writer).await?,
            Message::DelPlugin { index } => self.del_plugin(index as usize, writer).await?,
            Message::EditPlugin { index } => self.edit_plugin(index as usize),
            Message::HidePlugin => self.hide_plugin(),
            Message::Mouse(ev) => self.screen.mouse_event(&ev),
            Message::Key(codes) => self.screen.key_event(&codes),
            Message::GetPluginSettings { index } => {
                self.get_plugin_settings(index as usize, writer).await?
            }
            Message::BypassPlugin { index } => self.set_bypass(index as usize, true),
            Message::UnbypassPlugin { index } => self.set_bypass(index as usize, false),
            Message::ExchangePlugins { idx_a, idx_b } => {
                self.exchange_plugins(idx_a as usize, idx_b as usize)
            }
            Message::RecentsList(_) => self.recents_list(writer).await?,
            Message::Preset { index, preset } => self.preset(index as usize, preset as usize),
            Message::ParameterValue {
                index,
                param_index,
                value,
            } => self.set_parameter_value(index as usize, param_index as usize, value),
            Message::GetParameterValue { index, param_index } => {
                self.get_parameter_value(index, param_index, writer).await?
            }
            other @ (Message::Result { .. }
            | Message::PluginList(_)
            | Message::ScreenCapture(_)
            | Message::PluginSettings(_)
            | Message::Parameters(_)
            | Message::Presets(_)
            | Message::RenderFailed { .. }) => {
                return Err(ProtocolError::UnexpectedMessage {
                    got: other.name(),
                    expected: "command",
                }
                .into())
            }
        }
        Ok(Flow::Continue)
    }

    async fn add_plugin<R, W>(
        &self,
        identifier: &str,
        reader: &mut StreamReader<R>,
        writer: &mut W,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let index = match self.chain.add(identifier) {
            Ok(index) => index,
            Err(e) => {
                warn!(identifier, error = %e, "failed to add plugin");
                let reply = Message::Result {
                    rc: -1,
                    text: e.to_string(),
                };
                write_message(writer, &reply).await?;
                return Ok(());
            }
        };

        let latency = self.chain.latency_samples();
        let reply = Message::Result {
            rc: latency as i32,
            text: String::new(),
        };
        write_message(writer, &reply).await?;
        let presets = self.chain.presets(index).unwrap_or_default();
        write_message(writer, &Message::Presets(presets)).await?;
        let params = self.chain.parameters(index).unwrap_or_default();
        write_message(writer, &Message::Parameters(params)).await?;

        match reader.read_message(REPLY_TIMEOUT).await? {
            Message::PluginSettings(data) if data.is_empty() => {}
            Message::PluginSettings(data) => {
                if let Err(e) = self.chain.set_state(index, &data) {
                    warn!(identifier, error = %e, "could not restore plugin settings");
                }
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    got: other.name(),
                    expected: "PluginSettings",
                }
                .into())
            }
        }

        if let Some(desc) = self.ctx.host.describe(identifier) {
            self.ctx.recents.add(&self.peer_host, desc);
        }
        info!(identifier, latency, chain = %self.chain.names(), "plugin added");
        Ok(())
    }

    async fn del_plugin<W: AsyncWrite + Unpin>(&self, index: usize, writer: &mut W) -> Result<()> {
        let reply = match self.chain.remove(index) {
            Ok(()) => {
                let latency = self.chain.latency_samples();
                info!(index, latency, chain = %self.chain.names(), "plugin removed");
                Message::Result {
                    rc: latency as i32,
                    text: String::new(),
                }
            }
            Err(e) => {
                warn!(index, error = %e, "failed to remove plugin");
                Message::Result {
                    rc: -1,
                    text: e.to_string(),
                }
            }
        };
        write_message(writer, &reply).await?;
        Ok(())
    }

    fn edit_plugin(&self, index: usize) {
        match self.chain.editor(index) {
            Ok(Some(editor)) => {
                if let Some(previous) = self.screen.editor_index() {
                    debug!(previous, index, "switching editor");
                }
                self.hide_editor.store(false, Ordering::Release);
                self.screen.show_editor(index, &editor);
            }
            Ok(None) => warn!(index, "processor has no editor"),
            Err(e) => warn!(index, error = %e, "cannot edit plugin"),
        }
    }

    fn hide_plugin(&self) {
        self.hide_editor.store(true, Ordering::Release);
        self.screen.hide_editor();
    }

    async fn get_plugin_settings<W: AsyncWrite + Unpin>(
        &self,
        index: usize,
        writer: &mut W,
    ) -> Result<()> {
        let data = self.chain.state(index).unwrap_or_else(|e| {
            warn!(index, error = %e, "cannot read plugin settings");
            Vec::new()
        });
        write_message(writer, &Message::PluginSettings(data)).await?;
        Ok(())
    }

    fn set_bypass(&self, index: usize, bypassed: bool) {
        if let Err(e) = self.chain.set_bypass(index, bypassed) {
            warn!(index, bypassed, error = %e, "cannot change bypass");
        }
    }

    fn exchange_plugins(&self, a: usize, b: usize) {
        match self.chain.exchange(a, b) {
            Ok(()) => info!(a, b, chain = %self.chain.names(), "plugins exchanged"),
            Err(e) => warn!(a, b, error = %e, "cannot exchange plugins"),
        }
    }

    async fn recents_list<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let lines = self.ctx.recents.lines(&self.peer_host);
        write_message(writer, &Message::RecentsList(lines)).await?;
        Ok(())
    }

    fn preset(&self, index: usize, preset: usize) {
        if let Err(e) = self.chain.set_preset(index, preset) {
            warn!(index, preset, error = %e, "cannot select preset");
        }
    }

    fn set_parameter_value(&self, index: usize, param: usize, value: f32) {
        if let Err(e) = self.chain.set_parameter(index, param, value) {
            warn!(index, param, error = %e, "cannot set parameter");
        }
    }

    async fn get_parameter_value<W: AsyncWrite + Unpin>(
        &self,
        index: u32,
        param_index: u32,
        writer: &mut W,
    ) -> Result<()> {
        let value = self
            .chain
            .parameter(index as usize, param_index as usize)
            .unwrap_or_else(|e| {
                warn!(index, param_index, error = %e, "cannot read parameter");
                0.0
            });
        let reply = Message::ParameterValue {
            index,
            param_index,
            value,
        };
        write_message(writer, &reply).await?;
        Ok(())
    }
}

async fn join_worker(name: &'static str, task: JoinHandle<Result<()>>) {
    let abort = task.abort_handle();
    match tokio::time::timeout(WORKER_JOIN_TIMEOUT, task).await {
        Ok(Ok(Err(e))) => debug!(worker = name, error = %e, "worker ended with error"),
        Ok(_) => {}
        Err(_) => {
            warn!(worker = name, "worker stalled on shutdown, aborting");
            abort.abort();
        }
    }
}

async fn establish(
    control: &mut TcpStream,
    peer: SocketAddr,
) -> Result<(Handshake, TcpStream, TcpStream)> {
    control.set_nodelay(true)?;
    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, Handshake::read_from(control))
        .await
        .map_err(|_| ProtocolError::Timeout {
            operation: "handshake",
            duration_ms: HANDSHAKE_TIMEOUT.as_millis() as u64,
        })??;
    debug!(?handshake, "handshake received");

    // Audio first, then screen; the client accepts in that order.
    let client = SocketAddr::new(peer.ip(), handshake.client_port);
    let audio = connect_back(client, "audio").await?;
    let screen = connect_back(client, "screen").await?;
    Ok((handshake, audio, screen))
}

async fn connect_back(addr: SocketAddr, purpose: &'static str) -> Result<TcpStream> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| ProtocolError::Timeout {
            operation: purpose,
            duration_ms: CONNECT_TIMEOUT.as_millis() as u64,
        })??;
    stream.set_nodelay(true)?;
    debug!(%addr, purpose, "connected back to client");
    Ok(stream)
}
