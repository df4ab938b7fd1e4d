//! TCP listener that runs one [`Session`] per client.

use crate::config::ServerConfig;
use crate::error::Result;
use crate::host::{PluginHost, WindowSystem};
use crate::session::{Session, SessionContext, SessionHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Default)]
struct ShutdownSignal {
    flag: AtomicBool,
    notify: Notify,
}

/// Stops a running [`Server`] and every session it spawned.
#[derive(Clone)]
pub struct ServerHandle {
    signal: Arc<ShutdownSignal>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        if !self.signal.flag.swap(true, Ordering::AcqRel) {
            self.signal.notify.notify_one();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.signal.flag.load(Ordering::Acquire)
    }
}

pub struct Server {
    ctx: SessionContext,
    signal: Arc<ShutdownSignal>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        host: Arc<dyn PluginHost>,
        windows: Arc<dyn WindowSystem>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ctx: SessionContext::new(config, host, windows),
            signal: Arc::new(ShutdownSignal::default()),
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            signal: Arc::clone(&self.signal),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        Ok(TcpListener::bind(self.ctx.config.listen_addr()).await?)
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, server_id = self.ctx.config.server_id, "listening");

        let mut sessions: Vec<(SessionHandle, JoinHandle<()>)> = Vec::new();
        while !self.signal.flag.load(Ordering::Acquire) {
            let (stream, peer) = tokio::select! {
                _ = self.signal.notify.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            sessions.retain(|(_, task)| !task.is_finished());
            let handle = SessionHandle::new();
            let session_handle = handle.clone();
            let ctx = self.ctx.clone();
            let task = tokio::spawn(
                async move {
                    if let Err(e) = Session::accept(ctx, stream, peer, session_handle).await {
                        debug!(error = %e, "connection closed with error");
                    }
                }
                .instrument(info_span!("connection", %peer)),
            );
            sessions.push((handle, task));
            info!(%peer, active = sessions.len(), "client connected");
        }

        info!(count = sessions.len(), "stopping sessions");
        for (handle, _) in &sessions {
            handle.shutdown();
        }
        for (_, task) in sessions {
            let _ = task.await;
        }
        info!("server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{BuiltinHost, HeadlessWindowSystem};
    use crate::error::ServerError;
    use std::time::Duration;

    fn server(config: ServerConfig) -> Result<Server> {
        Server::new(
            config,
            Arc::new(BuiltinHost),
            Arc::new(HeadlessWindowSystem::new()),
        )
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = server(ServerConfig {
            screen_capture_interval_ms: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[test]
    fn test_shared_recents_capacity() {
        let s = server(ServerConfig {
            num_recents: 3,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(s.context().recents.capacity(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let s = server(ServerConfig::default()).unwrap();
        let handle = s.handle();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let task = tokio::spawn(s.serve(listener));

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown();
        handle.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
        assert!(handle.is_shutdown());
    }

    #[tokio::test]
    async fn test_shutdown_before_serve() {
        let s = server(ServerConfig::default()).unwrap();
        s.handle().shutdown();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), s.serve(listener))
            .await
            .unwrap()
            .unwrap();
    }
}
