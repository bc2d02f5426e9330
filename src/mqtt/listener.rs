//! MQTT TCP listener.

use crate::core::config::MqttConfig;
use crate::mqtt::dispatch::MqttServer;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct MqttListener {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl MqttListener {
    /// Bind the configured address and start accepting connections, one
    /// read/write task pair per client.
    pub async fn bind(cfg: &MqttConfig, server: Arc<MqttServer>) -> Result<Self> {
        let listener = TcpListener::bind((cfg.host.as_str(), cfg.port))
            .await
            .with_context(|| format!("unable to listen for MQTT connections on {}:{}", cfg.host, cfg.port))?;
        let local_addr = listener.local_addr()?;
        info!("listening for MQTT clients on mqtt://{local_addr}");
        let (shutdown, mut shutdown_rx) = oneshot::channel();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer)) => {
                            if let Err(err) = socket.set_nodelay(true) {
                                warn!(%peer, "failed to set nodelay: {err}");
                            }
                            tokio::spawn(Arc::clone(&server).handle_connection(socket, peer));
                        }
                        Err(err) => {
                            warn!("accept failed: {err}");
                        }
                    },
                }
            }
        });
        Ok(Self {
            local_addr,
            shutdown,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections. Established connections wind down on
    /// their own close paths.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.accept_task.await;
    }
}
