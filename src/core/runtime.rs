//! Runtime orchestration.
//!
//! Builds the broker state out of a validated configuration, opens storage,
//! and binds the MQTT listener. The returned handle exposes the bound
//! address (useful with an ephemeral port) and a graceful shutdown.

use crate::core::config::Config;
use crate::mqtt::{MqttListener, MqttServer};
use anyhow::{Context, Result};
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub struct Runtime;

impl Runtime {
    pub async fn start(config: Config) -> Result<RuntimeHandle> {
        config.validate()?;
        fs::create_dir_all(&config.storage.data_dir).with_context(|| {
            format!(
                "create data directory {}",
                config.storage.data_dir.display()
            )
        })?;
        let server = Arc::new(MqttServer::new(&config)?);
        let listener = MqttListener::bind(&config.mqtt, Arc::clone(&server)).await?;
        info!("photon runtime started");
        Ok(RuntimeHandle { server, listener })
    }
}

pub struct RuntimeHandle {
    server: Arc<MqttServer>,
    listener: MqttListener,
}

impl RuntimeHandle {
    pub fn mqtt_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn server(&self) -> &Arc<MqttServer> {
        &self.server
    }

    pub async fn shutdown(self) {
        self.listener.shutdown().await;
        info!("photon runtime stopped");
    }
}
