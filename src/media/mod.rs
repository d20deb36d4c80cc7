#![forbid(unsafe_code)]

// Media module - engine capability traits and the mediasoup backend
// Rooms talk to the engine only through the traits in `engine`.

pub mod backend;
pub mod config;
pub mod engine;
pub mod types;
pub mod worker_manager;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{MediaConfig, RouterConfig, WebRtcTransportConfig, WorkerConfig};
pub use engine::{
    CloseCallback, MediaConsumer, MediaEngine, MediaProducer, MediaRouter, MediaTransport,
    Subscription,
};
pub use types::{ConsumerInfo, MediaError, MediaResult, ProduceParams, ProducerInfo, TransportInfo};
pub use worker_manager::WorkerManager;

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

/// Process-wide media context shared by every room
#[derive(Clone)]
pub struct MediaServer {
    engine: Arc<dyn MediaEngine>,
    worker_manager: Option<Arc<WorkerManager>>,
    config: Arc<MediaConfig>,
}

impl MediaServer {
    /// Spawns the configured mediasoup workers
    pub async fn new(config: MediaConfig) -> Result<Self> {
        info!(
            "Initializing MediaServer with {} workers",
            config.worker_config.num_workers
        );

        let config = Arc::new(config);
        let worker_manager = Arc::new(WorkerManager::new(config.clone()).await?);

        Ok(Self {
            engine: worker_manager.clone(),
            worker_manager: Some(worker_manager),
            config,
        })
    }

    /// Wraps an arbitrary engine implementation
    pub fn with_engine(engine: Arc<dyn MediaEngine>, config: MediaConfig) -> Self {
        Self {
            engine,
            worker_manager: None,
            config: Arc::new(config),
        }
    }

    /// Creates a router for a room with the configured codec set
    pub async fn create_router(&self, room_name: &str) -> MediaResult<Arc<dyn MediaRouter>> {
        debug!("Creating router for room: {}", room_name);
        self.engine.create_router(&self.config.router_config).await
    }

    /// Stops the worker pool. Rooms must be closed first.
    pub async fn shutdown(&self) {
        info!("Shutting down MediaServer");
        if let Some(worker_manager) = &self.worker_manager {
            worker_manager.shutdown().await;
        }
        info!("MediaServer shutdown complete");
    }
}
