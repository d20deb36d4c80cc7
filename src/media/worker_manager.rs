#![forbid(unsafe_code)]

// Worker pool management for mediasoup

use crate::media::backend::MediasoupRouter;
use crate::media::config::{MediaConfig, RouterConfig, WorkerConfig};
use crate::media::engine::{MediaEngine, MediaRouter};
use crate::media::types::{MediaError, MediaResult};
use anyhow::Result;
use async_trait::async_trait;
use mediasoup::prelude::*;
use mediasoup::worker::WorkerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Manages a pool of mediasoup Workers and places routers on them
pub struct WorkerManager {
    workers: RwLock<Vec<Worker>>,
    router_counts: Arc<std::sync::RwLock<HashMap<WorkerId, Arc<AtomicUsize>>>>,
    config: Arc<MediaConfig>,
    _mediasoup_worker_manager: mediasoup::worker_manager::WorkerManager,
}

impl WorkerManager {
    /// Creates a new `WorkerManager` and spawns all configured workers
    ///
    /// # Errors
    /// Returns an error if any worker fails to start
    pub async fn new(config: Arc<MediaConfig>) -> Result<Self> {
        let num_workers = config.worker_config.num_workers.max(1);
        info!("Creating WorkerManager with {} workers", num_workers);

        let mediasoup_worker_manager = mediasoup::worker_manager::WorkerManager::new();
        let mut workers = Vec::with_capacity(num_workers);
        let mut router_counts = HashMap::new();

        for i in 0..num_workers {
            let worker =
                Self::create_worker(&config.worker_config, &mediasoup_worker_manager).await?;
            info!("Created worker {} with id: {}", i, worker.id());

            Self::setup_worker_handlers(&worker, i);
            router_counts.insert(worker.id(), Arc::new(AtomicUsize::new(0)));
            workers.push(worker);
        }

        Ok(Self {
            workers: RwLock::new(workers),
            router_counts: Arc::new(std::sync::RwLock::new(router_counts)),
            config,
            _mediasoup_worker_manager: mediasoup_worker_manager,
        })
    }

    async fn create_worker(
        config: &WorkerConfig,
        manager: &mediasoup::worker_manager::WorkerManager,
    ) -> MediaResult<Worker> {
        manager
            .create_worker(config.to_worker_settings())
            .await
            .map_err(|e| MediaError::EngineFailure(format!("Failed to create worker: {e}")))
    }

    fn setup_worker_handlers(worker: &Worker, worker_index: usize) {
        let worker_id = worker.id();

        worker
            .on_dead(move |reason| {
                error!("Worker {} (index {}) died: {:?}", worker_id, worker_index, reason);
            })
            .detach();
    }

    /// Picks the worker hosting the fewest routers
    async fn least_loaded_worker(&self) -> MediaResult<(Worker, Arc<AtomicUsize>)> {
        let workers = self.workers.read().await;
        let counts = self.router_counts.read().unwrap_or_else(|e| e.into_inner());

        workers
            .iter()
            .filter(|w| !w.closed())
            .filter_map(|w| counts.get(&w.id()).map(|c| (w, Arc::clone(c))))
            .min_by_key(|(_, c)| c.load(Ordering::Relaxed))
            .map(|(w, c)| (w.clone(), c))
            .ok_or_else(|| MediaError::EngineFailure("No live workers available".to_string()))
    }

    /// Number of routers currently hosted per worker
    pub fn load_distribution(&self) -> HashMap<WorkerId, usize> {
        let counts = self.router_counts.read().unwrap_or_else(|e| e.into_inner());
        counts
            .iter()
            .map(|(id, c)| (*id, c.load(Ordering::Relaxed)))
            .collect()
    }

    /// Drops every worker; routers still alive are closed by mediasoup
    pub async fn shutdown(&self) {
        info!("Shutting down all workers");
        let mut workers = self.workers.write().await;
        workers.clear();
        self.router_counts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        info!("All workers shut down");
    }
}

#[async_trait]
impl MediaEngine for WorkerManager {
    async fn create_router(&self, config: &RouterConfig) -> MediaResult<Arc<dyn MediaRouter>> {
        let (worker, router_count) = self.least_loaded_worker().await?;

        let router = worker
            .create_router(config.to_router_options())
            .await
            .map_err(|e| MediaError::EngineFailure(format!("Failed to create router: {e}")))?;

        router_count.fetch_add(1, Ordering::Relaxed);
        let worker_id = worker.id();
        router
            .on_close(move || {
                router_count.fetch_sub(1, Ordering::Relaxed);
                debug!("Router closed on worker {}", worker_id);
            })
            .detach();
        router
            .on_worker_close(move || {
                warn!("Worker {} closed underneath a router", worker_id);
            })
            .detach();

        info!("Created router {} on worker {}", router.id(), worker.id());
        Ok(Arc::new(MediasoupRouter::new(
            router,
            self.config.webrtc_transport_config.clone(),
        )))
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        debug!("WorkerManager being dropped");
    }
}
