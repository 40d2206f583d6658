//! Worker Pool Manager: one worker per enumerated device.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::time::Duration;

use crate::config::CoordinatorAddr;
use crate::device::DeviceCatalog;
use crate::process::{Launcher, WorkerHandle};

pub struct WorkerPool {
    catalog: Box<dyn DeviceCatalog>,
    launcher: Box<dyn Launcher>,
    workers: Vec<Box<dyn WorkerHandle>>,
    shutdown_grace: Duration,
    active: bool,
}

impl WorkerPool {
    pub fn new(
        catalog: Box<dyn DeviceCatalog>,
        launcher: Box<dyn Launcher>,
        shutdown_grace: Duration,
    ) -> Self {
        Self { catalog, launcher, workers: Vec::new(), shutdown_grace, active: false }
    }

    /// Enumerate devices and start one worker per device, in device order.
    /// If any worker fails to start, those already started are stopped.
    pub async fn start(&mut self, coordinator: &CoordinatorAddr) -> Result<()> {
        let devices = self.catalog.enumerate().await.context("Device enumeration failed")?;
        if devices.is_empty() {
            anyhow::bail!("No compute devices found");
        }
        tracing::info!(devices = devices.len(), %coordinator, "Starting workers");

        for device in &devices {
            match self.launcher.launch(device, coordinator) {
                Ok(worker) => {
                    tracing::info!(
                        platform = device.platform_index,
                        device = device.device_index,
                        name = %device.name,
                        "Worker started"
                    );
                    self.workers.push(worker);
                }
                Err(e) => {
                    self.stop().await;
                    return Err(e);
                }
            }
        }
        self.active = true;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// True only while the pool is active and every worker is alive.
    pub fn is_alive(&mut self) -> bool {
        self.active && !self.workers.is_empty() && self.workers.iter_mut().all(|w| w.is_alive())
    }

    /// Terminate every worker and forget them. The pool may be started again.
    pub async fn stop(&mut self) {
        if self.is_empty() {
            return;
        }
        let grace = self.shutdown_grace;
        let workers = std::mem::take(&mut self.workers);
        tracing::info!(workers = workers.len(), "Stopping workers");
        join_all(workers.into_iter().map(|mut worker| async move {
            let alive = worker.is_alive();
            tracing::debug!(device = %worker.device().name, alive, "Terminating worker");
            worker.terminate(grace).await;
        }))
        .await;
    }

    pub async fn shutdown(&mut self) {
        self.stop().await;
        self.active = false;
    }
}
