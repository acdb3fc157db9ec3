//! Queue supervisor: samples `(queue_depth, mem_used, cpu_pct)` every two
//! seconds, drives the memory gate, runs queue maintenance, and scales the
//! worker pool between `Wmin` and `Wmax`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::queue::worker::spawn_worker;
use crate::queue::{JobHandler, JobQueue};

#[derive(Debug, Clone)]
pub struct ScalingConfig {
    pub wmin: usize,
    pub wmax: usize,
    pub qhi: usize,
    pub qlo: usize,
    /// Memory gate threshold, percent of system memory.
    pub mhi_pct: f32,
    /// CPU ceiling for scale-up, percent.
    pub chi_pct: f32,
    pub sample_period: Duration,
    pub idle_scale_down: Duration,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            wmin: 8,
            wmax: 64,
            qhi: 2000,
            qlo: 200,
            mhi_pct: 80.0,
            chi_pct: 85.0,
            sample_period: Duration::from_secs(2),
            idle_scale_down: Duration::from_secs(30),
        }
    }
}

/// Shared busy/idle accounting across the worker pool.
pub struct PoolStats {
    busy: AtomicUsize,
    idle_since: Mutex<Instant>,
}

impl PoolStats {
    pub fn new() -> Self {
        Self {
            busy: AtomicUsize::new(0),
            idle_since: Mutex::new(Instant::now()),
        }
    }

    pub fn begin_job(&self) {
        self.busy.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_job(&self) {
        if self.busy.fetch_sub(1, Ordering::SeqCst) == 1 {
            *self.idle_since.lock().unwrap() = Instant::now();
        }
    }

    /// How long the whole pool has been idle; zero while any job runs.
    pub fn idle_for(&self) -> Duration {
        if self.busy.load(Ordering::SeqCst) > 0 {
            Duration::ZERO
        } else {
            self.idle_since.lock().unwrap().elapsed()
        }
    }
}

impl Default for PoolStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    Up,
    Down,
    Hold,
}

/// Pure scaling rule, one decision per sample.
pub fn scaling_decision(
    depth: usize,
    mem_pct: f32,
    cpu_pct: f32,
    workers: usize,
    idle_for: Duration,
    fatal: bool,
    cfg: &ScalingConfig,
) -> ScaleAction {
    if !fatal
        && depth > cfg.qhi
        && mem_pct < cfg.mhi_pct
        && cpu_pct < cfg.chi_pct
        && workers < cfg.wmax
    {
        ScaleAction::Up
    } else if depth < cfg.qlo && idle_for >= cfg.idle_scale_down && workers > cfg.wmin {
        ScaleAction::Down
    } else {
        ScaleAction::Hold
    }
}

struct WorkerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Supervisor {
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: ScalingConfig,
    stats: Arc<PoolStats>,
    workers: Vec<WorkerHandle>,
    next_index: usize,
}

impl Supervisor {
    pub fn new(queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>, config: ScalingConfig) -> Self {
        Self {
            queue,
            handler,
            config,
            stats: Arc::new(PoolStats::new()),
            workers: Vec::new(),
            next_index: 0,
        }
    }

    fn add_worker(&mut self, shutdown: &CancellationToken) {
        let token = shutdown.child_token();
        let handle = spawn_worker(
            self.next_index,
            self.queue.clone(),
            self.handler.clone(),
            self.stats.clone(),
            token.clone(),
        );
        self.next_index += 1;
        self.workers.push(WorkerHandle { token, handle });
    }

    fn retire_worker(&mut self) {
        if let Some(worker) = self.workers.pop() {
            // The worker finishes its current job, if any, then exits.
            worker.token.cancel();
        }
    }

    /// Runs until `shutdown` fires, then drains the pool.
    pub async fn run(mut self, shutdown: CancellationToken) {
        for _ in 0..self.config.wmin {
            self.add_worker(&shutdown);
        }
        info!("Supervisor started with {} workers", self.workers.len());

        let mut sys = System::new();
        let mut gated = false;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.sample_period) => {}
            }

            sys.refresh_memory();
            sys.refresh_cpu_usage();
            let mem_pct = if sys.total_memory() > 0 {
                sys.used_memory() as f32 / sys.total_memory() as f32 * 100.0
            } else {
                0.0
            };
            let cpu_pct = sys.global_cpu_info().cpu_usage();

            // Memory gate with 10-point hysteresis: refuse new jobs above
            // Mhi, re-open below Mhi − 10.
            if !gated && mem_pct > self.config.mhi_pct {
                warn!("Memory at {mem_pct:.0}%, closing the submission gate");
                gated = true;
                self.queue.set_mem_gate(true);
            } else if gated && mem_pct < self.config.mhi_pct - 10.0 {
                info!("Memory back to {mem_pct:.0}%, reopening submissions");
                gated = false;
                self.queue.set_mem_gate(false);
            }

            self.queue.maintain().await;

            let action = scaling_decision(
                self.queue.depth(),
                mem_pct,
                cpu_pct,
                self.workers.len(),
                self.stats.idle_for(),
                self.queue.fatal(),
                &self.config,
            );
            match action {
                ScaleAction::Up => {
                    self.add_worker(&shutdown);
                    info!("Scaled up to {} workers", self.workers.len());
                }
                ScaleAction::Down => {
                    self.retire_worker();
                    info!("Scaled down to {} workers", self.workers.len());
                }
                ScaleAction::Hold => {}
            }
        }

        info!("Supervisor draining {} workers", self.workers.len());
        for worker in &self.workers {
            worker.token.cancel();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.handle.await;
        }
    }
}
