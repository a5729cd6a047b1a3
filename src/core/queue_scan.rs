//! Background expiry of in-flight and deferred messages.
//!
//! Every scan interval a random sample of channels is handed to a pool of
//! workers, each of which processes the in-flight and deferred deadlines of
//! the channel it was given. A cycle whose sample was mostly dirty is
//! repeated straight away. The channel list and the pool size are only
//! recomputed on the slower refresh interval.

use std::sync::Arc;
use std::time::Instant;

use rand::seq::index::sample;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::config::Options;
use crate::core::channel::Channel;
use crate::core::topics::TopicRegistry;

/// Grow by one while the sample is dirtier than `threshold`, otherwise
/// shrink by one, staying within `1..=max`.
pub fn next_pool_size(current: usize, dirty_ratio: f64, threshold: f64, max: usize) -> usize {
    let max = max.max(1);
    let target = if dirty_ratio > threshold {
        current.saturating_add(1)
    } else {
        current.saturating_sub(1)
    };
    target.clamp(1, max)
}

/// Run both expiry sweeps for one channel; true if anything expired.
pub fn scan_channel(channel: &Channel, now: Instant) -> bool {
    let in_flight = channel.process_in_flight_queue(now);
    let deferred = channel.process_deferred_queue(now);
    in_flight || deferred
}

#[derive(Debug)]
pub struct QueueScanner {
    registry: Arc<TopicRegistry>,
    options: Arc<Options>,
}

struct Pool {
    work_tx: flume::Sender<Arc<Channel>>,
    work_rx: flume::Receiver<Arc<Channel>>,
    resp_tx: flume::Sender<bool>,
    resp_rx: flume::Receiver<bool>,
    close_tx: flume::Sender<()>,
    close_rx: flume::Receiver<()>,
    workers: JoinSet<()>,
    size: usize,
}

impl Pool {
    fn new() -> Self {
        let (work_tx, work_rx) = flume::unbounded();
        let (resp_tx, resp_rx) = flume::unbounded();
        let (close_tx, close_rx) = flume::unbounded();
        Self {
            work_tx,
            work_rx,
            resp_tx,
            resp_rx,
            close_tx,
            close_rx,
            workers: JoinSet::new(),
            size: 0,
        }
    }

    fn resize(&mut self, target: usize) {
        while self.size < target {
            let work = self.work_rx.clone();
            let resp = self.resp_tx.clone();
            let close = self.close_rx.clone();
            self.workers.spawn(scan_worker(work, resp, close));
            self.size += 1;
        }
        while self.size > target {
            if self.close_tx.send(()).is_err() {
                break;
            }
            self.size -= 1;
        }
    }

    async fn shutdown(mut self) {
        for _ in 0..self.size {
            let _ = self.close_tx.send(());
        }
        drop(self.work_tx);
        while self.workers.join_next().await.is_some() {}
    }
}

async fn scan_worker(
    work: flume::Receiver<Arc<Channel>>,
    resp: flume::Sender<bool>,
    close: flume::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = close.recv_async() => return,
            job = work.recv_async() => {
                let Ok(channel) = job else { return };
                let dirty = scan_channel(&channel, Instant::now());
                if resp.send_async(dirty).await.is_err() {
                    return;
                }
            }
        }
    }
}

impl QueueScanner {
    pub fn new(registry: Arc<TopicRegistry>, options: Arc<Options>) -> Self {
        Self { registry, options }
    }

    /// Scan until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut scan_tick = interval(self.options.queue_scan_interval());
        scan_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh_tick = interval(self.options.queue_scan_refresh_interval());
        refresh_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let max_workers = self.options.queue_scan_worker_pool_max;
        let threshold = self.options.queue_scan_dirty_percent;
        let mut pool = Pool::new();
        pool.resize(1);

        let mut channels = self.registry.all_channels();
        let mut last_dirty_ratio = 0.0;

        info!(target: "rillmq::scan", max_workers, "queue scan loop started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = refresh_tick.tick() => {
                    channels = self.registry.all_channels();
                    let target = next_pool_size(pool.size, last_dirty_ratio, threshold, max_workers);
                    if target != pool.size {
                        debug!(
                            target: "rillmq::scan",
                            from = pool.size,
                            to = target,
                            dirty_ratio = last_dirty_ratio,
                            "resizing scan worker pool"
                        );
                    }
                    pool.resize(target);
                }
                _ = scan_tick.tick() => {
                    if channels.is_empty() {
                        continue;
                    }
                    if let Some(ratio) = self.scan_cycle(&pool, &channels, &shutdown).await {
                        last_dirty_ratio = ratio;
                    } else {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }

        pool.shutdown().await;
        info!(target: "rillmq::scan", "queue scan loop stopped");
    }

    /// Returns the highest dirty ratio seen across the cycle's samples, or
    /// `None` if the pool is gone.
    async fn scan_cycle(
        &self,
        pool: &Pool,
        channels: &[Arc<Channel>],
        shutdown: &watch::Receiver<bool>,
    ) -> Option<f64> {
        let count = self.options.queue_scan_selection_count.min(channels.len());
        let mut peak = 0.0_f64;
        loop {
            let picked: Vec<usize> = {
                let mut rng = rand::thread_rng();
                sample(&mut rng, channels.len(), count).into_vec()
            };
            for idx in picked {
                pool.work_tx
                    .send_async(Arc::clone(&channels[idx]))
                    .await
                    .ok()?;
            }

            let mut dirty = 0usize;
            for _ in 0..count {
                if pool.resp_rx.recv_async().await.ok()? {
                    dirty += 1;
                }
            }

            let ratio = dirty as f64 / count as f64;
            peak = peak.max(ratio);
            trace!(target: "rillmq::scan", sampled = count, dirty, "scan cycle");
            if ratio <= self.options.queue_scan_dirty_percent || *shutdown.borrow() {
                return Some(peak);
            }
        }
    }
}
