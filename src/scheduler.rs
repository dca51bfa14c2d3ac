//! Periodic collection into the local cache.

use futures::future::join_all;
use pattoo_agent_collector::{
    Batch,
    DeviceCollector,
    MetricTable,
};
use pattoo_agent_spool::LocalCache;
use std::{
    sync::Arc,
    time::Duration,
};
use strum::Display;
use tokio::{
    sync::Notify,
    time::{
        Instant,
        MissedTickBehavior,
    },
};
use tokio_util::sync::CancellationToken;

const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerState {
    Idle,
    Collecting,
    Caching,
    Forwarding,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub cycles: u64,
    /// Ticks that fell inside a running cycle.
    pub skipped_ticks: u64,
    pub empty_batches: u64,
    pub cache_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Cached { sequence_id: u64, points: usize },
    Empty,
    CacheFailed,
}

pub struct SchedulerLoop {
    collectors: Vec<Arc<dyn DeviceCollector>>,
    cache: LocalCache,
    wake: Arc<Notify>,
    agent_id: String,
    interval: Duration,
    state: SchedulerState,
    stats: SchedulerStats,
}

impl SchedulerLoop {
    /// `wake` is notified after every cached batch. An interval of zero is
    /// raised to one second.
    pub fn new(
        collectors: Vec<Arc<dyn DeviceCollector>>,
        cache: LocalCache,
        wake: Arc<Notify>,
        agent_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        if interval < MIN_INTERVAL {
            warn!(?interval, "poll interval too short, using {MIN_INTERVAL:?}");
        }
        Self {
            collectors,
            cache,
            wake,
            agent_id: agent_id.into(),
            interval: interval.max(MIN_INTERVAL),
            state: SchedulerState::Idle,
            stats: SchedulerStats::default(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Runs one cycle per tick until `cancel`. Cycles never overlap: a tick
    /// that fires while a cycle runs is skipped. A cycle in progress when
    /// `cancel` fires still writes what it collected.
    #[instrument(level = "debug", skip_all, fields(interval = ?self.interval))]
    pub async fn run(mut self, cancel: CancellationToken) -> SchedulerStats {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_tick: Option<Instant> = None;
        let mut busy_until: Option<Instant> = None;

        loop {
            let tick = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                tick = ticker.tick() => tick,
            };

            // a deadline that passed while the last cycle ran
            if busy_until.is_some_and(|end| tick < end) {
                continue;
            }

            if let Some(previous) = last_tick {
                let missed = ((tick - previous).as_nanos() / self.interval.as_nanos()).saturating_sub(1) as u64;
                if missed > 0 {
                    self.stats.skipped_ticks += missed;
                    warn!(missed, "collection took longer than the poll interval, ticks skipped");
                }
            }
            last_tick = Some(tick);

            self.run_cycle(&cancel).await;
            busy_until = Some(Instant::now());
        }

        self.state = SchedulerState::Idle;
        info!(
            cycles = self.stats.cycles,
            skipped_ticks = self.stats.skipped_ticks,
            "scheduler stopped"
        );
        self.stats
    }

    /// Collects every target once, caches the result and wakes the forwarder.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleOutcome {
        self.stats.cycles += 1;
        let started = Instant::now();

        self.state = SchedulerState::Collecting;
        let table = self.collect(cancel).await;

        let outcome = if table.is_empty() {
            self.stats.empty_batches += 1;
            info!("no metrics collected this cycle");
            CycleOutcome::Empty
        } else {
            self.state = SchedulerState::Caching;
            let points = table.len();
            let batch = Batch::new(self.agent_id.clone(), table);
            match self.cache.blocking(move |cache| cache.enqueue(batch)).await {
                Ok(entry) => {
                    self.state = SchedulerState::Forwarding;
                    self.wake.notify_one();
                    CycleOutcome::Cached {
                        sequence_id: entry.sequence_id,
                        points,
                    }
                }
                Err(err) => {
                    self.stats.cache_failures += 1;
                    error!(%err, points, "failed to cache batch, it is lost");
                    CycleOutcome::CacheFailed
                }
            }
        };

        debug!(?outcome, elapsed = ?started.elapsed(), "cycle finished");
        self.state = SchedulerState::Idle;
        outcome
    }

    async fn collect(&self, cancel: &CancellationToken) -> MetricTable {
        let jobs = self
            .collectors
            .iter()
            .flat_map(|collector| {
                collector
                    .targets()
                    .into_iter()
                    .map(move |target| (collector, target))
            })
            .collect::<Vec<_>>();

        let collections = join_all(
            jobs.iter()
                .map(|(collector, target)| collector.collect(target, cancel)),
        )
        .await;

        let mut table = MetricTable::new();
        for ((collector, _), collection) in jobs.iter().zip(collections) {
            if collection.missing > 0 {
                warn!(
                    collector = collector.name(),
                    device = %collection.device_id,
                    missing = collection.missing,
                    attempted = collection.attempted,
                    "some metrics could not be read"
                );
            }
            table.merge(collection.points);
        }
        table
    }
}
