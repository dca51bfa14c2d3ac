use crate::{
    cache::{
        CacheEntry,
        LocalCache,
    },
    error::CacheError,
    transport::Transport,
};
use maybe_backoff::MaybeBackoff;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// What one [`Forwarder::drain`] call did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub dropped: usize,
    /// Transient or unknown failures seen during the call.
    pub failures: u32,
    /// The call stopped because the retry budget ran out.
    pub gave_up: bool,
    pub cancelled: bool,
}

/// Sends cached batches to the endpoint, oldest first.
///
/// Retry delays follow the exponential curve of [`MaybeBackoff`] and keep
/// growing across drains until a batch is delivered.
pub struct Forwarder {
    transport: Arc<dyn Transport>,
    backoff: MaybeBackoff,
    max_attempts: u32,
}

impl Forwarder {
    pub fn new(transport: Arc<dyn Transport>, max_attempts: u32) -> Self {
        Self {
            transport,
            backoff: MaybeBackoff::default(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Sends entries until the cache is empty, the retry budget is spent or
    /// `cancel` fires.
    ///
    /// A transiently failing entry blocks every newer one. A permanently
    /// rejected entry is dropped so it cannot block the queue.
    #[instrument(level = "debug", skip_all)]
    pub async fn drain(&mut self, cache: &LocalCache, cancel: &CancellationToken) -> Result<DrainReport, CacheError> {
        let mut report = DrainReport::default();

        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let Some(entry) = cache.blocking(|cache| cache.peek_oldest()).await? else {
                break;
            };
            let mut entry = cache
                .blocking(move |cache| {
                    let mut entry = entry;
                    cache.mark_in_flight(&mut entry)?;
                    Ok(entry)
                })
                .await?;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = self.transport.send(&entry) => Some(outcome),
            };

            match outcome {
                None => {
                    debug!(sequence_id = entry.sequence_id, "shutting down, batch stays cached");
                    self.mark_pending(cache, entry).await?;
                    report.cancelled = true;
                    break;
                }
                Some(Ok(())) => {
                    trace!(sequence_id = entry.sequence_id, points = entry.batch.points.len(), "batch delivered");
                    self.acknowledge(cache, entry).await?;
                    self.backoff = MaybeBackoff::default();
                    report.delivered += 1;
                }
                Some(Err(err)) if err.is_permanent() => {
                    error!(
                        sequence_id = entry.sequence_id,
                        points = entry.batch.points.len(),
                        %err,
                        "endpoint rejected batch, dropping it"
                    );
                    self.acknowledge(cache, entry).await?;
                    report.dropped += 1;
                }
                Some(Err(err)) => {
                    entry = self.mark_pending(cache, entry).await?;
                    report.failures += 1;

                    if report.failures >= self.max_attempts {
                        warn!(
                            sequence_id = entry.sequence_id,
                            %err,
                            attempts = report.failures,
                            "endpoint unavailable, keeping batches cached for the next cycle"
                        );
                        report.gave_up = true;
                        break;
                    }

                    self.backoff.arm();
                    info!(sequence_id = entry.sequence_id, %err, "delivery failed, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            report.cancelled = true;
                            break;
                        }
                        _ = self.backoff.sleep() => {}
                    }
                }
            }
        }

        if report.delivered > 0 || report.dropped > 0 {
            info!(delivered = report.delivered, dropped = report.dropped, "forwarded cached batches");
        }
        Ok(report)
    }

    /// Drains once, then again every time `wake` is notified, until `cancel`.
    pub async fn run(mut self, cache: LocalCache, wake: Arc<Notify>, cancel: CancellationToken) {
        loop {
            if let Err(err) = self.drain(&cache, &cancel).await {
                error!(%err, "forwarding stopped on a cache error");
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = wake.notified() => {}
            }
        }
        debug!("forwarder stopped");
    }

    async fn acknowledge(&self, cache: &LocalCache, entry: CacheEntry) -> Result<bool, CacheError> {
        cache.blocking(move |cache| cache.acknowledge(&entry)).await
    }

    async fn mark_pending(&self, cache: &LocalCache, mut entry: CacheEntry) -> Result<CacheEntry, CacheError> {
        cache
            .blocking(move |cache| {
                cache.mark_pending(&mut entry)?;
                Ok(entry)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForwardError;
    use pattoo_agent_collector::{
        Batch,
        DataType,
        MetricPoint,
        MetricTable,
        MetricValue,
    };
    use pretty_assertions::assert_eq;
    use std::{
        collections::{
            HashMap,
            VecDeque,
        },
        future::Future,
        pin::Pin,
        sync::Mutex,
        time::Duration,
    };
    use temp_dir::TempDir;

    /// Replays scripted outcomes per sequence id, succeeding once a script runs out.
    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<HashMap<u64, VecDeque<Result<(), ForwardError>>>>,
        sent: Mutex<Vec<u64>>,
    }

    impl ScriptedTransport {
        fn script(self, sequence_id: u64, outcomes: Vec<Result<(), ForwardError>>) -> Self {
            self.scripts.lock().unwrap().insert(sequence_id, outcomes.into());
            self
        }

        fn sent(&self) -> Vec<u64> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transport for ScriptedTransport {
        fn send<'a>(&'a self, entry: &'a CacheEntry) -> Pin<Box<dyn Future<Output = Result<(), ForwardError>> + Send + 'a>> {
            self.sent.lock().unwrap().push(entry.sequence_id);
            let outcome = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&entry.sequence_id)
                .and_then(|script| script.pop_front())
                .unwrap_or(Ok(()));
            Box::pin(async move { outcome })
        }
    }

    fn unavailable() -> Result<(), ForwardError> {
        Err(ForwardError::Transient("503 Service Unavailable".to_string()))
    }

    fn cache_with(dir: &TempDir, batches: usize) -> LocalCache {
        let cache = LocalCache::open(dir.path()).unwrap();
        for _ in 0..batches {
            let table: MetricTable = [MetricPoint::new(
                "ifInOctets",
                "switch-1",
                1,
                MetricValue::Unsigned(1),
                DataType::Counter,
            )]
            .into_iter()
            .collect();
            cache.enqueue(Batch::new("agent-1", table)).unwrap();
        }
        cache
    }

    fn forwarder(transport: Arc<ScriptedTransport>, max_attempts: u32) -> Forwarder {
        Forwarder::new(transport, max_attempts)
    }

    fn remaining(cache: &LocalCache) -> Vec<u64> {
        cache.pending().unwrap().iter().map(|entry| entry.sequence_id).collect()
    }

    #[tokio::test]
    async fn delivers_in_sequence_order() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with(&dir, 3);
        let transport = Arc::new(ScriptedTransport::default());

        let report = forwarder(transport.clone(), 5)
            .drain(&cache, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(transport.sent(), vec![1, 2, 3]);
        assert_eq!(report.delivered, 3);
        assert!(cache.is_empty().unwrap());
    }

    #[tokio::test]
    async fn permanent_rejection_does_not_block() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with(&dir, 2);
        let transport = Arc::new(
            ScriptedTransport::default().script(1, vec![Err(ForwardError::Permanent("400 Bad Request".to_string()))]),
        );

        let report = forwarder(transport.clone(), 5)
            .drain(&cache, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(transport.sent(), vec![1, 2]);
        assert_eq!(
            report,
            DrainReport {
                delivered: 1,
                dropped: 1,
                ..Default::default()
            }
        );
        assert!(cache.is_empty().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_blocks_newer_batches() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with(&dir, 2);
        let transport = Arc::new(ScriptedTransport::default().script(1, vec![unavailable(); 10]));

        let start = tokio::time::Instant::now();
        let report = forwarder(transport.clone(), 3)
            .drain(&cache, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(transport.sent(), vec![1, 1, 1]);
        assert!(report.gave_up);
        assert_eq!(report.failures, 3);
        assert_eq!(remaining(&cache), vec![1, 2]);
        assert_eq!(cache.peek_oldest().unwrap().unwrap().status, crate::cache::EntryStatus::Pending);
        // retries waited on the backoff
        assert!(start.elapsed() > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_transient_failure_delivers() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with(&dir, 2);
        let transport = Arc::new(ScriptedTransport::default().script(1, vec![unavailable(); 2]));
        let mut forwarder = forwarder(transport.clone(), 2);
        let cancel = CancellationToken::new();

        let first = forwarder.drain(&cache, &cancel).await.unwrap();
        assert!(first.gave_up);
        assert_eq!(remaining(&cache), vec![1, 2]);

        let start = tokio::time::Instant::now();
        let second = forwarder.drain(&cache, &cancel).await.unwrap();
        assert_eq!(second.delivered, 2);
        assert_eq!(second.failures, 0);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(transport.sent(), vec![1, 1, 1, 2]);
        assert!(cache.is_empty().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_the_retry_wait() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with(&dir, 1);
        let transport = Arc::new(ScriptedTransport::default().script(1, vec![unavailable(); 10]));
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let watched = transport.clone();
        // busy polling keeps the paused clock from advancing
        tokio::spawn(async move {
            while watched.sent().is_empty() {
                tokio::task::yield_now().await;
            }
            stopper.cancel();
        });

        let report = forwarder(transport.clone(), 10).drain(&cache, &cancel).await.unwrap();

        assert!(report.cancelled);
        assert!(!report.gave_up);
        assert_eq!(transport.sent(), vec![1]);
        assert_eq!(remaining(&cache), vec![1]);
    }

    #[tokio::test]
    async fn cancelled_drain_leaves_everything_cached() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with(&dir, 2);
        let transport = Arc::new(ScriptedTransport::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = forwarder(transport.clone(), 5).drain(&cache, &cancel).await.unwrap();

        assert!(report.cancelled);
        assert!(transport.sent().is_empty());
        assert_eq!(remaining(&cache), vec![1, 2]);
    }

    #[tokio::test]
    async fn worker_drains_when_woken() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with(&dir, 1);
        let transport = Arc::new(ScriptedTransport::default());
        let wake = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(forwarder(transport.clone(), 5).run(cache.clone(), wake.clone(), cancel.clone()));

        // the startup drain empties the cache
        while !cache.is_empty().unwrap() {
            tokio::task::yield_now().await;
        }

        let table: MetricTable = [MetricPoint::new("ifOutOctets", "switch-1", 1, MetricValue::Unsigned(2), DataType::Counter)]
            .into_iter()
            .collect();
        cache.enqueue(Batch::new("agent-1", table)).unwrap();
        wake.notify_one();

        while !cache.is_empty().unwrap() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        worker.await.unwrap();
        assert_eq!(transport.sent(), vec![1, 2]);
    }
}
