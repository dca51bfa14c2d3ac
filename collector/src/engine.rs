use crate::{
    collector::{
        Collection,
        FetchError,
        Target,
    },
    metrics::MetricPoint,
};
use std::{
    fmt,
    future::Future,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// Walks a catalog one entry at a time.
///
/// Every fetch gets its own timeout. A failed entry is counted as missing and
/// the next entry is fetched anyway. Cancellation is honoured between fetches.
#[derive(Debug, Clone, Copy)]
pub struct CatalogRunner {
    fetch_timeout: Duration,
}

impl CatalogRunner {
    pub fn new(fetch_timeout: Duration) -> Self {
        Self { fetch_timeout }
    }

    pub async fn run<E, F, Fut>(
        &self,
        target: &Target,
        entries: Vec<E>,
        cancel: &CancellationToken,
        mut fetch: F,
    ) -> Collection
    where
        E: fmt::Display,
        F: FnMut(&E) -> Fut,
        Fut: Future<Output = Result<Vec<MetricPoint>, FetchError>>,
    {
        let mut collection = Collection::empty(&target.device_id);
        let total = entries.len();

        for (position, entry) in entries.iter().enumerate() {
            if cancel.is_cancelled() {
                collection.missing += total - position;
                debug!(device = %target.device_id, skipped = total - position, "collection cancelled");
                break;
            }

            collection.attempted += 1;
            let result = tokio::time::timeout(self.fetch_timeout, fetch(entry))
                .await
                .unwrap_or(Err(FetchError::Timeout(self.fetch_timeout)));

            match result {
                Ok(points) => {
                    trace!(device = %target.device_id, %entry, values = points.len(), "fetched");
                    collection.points.extend(points);
                }
                Err(err) => {
                    debug!(device = %target.device_id, %entry, %err, "catalog entry missing");
                    collection.missing += 1;
                }
            }
        }

        if collection.missing > 0 {
            info!(
                device = %target.device_id,
                group = %target.group,
                missing = collection.missing,
                catalog = total,
                "some catalog entries could not be collected"
            );
        }
        collection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{
        DataType,
        MetricValue,
    };
    use pretty_assertions::assert_eq;

    fn point(entry: u32) -> MetricPoint {
        MetricPoint::new(
            format!("metric_{entry}"),
            "plc-1",
            1,
            MetricValue::Unsigned(entry as u64),
            DataType::Gauge,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn failing_entries_do_not_abort_the_rest() {
        let runner = CatalogRunner::new(Duration::from_secs(10));
        let target = Target::new("plc-1", "TEST");
        let cancel = CancellationToken::new();

        let collection = runner
            .run(&target, vec![0u32, 1, 2, 3, 4], &cancel, |entry| {
                let entry = *entry;
                async move {
                    match entry {
                        1 => {
                            tokio::time::sleep(Duration::from_secs(60)).await;
                            Ok(vec![point(entry)])
                        }
                        3 => Err(FetchError::Unsupported(format!("entry {entry}"))),
                        _ => Ok(vec![point(entry)]),
                    }
                }
            })
            .await;

        let names: Vec<_> = collection.points.iter().map(|p| p.metric_name.clone()).collect();
        assert_eq!(names, vec!["metric_0", "metric_2", "metric_4"]);
        assert_eq!(collection.missing, 2);
        assert_eq!(collection.attempted, 5);
        assert_eq!(collection.device_id, "plc-1");
    }

    #[tokio::test]
    async fn cancellation_stops_between_fetches() {
        let runner = CatalogRunner::new(Duration::from_secs(10));
        let target = Target::new("plc-1", "TEST");
        let cancel = CancellationToken::new();

        let collection = runner
            .run(&target, vec![0u32, 1, 2, 3, 4], &cancel, |entry| {
                let entry = *entry;
                let cancel = cancel.clone();
                async move {
                    if entry == 1 {
                        cancel.cancel();
                    }
                    Ok(vec![point(entry)])
                }
            })
            .await;

        assert_eq!(collection.points.len(), 2);
        assert_eq!(collection.attempted, 2);
        assert_eq!(collection.missing, 3);
    }

    #[tokio::test]
    async fn empty_walks_are_not_missing() {
        let runner = CatalogRunner::new(Duration::from_secs(1));
        let target = Target::new("switch-1", "TEST");
        let collection = runner
            .run(&target, vec!["ifAlias"], &CancellationToken::new(), |_| async { Ok(Vec::new()) })
            .await;
        assert!(collection.points.is_empty());
        assert_eq!(collection.missing, 0);
    }
}
