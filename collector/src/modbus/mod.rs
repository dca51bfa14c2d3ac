//! Modbus TCP register polling.

mod reader;

pub use reader::{
    parse_mbpoll,
    MbpollReader,
    RegisterReader,
};

use crate::{
    collector::{
        Collection,
        DeviceCollector,
        FetchError,
        Target,
    },
    engine::CatalogRunner,
    metrics::{
        DataType,
        MetricPoint,
        MetricValue,
    },
};
use pattoo_agent_config::{
    ModbusAgentConfig,
    RegisterVariable,
};
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// A configured register, displayed the way it is named in metrics.
struct RegisterEntry(RegisterVariable);

impl RegisterEntry {
    /// e.g. `input_register_30388`
    fn metric_name(&self) -> String {
        format!("{}_{}", self.0.kind, self.0.address)
    }
}

impl fmt::Display for RegisterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metric_name())
    }
}

pub struct ModbusCollector {
    config: ModbusAgentConfig,
    reader: Arc<dyn RegisterReader>,
    runner: CatalogRunner,
}

impl ModbusCollector {
    pub fn new(config: ModbusAgentConfig, reader: Arc<dyn RegisterReader>, fetch_timeout: Duration) -> Self {
        Self {
            config,
            reader,
            runner: CatalogRunner::new(fetch_timeout),
        }
    }

    fn catalog(&self, group: &str) -> Vec<RegisterEntry> {
        self.config
            .polling_groups
            .iter()
            .filter(|polling_group| polling_group.group_name == group)
            .flat_map(|polling_group| polling_group.register_variables())
            .map(RegisterEntry)
            .collect()
    }
}

impl DeviceCollector for ModbusCollector {
    fn name(&self) -> &'static str {
        "modbus"
    }

    fn targets(&self) -> Vec<Target> {
        self.config
            .polling_groups
            .iter()
            .flat_map(|group| {
                group
                    .ip_targets
                    .iter()
                    .map(|ip| Target::new(ip.clone(), group.group_name.clone()))
            })
            .collect()
    }

    fn collect<'a>(
        &'a self,
        target: &'a Target,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Collection> + Send + 'a>> {
        Box::pin(async move {
            let entries = self.catalog(&target.group);
            self.runner
                .run(target, entries, cancel, |entry| {
                    let metric_name = entry.metric_name();
                    let register = entry.0.clone();
                    async move {
                        let values = self.reader.read(&target.device_id, &register).await?;
                        let unit = register.unit.unwrap_or(0) as i64;
                        Ok::<_, FetchError>(
                            values
                                .into_iter()
                                .map(|value| {
                                    MetricPoint::new(
                                        metric_name.clone(),
                                        target.device_id.clone(),
                                        unit,
                                        MetricValue::Signed(value).scaled(register.multiplier),
                                        DataType::Gauge,
                                    )
                                })
                                .collect(),
                        )
                    }
                })
                .await
        })
    }
}
