//! SNMP polling of interface counters and configured OIDs.

mod session;

pub use session::{
    parse_walk,
    NetSnmpSession,
    SnmpSession,
    WalkValue,
};

use crate::{
    collector::{
        Collection,
        DeviceCollector,
        FetchError,
        Target,
    },
    engine::CatalogRunner,
    metrics::MetricPoint,
};
use pattoo_agent_config::{
    SnmpAgentConfig,
    SnmpAuthGroup,
};
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// IF-MIB columns walked on every target, keyed by interface index.
pub const IF_MIB: &[(&str, &str)] = &[
    ("ifDescr", ".1.3.6.1.2.1.2.2.1.2"),
    ("ifAlias", ".1.3.6.1.2.1.31.1.1.1.18"),
    ("ifName", ".1.3.6.1.2.1.31.1.1.1.1"),
    ("ifIndex", ".1.3.6.1.2.1.2.2.1.1"),
    ("ifInOctets", ".1.3.6.1.2.1.2.2.1.10"),
    ("ifOutOctets", ".1.3.6.1.2.1.2.2.1.16"),
    ("ifInBroadcastPkts", ".1.3.6.1.2.1.31.1.1.1.3"),
    ("ifOutBroadcastPkts", ".1.3.6.1.2.1.31.1.1.1.5"),
    ("ifInMulticastPkts", ".1.3.6.1.2.1.31.1.1.1.2"),
    ("ifOutMulticastPkts", ".1.3.6.1.2.1.31.1.1.1.4"),
    ("ifHCOutBroadcastPkts", ".1.3.6.1.2.1.31.1.1.1.13"),
    ("ifHCOutMulticastPkts", ".1.3.6.1.2.1.31.1.1.1.12"),
    ("ifHCOutUcastPkts", ".1.3.6.1.2.1.31.1.1.1.11"),
    ("ifHCOutOctets", ".1.3.6.1.2.1.31.1.1.1.10"),
    ("ifHCInBroadcastPkts", ".1.3.6.1.2.1.31.1.1.1.9"),
    ("ifHCInMulticastPkts", ".1.3.6.1.2.1.31.1.1.1.8"),
    ("ifHCInUcastPkts", ".1.3.6.1.2.1.31.1.1.1.7"),
    ("ifHCInOctets", ".1.3.6.1.2.1.31.1.1.1.6"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct OidEntry {
    pub metric_name: String,
    pub oid: String,
    pub multiplier: f64,
}

impl fmt::Display for OidEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.metric_name, self.oid)
    }
}

pub struct SnmpCollector {
    config: SnmpAgentConfig,
    session: Arc<dyn SnmpSession>,
    runner: CatalogRunner,
    fallback_auth: SnmpAuthGroup,
}

impl SnmpCollector {
    pub fn new(config: SnmpAgentConfig, session: Arc<dyn SnmpSession>, fetch_timeout: Duration) -> Self {
        Self {
            config,
            session,
            runner: CatalogRunner::new(fetch_timeout),
            fallback_auth: SnmpAuthGroup::default(),
        }
    }

    /// The interface catalog followed by the extra OIDs of the group.
    pub fn catalog(&self, group: &str) -> Vec<OidEntry> {
        let interfaces = IF_MIB.iter().map(|(name, oid)| OidEntry {
            metric_name: name.to_string(),
            oid: oid.to_string(),
            multiplier: 1.0,
        });
        let extra = self
            .config
            .polling_groups
            .iter()
            .filter(|polling_group| polling_group.group_name == group)
            .flat_map(|polling_group| polling_group.oids.iter())
            .map(|spec| OidEntry {
                metric_name: spec.address.clone(),
                oid: spec.address.clone(),
                multiplier: spec.multiplier,
            });
        interfaces.chain(extra).collect()
    }

    fn auth(&self, device_id: &str) -> &SnmpAuthGroup {
        self.config.auth_for(device_id).unwrap_or_else(|| {
            debug!(device = device_id, "no auth group lists the target, using SNMPv2c community public");
            &self.fallback_auth
        })
    }
}

impl DeviceCollector for SnmpCollector {
    fn name(&self) -> &'static str {
        "snmp"
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
            let auth = self.auth(&target.device_id);
            let entries = self.catalog(&target.group);

            self.runner
                .run(target, entries, cancel, |entry| {
                    let entry = entry.clone();
                    async move {
                        let values = self.session.walk(&target.device_id, auth, &entry.oid).await?;
                        Ok::<_, FetchError>(
                            values
                                .into_iter()
                                .map(|walked| {
                                    MetricPoint::new(
                                        entry.metric_name.clone(),
                                        target.device_id.clone(),
                                        walked.sub_key,
                                        walked.value.scaled(entry.multiplier),
                                        walked.data_type,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{
        DataType,
        MetricValue,
        SubKey,
    };
    use pattoo_agent_config::{
        OidSpec,
        SnmpPollingGroup,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSession {
        communities: Mutex<Vec<String>>,
    }

    impl SnmpSession for FakeSession {
        fn walk<'a>(
            &'a self,
            _host: &'a str,
            auth: &'a SnmpAuthGroup,
            oid: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<WalkValue>, FetchError>> + Send + 'a>> {
            self.communities
                .lock()
                .unwrap()
                .push(auth.snmp_community.clone().unwrap_or_default());
            Box::pin(async move {
                match oid {
                    ".1.3.6.1.2.1.2.2.1.10" => Ok(vec![
                        WalkValue {
                            sub_key: SubKey::Index(1),
                            value: MetricValue::Unsigned(100),
                            data_type: DataType::Counter,
                        },
                        WalkValue {
                            sub_key: SubKey::Index(2),
                            value: MetricValue::Unsigned(200),
                            data_type: DataType::Counter,
                        },
                    ]),
                    ".1.3.6.1.4.1.2021.11.9" => Ok(vec![WalkValue {
                        sub_key: SubKey::Index(0),
                        value: MetricValue::Unsigned(3),
                        data_type: DataType::Gauge,
                    }]),
                    other => Err(FetchError::Unsupported(other.to_string())),
                }
            })
        }
    }

    fn config() -> SnmpAgentConfig {
        SnmpAgentConfig {
            polling_groups: vec![
                SnmpPollingGroup {
                    group_name: "CORE".to_string(),
                    ip_targets: vec!["switch-1".to_string()],
                    oids: vec![OidSpec {
                        address: ".1.3.6.1.4.1.2021.11.9".to_string(),
                        multiplier: 8.0,
                    }],
                },
                SnmpPollingGroup {
                    group_name: "EDGE".to_string(),
                    ip_targets: vec!["switch-2".to_string(), "switch-3".to_string()],
                    oids: Vec::new(),
                },
            ],
            auth_groups: vec![SnmpAuthGroup {
                group_name: "CORE".to_string(),
                snmp_community: Some("private".to_string()),
                ip_targets: vec!["switch-1".to_string()],
                ..SnmpAuthGroup::default()
            }],
        }
    }

    #[test]
    fn targets_follow_polling_groups() {
        let collector = SnmpCollector::new(config(), Arc::new(FakeSession::default()), Duration::from_secs(1));
        let targets = collector.targets();
        assert_eq!(
            targets,
            vec![
                Target::new("switch-1", "CORE"),
                Target::new("switch-2", "EDGE"),
                Target::new("switch-3", "EDGE"),
            ]
        );
        assert_eq!(collector.catalog("CORE").len(), IF_MIB.len() + 1);
        assert_eq!(collector.catalog("EDGE").len(), IF_MIB.len());
    }

    #[tokio::test]
    async fn walks_become_points() {
        let session = Arc::new(FakeSession::default());
        let collector = SnmpCollector::new(config(), session.clone(), Duration::from_secs(1));
        let target = Target::new("switch-1", "CORE");

        let collection = collector.collect(&target, &CancellationToken::new()).await;

        let points: Vec<_> = collection
            .points
            .iter()
            .map(|p| (p.metric_name.as_str(), p.sub_key.clone(), p.value.clone(), p.data_type))
            .collect();
        assert_eq!(
            points,
            vec![
                ("ifInOctets", SubKey::Index(1), MetricValue::Unsigned(100), DataType::Counter),
                ("ifInOctets", SubKey::Index(2), MetricValue::Unsigned(200), DataType::Counter),
                (".1.3.6.1.4.1.2021.11.9", SubKey::Index(0), MetricValue::Float(24.0), DataType::Gauge),
            ]
        );
        assert_eq!(collection.missing, IF_MIB.len() - 1);
        assert!(collection.points.iter().all(|p| p.device_id == "switch-1"));

        let communities = session.communities.lock().unwrap();
        assert!(communities.iter().all(|community| community == "private"));
    }

    #[tokio::test]
    async fn unlisted_target_uses_default_community() {
        let session = Arc::new(FakeSession::default());
        let collector = SnmpCollector::new(config(), session.clone(), Duration::from_secs(1));
        collector
            .collect(&Target::new("switch-2", "EDGE"), &CancellationToken::new())
            .await;
        assert!(session.communities.lock().unwrap().iter().all(|c| c == "public"));
    }
}
