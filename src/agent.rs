//! Runtime of a started agent: scheduler and forwarder sharing one cache.

use crate::scheduler::{
    SchedulerLoop,
    SchedulerStats,
};
use color_eyre::Result;
use eyre::WrapErr as _;
use pattoo_agent_collector::{
    modbus::MbpollReader,
    snmp::NetSnmpSession,
    DeviceCollector,
    ModbusCollector,
    SnmpCollector,
};
use pattoo_agent_config::{
    AgentKind,
    ConfigError,
    ConfigLoader,
    ConfigSnapshot,
    ModbusAgentConfig,
    Settings,
    SnmpAgentConfig,
};
use pattoo_agent_spool::{
    Forwarder,
    HttpTransport,
    LocalCache,
};
use serde::Serialize;
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::{
    signal::unix::{
        signal,
        SignalKind,
    },
    sync::Notify,
};
use tokio_util::sync::CancellationToken;

/// The agent specific configuration section, keyed by its YAML section name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AgentSettings {
    #[serde(rename = "pattoo_agent_snmpd")]
    Snmp(SnmpAgentConfig),
    #[serde(rename = "pattoo_agent_modbustcpd")]
    Modbus(ModbusAgentConfig),
}

impl AgentSettings {
    pub fn load(kind: AgentKind, loader: &ConfigLoader) -> Result<(Settings, Self), ConfigError> {
        match kind {
            AgentKind::Snmp => {
                let (settings, agent) = loader.load::<SnmpAgentConfig>()?;
                Ok((settings, AgentSettings::Snmp(agent)))
            }
            AgentKind::Modbus => {
                let (settings, agent) = loader.load::<ModbusAgentConfig>()?;
                Ok((settings, AgentSettings::Modbus(agent)))
            }
        }
    }

    pub fn kind(&self) -> AgentKind {
        match self {
            AgentSettings::Snmp(_) => AgentKind::Snmp,
            AgentSettings::Modbus(_) => AgentKind::Modbus,
        }
    }

    /// Collector backed by the protocol command line tools.
    pub fn collector(&self, fetch_timeout: Duration) -> Arc<dyn DeviceCollector> {
        match self {
            AgentSettings::Snmp(config) => Arc::new(SnmpCollector::new(
                config.clone(),
                Arc::new(NetSnmpSession::locate(fetch_timeout)),
                fetch_timeout,
            )),
            AgentSettings::Modbus(config) => Arc::new(ModbusCollector::new(
                config.clone(),
                Arc::new(MbpollReader::locate(fetch_timeout)),
                fetch_timeout,
            )),
        }
    }
}

/// Everything `config` prints.
#[derive(Debug, Serialize)]
pub struct ResolvedConfig<'a> {
    #[serde(flatten)]
    pub snapshot: &'a ConfigSnapshot,
    #[serde(flatten)]
    pub agent: &'a AgentSettings,
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-

/// Runs until SIGINT or SIGTERM.
pub async fn run(snapshot: ConfigSnapshot, collectors: Vec<Arc<dyn DeviceCollector>>) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).wrap_err("failed to install SIGTERM handler")?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = terminate.recv() => info!("received SIGTERM, shutting down"),
            _ = shutdown.cancelled() => {}
        }
        shutdown.cancel();
    });

    let stats = run_until(&snapshot, collectors, cancel).await?;
    info!(cycles = stats.cycles, "agent stopped");
    Ok(())
}

/// Runs the scheduler and the forwarder until `cancel` fires, then waits for
/// both to wind down.
#[instrument(level = "info", skip_all, fields(agent = %snapshot.agent_name, agent_id = %snapshot.agent_id))]
pub async fn run_until(
    snapshot: &ConfigSnapshot,
    collectors: Vec<Arc<dyn DeviceCollector>>,
    cancel: CancellationToken,
) -> Result<SchedulerStats> {
    let cache_dir = snapshot.agent_cache_directory();
    let cache = tokio::task::spawn_blocking({
        let cache_dir = cache_dir.clone();
        move || LocalCache::open(cache_dir)
    })
    .await?
    .wrap_err_with(|| format!("failed to open cache at {}", cache_dir.display()))?;

    let transport = HttpTransport::new(snapshot.endpoint.clone(), snapshot.remote_api.request_timeout())
        .wrap_err("failed to build HTTP client")?;
    let forwarder = Forwarder::new(Arc::new(transport), snapshot.remote_api.retry_attempts);

    let wake = Arc::new(Notify::new());
    let scheduler = SchedulerLoop::new(
        collectors,
        cache.clone(),
        wake.clone(),
        snapshot.agent_id.clone(),
        snapshot.poll_interval(),
    );

    info!(
        endpoint = %snapshot.endpoint,
        interval = ?scheduler.interval(),
        cache = %cache_dir.display(),
        "agent started"
    );

    let forwarding = tokio::spawn(forwarder.run(cache, wake, cancel.clone()));
    let scheduling = tokio::spawn(scheduler.run(cancel));

    let (stats, forwarded) = tokio::join!(scheduling, forwarding);
    forwarded.wrap_err("forwarder task failed")?;
    stats.wrap_err("scheduler task failed")
}
