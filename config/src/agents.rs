//! Settings that only exist for one kind of agent.
//!
//! Every agent program shares the base [`crate::ConfigSnapshot`] and adds
//! exactly one of the structs below, read from its own YAML section.

use crate::ConfigError;
use serde::{
    de::DeserializeOwned,
    Deserialize,
    Serialize,
};
use strum::{
    Display,
    EnumIter,
    EnumString,
};

/// Which agent program this process is.
#[derive(Debug, Default, Clone, Copy, Display, EnumIter, EnumString, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AgentKind {
    #[default]
    Snmp,
    Modbus,
}

impl AgentKind {
    /// Name used for the per agent cache, daemon and log locations.
    pub fn agent_name(&self) -> &'static str {
        match self {
            AgentKind::Snmp => SnmpAgentConfig::AGENT_NAME,
            AgentKind::Modbus => ModbusAgentConfig::AGENT_NAME,
        }
    }
}

/// Extension settings of one agent kind.
pub trait AgentSection: DeserializeOwned + Serialize + Clone + Send + Sync + 'static {
    const KIND: AgentKind;
    /// Top level YAML section holding the settings.
    const SECTION: &'static str;
    const AGENT_NAME: &'static str;

    fn validate(&self) -> Result<(), ConfigError>;
}

fn default_multiplier() -> f64 {
    1.0
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-
// SNMP

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnmpAgentConfig {
    pub polling_groups: Vec<SnmpPollingGroup>,
    #[serde(default)]
    pub auth_groups: Vec<SnmpAuthGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnmpPollingGroup {
    pub group_name: String,
    pub ip_targets: Vec<String>,
    /// OIDs walked in addition to the built-in interface catalog.
    #[serde(default)]
    pub oids: Vec<OidSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OidSpec {
    pub address: String,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnmpAuthGroup {
    pub group_name: String,
    #[serde(default = "default_snmp_version")]
    pub snmp_version: u8,
    #[serde(default)]
    pub snmp_community: Option<String>,
    #[serde(default = "default_snmp_port")]
    pub snmp_port: u16,
    #[serde(default)]
    pub snmp_secname: Option<String>,
    #[serde(default)]
    pub snmp_authprotocol: Option<String>,
    #[serde(default)]
    pub snmp_authpassword: Option<String>,
    #[serde(default)]
    pub snmp_privprotocol: Option<String>,
    #[serde(default)]
    pub snmp_privpassword: Option<String>,
    pub ip_targets: Vec<String>,
}

fn default_snmp_version() -> u8 {
    2
}

fn default_snmp_port() -> u16 {
    161
}

impl Default for SnmpAuthGroup {
    fn default() -> Self {
        Self {
            group_name: "default".to_string(),
            snmp_version: default_snmp_version(),
            snmp_community: Some("public".to_string()),
            snmp_port: default_snmp_port(),
            snmp_secname: None,
            snmp_authprotocol: None,
            snmp_authpassword: None,
            snmp_privprotocol: None,
            snmp_privpassword: None,
            ip_targets: Vec::new(),
        }
    }
}

impl SnmpAgentConfig {
    /// Credentials for a target: the first auth group listing it.
    pub fn auth_for(&self, target: &str) -> Option<&SnmpAuthGroup> {
        self.auth_groups
            .iter()
            .find(|group| group.ip_targets.iter().any(|ip| ip == target))
    }
}

impl AgentSection for SnmpAgentConfig {
    const KIND: AgentKind = AgentKind::Snmp;
    const SECTION: &'static str = "pattoo_agent_snmpd";
    const AGENT_NAME: &'static str = "pattoo-agent-snmpd";

    fn validate(&self) -> Result<(), ConfigError> {
        if self.polling_groups.iter().all(|group| group.ip_targets.is_empty()) {
            return Err(ConfigError::Missing {
                section: Self::SECTION,
                key: "polling_groups",
            });
        }
        for group in &self.auth_groups {
            if !matches!(group.snmp_version, 1 | 2 | 3) {
                return Err(ConfigError::Invalid {
                    section: Self::SECTION,
                    key: "snmp_version",
                    reason: format!("group {:?} uses unsupported version {}", group.group_name, group.snmp_version),
                });
            }
            if group.snmp_version == 3 && group.snmp_secname.is_none() {
                return Err(ConfigError::Invalid {
                    section: Self::SECTION,
                    key: "snmp_secname",
                    reason: format!("group {:?} uses SNMPv3 without a security name", group.group_name),
                });
            }
        }
        Ok(())
    }
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-
// Modbus TCP

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusAgentConfig {
    pub polling_groups: Vec<ModbusPollingGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusPollingGroup {
    pub group_name: String,
    pub ip_targets: Vec<String>,
    #[serde(default)]
    pub unit: Option<u8>,
    #[serde(default)]
    pub input_registers: Vec<RegisterSpec>,
    #[serde(default)]
    pub holding_registers: Vec<RegisterSpec>,
}

/// A register as written in the configuration, using Modicon numbering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSpec {
    pub address: u32,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

#[derive(Debug, Clone, Copy, Display, PartialEq, Eq, Hash)]
#[strum(serialize_all = "snake_case")]
pub enum RegisterKind {
    InputRegister,
    HoldingRegister,
}

impl RegisterKind {
    /// First Modicon address of the register table.
    fn base(&self) -> u32 {
        match self {
            RegisterKind::InputRegister => 30001,
            RegisterKind::HoldingRegister => 40001,
        }
    }
}

/// A register resolved to its zero based protocol offset.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterVariable {
    pub kind: RegisterKind,
    /// Address as configured, kept for naming the metric.
    pub address: u32,
    pub offset: u16,
    pub count: u16,
    pub unit: Option<u8>,
    pub multiplier: f64,
}

impl RegisterVariable {
    fn resolve(kind: RegisterKind, spec: &RegisterSpec, unit: Option<u8>) -> Option<Self> {
        let base = kind.base();
        if !(base..base + 9999).contains(&spec.address) {
            return None;
        }
        Some(Self {
            kind,
            address: spec.address,
            offset: (spec.address - base) as u16,
            count: 1,
            unit,
            multiplier: spec.multiplier,
        })
    }
}

impl ModbusPollingGroup {
    /// Registers of this group in configuration order, inputs before holdings.
    ///
    /// Addresses outside their Modicon range are skipped.
    pub fn register_variables(&self) -> Vec<RegisterVariable> {
        let inputs = self
            .input_registers
            .iter()
            .map(|spec| (RegisterKind::InputRegister, spec));
        let holdings = self
            .holding_registers
            .iter()
            .map(|spec| (RegisterKind::HoldingRegister, spec));

        inputs
            .chain(holdings)
            .filter_map(|(kind, spec)| {
                let resolved = RegisterVariable::resolve(kind, spec, self.unit);
                if resolved.is_none() {
                    warn!(
                        group = %self.group_name,
                        address = spec.address,
                        %kind,
                        "register address outside of its table, skipping"
                    );
                }
                resolved
            })
            .collect()
    }
}

impl AgentSection for ModbusAgentConfig {
    const KIND: AgentKind = AgentKind::Modbus;
    const SECTION: &'static str = "pattoo_agent_modbustcpd";
    const AGENT_NAME: &'static str = "pattoo-agent-modbustcpd";

    fn validate(&self) -> Result<(), ConfigError> {
        let has_work = self.polling_groups.iter().any(|group| {
            !group.ip_targets.is_empty() && !(group.input_registers.is_empty() && group.holding_registers.is_empty())
        });
        if !has_work {
            return Err(ConfigError::Missing {
                section: Self::SECTION,
                key: "polling_groups",
            });
        }
        Ok(())
    }
}
