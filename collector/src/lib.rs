//! # Pattoo Agent Collector
//!
//! Turns device queries into normalized metric points.
//!
//! ## Architecture
//!
//! - **`metrics`**: `MetricPoint`, the `(metric_name, sub_key)` keyed `MetricTable` and `Batch`
//! - **`collector`**: the `DeviceCollector` trait every protocol implements
//! - **`engine`**: runs a catalog entry by entry with per fetch timeouts
//! - **`snmp`**: IF-MIB and configured OID walks through net-snmp
//! - **`modbus`**: input and holding register reads through mbpoll

#[macro_use]
extern crate tracing;

pub mod collector;
pub mod engine;
pub mod metrics;
pub mod modbus;
pub mod snmp;

pub use collector::{
    Collection,
    DeviceCollector,
    FetchError,
    Target,
};
pub use engine::CatalogRunner;
pub use metrics::{
    Batch,
    DataType,
    MetricPoint,
    MetricTable,
    MetricValue,
    SubKey,
};
pub use modbus::ModbusCollector;
pub use snmp::SnmpCollector;
