use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::HashMap,
    fmt,
};
use strum::{
    Display,
    EnumString,
};

/// Distinguishes several values of one metric, e.g. the interface index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubKey {
    Index(i64),
    Name(String),
}

impl fmt::Display for SubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubKey::Index(index) => write!(f, "{index}"),
            SubKey::Name(name) => f.write_str(name),
        }
    }
}

impl From<i64> for SubKey {
    fn from(value: i64) -> Self {
        SubKey::Index(value)
    }
}

impl From<&str> for SubKey {
    fn from(value: &str) -> Self {
        SubKey::Name(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Text(String),
}

impl MetricValue {
    /// Applies a configured multiplier. A multiplier of 1 keeps integers intact.
    pub fn scaled(self, multiplier: f64) -> Self {
        if multiplier == 1.0 {
            return self;
        }
        match self {
            MetricValue::Unsigned(value) => MetricValue::Float(value as f64 * multiplier),
            MetricValue::Signed(value) => MetricValue::Float(value as f64 * multiplier),
            MetricValue::Float(value) => MetricValue::Float(value * multiplier),
            text @ MetricValue::Text(_) => text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "COUNTER")]
    #[strum(serialize = "COUNTER")]
    Counter,
    #[serde(rename = "GAUGE")]
    #[strum(serialize = "GAUGE")]
    Gauge,
    #[serde(rename = "STRING")]
    #[strum(serialize = "STRING")]
    Text,
}

/// One value read from one device. Never changed after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub metric_name: String,
    pub device_id: String,
    pub sub_key: SubKey,
    pub value: MetricValue,
    pub data_type: DataType,
    pub collected_at: DateTime<Utc>,
}

impl MetricPoint {
    pub fn new(
        metric_name: impl Into<String>,
        device_id: impl Into<String>,
        sub_key: impl Into<SubKey>,
        value: MetricValue,
        data_type: DataType,
    ) -> Self {
        Self {
            metric_name: metric_name.into(),
            device_id: device_id.into(),
            sub_key: sub_key.into(),
            value,
            data_type,
            collected_at: Utc::now(),
        }
    }

    fn key(&self) -> PointKey {
        (self.device_id.clone(), self.metric_name.clone(), self.sub_key.clone())
    }
}

type PointKey = (String, String, SubKey);

/// Metric points in insertion order, keyed by `(metric_name, sub_key)` per
/// device. Points of different devices never replace each other.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricTable {
    points: Vec<MetricPoint>,
    index: HashMap<PointKey, usize>,
}

impl MetricTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a point. A point with an already known key replaces the earlier
    /// one in place and the earlier one is returned.
    pub fn insert(&mut self, point: MetricPoint) -> Option<MetricPoint> {
        let key = point.key();
        match self.index.get(&key) {
            Some(&position) => {
                debug!(
                    metric = %point.metric_name,
                    sub_key = %point.sub_key,
                    device = %point.device_id,
                    "metric collected twice, keeping the later value"
                );
                Some(std::mem::replace(&mut self.points[position], point))
            }
            None => {
                self.index.insert(key, self.points.len());
                self.points.push(point);
                None
            }
        }
    }

    /// Merges another table, applying the same replacement rule per point.
    pub fn merge(&mut self, other: MetricTable) {
        for point in other.points {
            self.insert(point);
        }
    }

    pub fn get(&self, device_id: &str, metric_name: &str, sub_key: &SubKey) -> Option<&MetricPoint> {
        self.index
            .get(&(device_id.to_string(), metric_name.to_string(), sub_key.clone()))
            .map(|&position| &self.points[position])
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricPoint> {
        self.points.iter()
    }

    pub fn into_points(self) -> Vec<MetricPoint> {
        self.points
    }
}

impl Extend<MetricPoint> for MetricTable {
    fn extend<T: IntoIterator<Item = MetricPoint>>(&mut self, iter: T) {
        for point in iter {
            self.insert(point);
        }
    }
}

impl FromIterator<MetricPoint> for MetricTable {
    fn from_iter<T: IntoIterator<Item = MetricPoint>>(iter: T) -> Self {
        let mut table = MetricTable::new();
        table.extend(iter);
        table
    }
}

/// Everything one scheduler cycle collected.
///
/// The sequence id is not part of the batch: the cache assigns it on enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub points: Vec<MetricPoint>,
}

impl Batch {
    pub fn new(agent_id: impl Into<String>, table: MetricTable) -> Self {
        Self {
            agent_id: agent_id.into(),
            created_at: Utc::now(),
            points: table.into_points(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn gauge(name: &str, sub_key: i64, value: u64) -> MetricPoint {
        MetricPoint::new(name, "switch-1", sub_key, MetricValue::Unsigned(value), DataType::Gauge)
    }

    #[test]
    fn same_key_replaces_in_place() {
        let mut table = MetricTable::new();
        assert!(table.insert(gauge("ifInOctets", 1, 10)).is_none());
        assert!(table.insert(gauge("ifOutOctets", 1, 20)).is_none());
        let replaced = table.insert(gauge("ifInOctets", 1, 30)).unwrap();

        assert_eq!(replaced.value, MetricValue::Unsigned(10));
        let values: Vec<_> = table.iter().map(|p| (p.metric_name.as_str(), p.value.clone())).collect();
        assert_eq!(
            values,
            vec![
                ("ifInOctets", MetricValue::Unsigned(30)),
                ("ifOutOctets", MetricValue::Unsigned(20)),
            ]
        );
    }

    #[test]
    fn new_sub_key_is_added() {
        let table: MetricTable = [gauge("ifInOctets", 1, 10), gauge("ifInOctets", 2, 11)].into_iter().collect();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get("switch-1", "ifInOctets", &SubKey::Index(2)).map(|p| p.value.clone()),
            Some(MetricValue::Unsigned(11))
        );
    }

    #[test]
    fn devices_do_not_replace_each_other() {
        let mut table: MetricTable = [gauge("ifInOctets", 1, 10)].into_iter().collect();
        let other: MetricTable = [MetricPoint::new(
            "ifInOctets",
            "switch-2",
            1,
            MetricValue::Unsigned(20),
            DataType::Gauge,
        )]
        .into_iter()
        .collect();

        table.merge(other);

        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get("switch-1", "ifInOctets", &SubKey::Index(1)).map(|p| p.value.clone()),
            Some(MetricValue::Unsigned(10))
        );
        assert_eq!(
            table.get("switch-2", "ifInOctets", &SubKey::Index(1)).map(|p| p.value.clone()),
            Some(MetricValue::Unsigned(20))
        );
    }

    #[test]
    fn multiplier_one_keeps_integers() {
        assert_eq!(MetricValue::Unsigned(7).scaled(1.0), MetricValue::Unsigned(7));
        assert_eq!(MetricValue::Signed(-2).scaled(0.5), MetricValue::Float(-1.0));
        assert_eq!(
            MetricValue::Text("eth0".to_string()).scaled(8.0),
            MetricValue::Text("eth0".to_string())
        );
    }

    #[test]
    fn point_serializes_with_plain_field_names() {
        let point = MetricPoint {
            collected_at: "2024-05-01T10:00:00Z".parse().unwrap(),
            ..gauge("ifHCInOctets", 3, 42)
        };
        let json = serde_json::to_value(&point).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "metric_name": "ifHCInOctets",
                "device_id": "switch-1",
                "sub_key": 3,
                "value": 42,
                "data_type": "GAUGE",
                "collected_at": "2024-05-01T10:00:00Z",
            })
        );
        let back: MetricPoint = serde_json::from_value(json).unwrap();
        assert_eq!(back, point);
    }
}
