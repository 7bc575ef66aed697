//! Wire shape for one stats sample (spec.md §3, §4.6).

use crate::engine::RawStatSample;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Host,
    Container,
}

/// One line of the stats feed: `{id, resourceType, memLimit, timestamp,
/// cpu, diskIo, memory, network, filesystem}`, emitted as a single JSON
/// object per tick.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedStat {
    pub id: String,
    #[serde(rename = "resourceType")]
    pub resource_type: ResourceType,
    #[serde(rename = "memLimit")]
    pub mem_limit: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub cpu: serde_json::Value,
    #[serde(rename = "diskIo")]
    pub disk_io: serde_json::Value,
    pub memory: serde_json::Value,
    pub network: serde_json::Value,
    pub filesystem: serde_json::Value,
}

impl AggregatedStat {
    pub fn from_raw(id: impl Into<String>, resource_type: ResourceType, mem_limit: u64, raw: RawStatSample) -> Self {
        Self {
            id: id.into(),
            resource_type,
            mem_limit,
            timestamp: raw.timestamp,
            cpu: raw.cpu,
            disk_io: raw.diskio,
            memory: raw.memory,
            network: raw.network,
            filesystem: raw.filesystem,
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).expect("AggregatedStat serialization is infallible")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn from_raw_carries_mem_limit_and_id_through() {
        let raw = RawStatSample {
            timestamp: Utc::now(),
            cpu: serde_json::json!({}),
            diskio: serde_json::json!({}),
            memory: serde_json::json!({}),
            network: serde_json::json!({}),
            filesystem: serde_json::json!({}),
        };
        let stat = AggregatedStat::from_raw("C1", ResourceType::Container, 1024, raw);
        assert_eq!(stat.id, "C1");
        assert_eq!(stat.mem_limit, 1024);
        let line = stat.to_line();
        assert!(line.contains("\"resourceType\":\"container\""));
    }
}
