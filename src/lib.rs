pub mod agent;
pub mod backend;
pub mod config;
pub mod probe;
pub mod reducer;
pub mod runner;
pub mod shipper;
pub mod template;

/// Common types used across modules
pub mod types {
    use std::collections::HashMap;

    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    /// A single measurement attached to a host
    #[derive(Debug, Clone, Serialize)]
    pub struct HostMetric {
        pub host_id: String,
        pub name: String,
        pub value: f64,
        pub timestamp: DateTime<Utc>,
    }

    /// A measurement attached to a service, produced by aggregation
    #[derive(Debug, Clone, Serialize)]
    pub struct ServiceMetric {
        pub service: String,
        pub name: String,
        pub value: f64,
        pub timestamp: DateTime<Utc>,
    }

    /// A monitored host as returned by discovery
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Host {
        pub id: String,
        #[serde(default)]
        pub name: String,
        #[serde(default)]
        pub custom_identifier: Option<String>,
        #[serde(default)]
        pub interfaces: Vec<Interface>,
        /// service name -> role names
        #[serde(default)]
        pub roles: HashMap<String, Vec<String>>,
        /// Free-form metadata attached by the agent that registered the host
        #[serde(default)]
        pub meta: serde_json::Value,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Interface {
        #[serde(default)]
        pub name: String,
        #[serde(default)]
        pub ip_address: Option<String>,
        #[serde(default)]
        pub ipv4_addresses: Vec<String>,
        #[serde(default)]
        pub ipv6_addresses: Vec<String>,
    }

    impl Interface {
        /// Best-effort IPv4 address for template lookups
        pub fn primary_address(&self) -> Option<&str> {
            self.ip_address
                .as_deref()
                .or_else(|| self.ipv4_addresses.first().map(String::as_str))
        }
    }

    /// Latest value of one metric on one host, as reported by the backend.
    /// The backend may report null or non-numeric values; consumers must
    /// tolerate both.
    #[derive(Debug, Clone, Deserialize)]
    pub struct LatestValue {
        pub time: i64,
        #[serde(default)]
        pub value: Option<serde_json::Value>,
    }

    /// host id -> metric name -> latest value (inner entry may be null)
    pub type LatestValues = HashMap<String, HashMap<String, Option<LatestValue>>>;
}
