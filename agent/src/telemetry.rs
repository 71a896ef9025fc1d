//! Host identity, host metrics and the metrics sink

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tracing::{debug, info};

use crate::storage::settings::HostSettings;

/// How this host identifies itself in ping requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub host_id: String,
    pub host_name: String,
    pub host_ip: Option<String>,
    pub groups: Vec<String>,
}

impl HostIdentity {
    /// Configured values win; the rest is discovered. The host name doubles as
    /// the id when none is configured.
    pub async fn discover(settings: &HostSettings) -> Self {
        let host_name = settings
            .host_name
            .clone()
            .or_else(System::host_name)
            .unwrap_or_else(|| "unknown".to_string());
        let host_ip = match &settings.host_ip {
            Some(ip) => Some(ip.clone()),
            None => resolve_ip(&host_name).await,
        };
        let host_id = settings.host_id.clone().unwrap_or_else(|| host_name.clone());
        let identity = Self {
            host_id,
            host_name,
            host_ip,
            groups: settings.groups.clone(),
        };
        info!(
            "Host identity: {} ({}, {:?})",
            identity.host_id, identity.host_name, identity.host_ip
        );
        identity
    }
}

async fn resolve_ip(host_name: &str) -> Option<String> {
    match tokio::net::lookup_host((host_name, 0)).await {
        Ok(mut addrs) => addrs.next().map(|addr| addr.ip().to_string()),
        Err(e) => {
            debug!("Unable to resolve {}: {}", host_name, e);
            None
        }
    }
}

/// Host resource usage, served by the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostMetrics {
    /// Memory usage in bytes
    pub memory_used: u64,

    /// Total memory in bytes
    pub memory_total: u64,

    /// Disk usage in bytes
    pub disk_used: u64,

    /// Total disk space in bytes
    pub disk_total: u64,

    /// System uptime in seconds
    pub uptime_secs: u64,
}

/// Collect host metrics
pub fn collect_metrics() -> HostMetrics {
    let mut sys = System::new();
    sys.refresh_memory();

    let disks = Disks::new_with_refreshed_list();
    let (disk_used, disk_total) = disks.iter().fold((0u64, 0u64), |(used, total), disk| {
        (
            used + disk.total_space().saturating_sub(disk.available_space()),
            total + disk.total_space(),
        )
    });

    HostMetrics {
        memory_used: sys.used_memory(),
        memory_total: sys.total_memory(),
        disk_used,
        disk_total,
        uptime_secs: System::uptime(),
    }
}

/// Destination for deploy metrics. Chosen once at startup.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, tags: &[(&str, &str)]);

    fn timing(&self, name: &str, elapsed: Duration, tags: &[(&str, &str)]);
}

/// Drops everything
#[derive(Debug, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn increment(&self, _name: &str, _tags: &[(&str, &str)]) {}

    fn timing(&self, _name: &str, _elapsed: Duration, _tags: &[(&str, &str)]) {}
}

/// Writes metrics as structured log events under the `metrics` target
#[derive(Debug, Default)]
pub struct LogSink;

fn format_tags(tags: &[(&str, &str)]) -> String {
    tags.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

impl MetricsSink for LogSink {
    fn increment(&self, name: &str, tags: &[(&str, &str)]) {
        info!(target: "metrics", metric = name, kind = "counter", tags = %format_tags(tags));
    }

    fn timing(&self, name: &str, elapsed: Duration, tags: &[(&str, &str)]) {
        info!(
            target: "metrics",
            metric = name,
            kind = "timer",
            millis = elapsed.as_millis() as u64,
            tags = %format_tags(tags)
        );
    }
}

pub fn metrics_sink(enabled: bool) -> Arc<dyn MetricsSink> {
    if enabled {
        Arc::new(LogSink)
    } else {
        Arc::new(NoopSink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_configured_identity_wins() {
        let settings = HostSettings {
            host_id: Some("i-123".to_string()),
            host_name: Some("web-1".to_string()),
            host_ip: Some("10.0.0.7".to_string()),
            groups: vec!["web".to_string()],
        };
        let identity = HostIdentity::discover(&settings).await;
        assert_eq!(identity.host_id, "i-123");
        assert_eq!(identity.host_name, "web-1");
        assert_eq!(identity.host_ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(identity.groups, vec!["web"]);
    }

    #[tokio::test]
    async fn test_host_name_is_default_id() {
        let settings = HostSettings {
            host_name: Some("web-2".to_string()),
            host_ip: Some("10.0.0.8".to_string()),
            ..Default::default()
        };
        assert_eq!(HostIdentity::discover(&settings).await.host_id, "web-2");
    }

    #[test]
    fn test_format_tags() {
        assert_eq!(format_tags(&[("env", "web"), ("stage", "STAGING")]), "env=web,stage=STAGING");
    }
}
