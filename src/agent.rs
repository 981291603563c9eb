//! Agent side: periodic collection, push, and heartbeat loops.
//!
//! The three tickers are independent so a slow or failing push never delays
//! the heartbeat, and a collection error never kills the loop. Without a
//! server URL the agent runs standalone: it keeps collecting and logs
//! threshold warnings locally while the sender no-ops.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sysinfo::{Disks, Networks, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::sender::Sender;
use crate::{
    CpuMetrics, DiskMetrics, MemoryMetrics, MetricsPushPayload, NetworkMetrics, SystemInfo,
    SystemMetrics,
};

// Standalone-mode warning thresholds, matching the server defaults.
const LOCAL_CPU_WARN: f64 = 80.0;
const LOCAL_MEMORY_WARN: f64 = 85.0;
const LOCAL_DISK_WARN: f64 = 90.0;

/// sysinfo-backed snapshot source. Holds the `System` across refreshes so
/// CPU usage is computed from deltas between ticks.
pub struct Collector {
    sys: System,
    mounts: Vec<String>,
}

impl Collector {
    pub fn new(mounts: Vec<String>) -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        Self { sys, mounts }
    }

    pub fn snapshot(&mut self, agent_name: &str) -> SystemMetrics {
        self.sys.refresh_all();
        let load = System::load_average();

        let cpus = self.sys.cpus();
        let per_core: Vec<f64> = cpus.iter().map(|c| c.cpu_usage() as f64).collect();

        let total_memory = self.sys.total_memory();
        let used_memory = self.sys.used_memory();
        let swap_total = self.sys.total_swap();
        let swap_used = self.sys.used_swap();

        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .iter()
            .filter(|d| {
                self.mounts.is_empty()
                    || self
                        .mounts
                        .iter()
                        .any(|m| d.mount_point() == std::path::Path::new(m))
            })
            .map(|d| {
                let total = d.total_space();
                let free = d.available_space();
                let used = total.saturating_sub(free);
                DiskMetrics {
                    mount_point: d.mount_point().to_string_lossy().into_owned(),
                    device: d.name().to_string_lossy().into_owned(),
                    fs_type: d.file_system().to_string_lossy().into_owned(),
                    total,
                    used,
                    free,
                    used_percent: percent(used, total),
                }
            })
            .collect();

        let networks = Networks::new_with_refreshed_list();
        let mut network = NetworkMetrics::default();
        for (_, data) in networks.iter() {
            network.bytes_sent += data.total_transmitted();
            network.bytes_recv += data.total_received();
            network.packets_sent += data.total_packets_transmitted();
            network.packets_recv += data.total_packets_received();
            network.errors_in += data.total_errors_on_received();
            network.errors_out += data.total_errors_on_transmitted();
        }

        SystemMetrics {
            timestamp: Utc::now(),
            agent_name: agent_name.to_string(),
            cpu: CpuMetrics {
                usage_percent: self.sys.global_cpu_usage() as f64,
                per_core_percent: per_core,
                load_avg_1: load.one,
                load_avg_5: load.five,
                load_avg_15: load.fifteen,
            },
            memory: MemoryMetrics {
                total: total_memory,
                available: self.sys.available_memory(),
                used: used_memory,
                used_percent: percent(used_memory, total_memory),
                swap_total,
                swap_used,
                swap_percent: percent(swap_used, swap_total),
            },
            network,
            system_info: SystemInfo {
                hostname: System::host_name().unwrap_or_default(),
                os: System::name().unwrap_or_default(),
                platform: System::os_version().unwrap_or_default(),
                kernel_version: System::kernel_version().unwrap_or_default(),
                uptime: System::uptime(),
            },
            disk,
            containers: Vec::new(),
        }
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

pub struct Agent {
    config: AgentConfig,
    sender: Sender,
    collector: Collector,
    last_snapshot: Option<SystemMetrics>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let sender = Sender::new(config.server_url.clone(), config.api_key.clone())?;
        let collector = Collector::new(config.disk_mounts.clone());
        Ok(Self {
            config,
            sender,
            collector,
            last_snapshot: None,
        })
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let standalone = self.config.server_url.is_empty();
        info!(
            agent = %self.config.name,
            standalone,
            "agent started"
        );

        let mut collect = tokio::time::interval(Duration::from_secs(self.config.collect_interval_secs));
        let mut push = tokio::time::interval(Duration::from_secs(self.config.push_interval_secs));
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_secs));

        loop {
            tokio::select! {
                _ = collect.tick() => self.collect_once(standalone),
                _ = push.tick() => self.push_once(&cancel).await,
                _ = heartbeat.tick() => {
                    if let Err(err) = self.sender.send_heartbeat(&cancel, &self.config.name).await {
                        warn!("heartbeat failed: {err:#}");
                    }
                }
                _ = cancel.cancelled() => {
                    info!("agent stopping");
                    return;
                }
            }
        }
    }

    fn collect_once(&mut self, standalone: bool) {
        let snapshot = self.collector.snapshot(&self.config.name);
        debug!(
            cpu = snapshot.cpu.usage_percent,
            memory = snapshot.memory.used_percent,
            "collected metrics"
        );
        if standalone {
            for warning in local_warnings(&snapshot) {
                warn!("{warning}");
            }
        }
        self.last_snapshot = Some(snapshot);
    }

    async fn push_once(&mut self, cancel: &CancellationToken) {
        let Some(snapshot) = self.last_snapshot.clone() else {
            return;
        };
        let payload = MetricsPushPayload {
            agent_name: self.config.name.clone(),
            timestamp: Utc::now(),
            cloud_metadata: None,
            system_metrics: snapshot,
        };
        if let Err(err) = self.sender.push_metrics(cancel, &payload).await {
            warn!("metrics push failed: {err:#}");
        }
    }
}

/// Threshold warnings logged in standalone mode.
fn local_warnings(metrics: &SystemMetrics) -> Vec<String> {
    let mut warnings = Vec::new();
    if metrics.cpu.usage_percent > LOCAL_CPU_WARN {
        warnings.push(format!("high CPU usage: {:.1}%", metrics.cpu.usage_percent));
    }
    if metrics.memory.used_percent > LOCAL_MEMORY_WARN {
        warnings.push(format!(
            "high memory usage: {:.1}%",
            metrics.memory.used_percent
        ));
    }
    for disk in &metrics.disk {
        if disk.used_percent > LOCAL_DISK_WARN {
            warnings.push(format!(
                "high disk usage on {}: {:.1}%",
                disk.mount_point, disk.used_percent
            ));
        }
    }
    warnings
}
