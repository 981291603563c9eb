//! In-memory fleet state: the latest snapshot per agent plus the alert book.
//!
//! Everything lives behind a single [`tokio::sync::RwLock`]; reads hand out
//! owned clones so callers can never mutate the store through a returned
//! value. State is intentionally ephemeral and rebuilds from the next push
//! after a restart.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{CloudMetadata, ContainerMetrics, MetricsPushPayload, SystemMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Resolved,
}

/// Latest known state for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_metadata: Option<CloudMetadata>,
    pub last_seen: DateTime<Utc>,
    pub status: AgentStatus,
    pub system_metrics: SystemMetrics,
    pub containers: Vec<ContainerState>,
    pub active_alerts: Vec<Alert>,
}

/// Per-container state tracked across pushes so the engine can see
/// transitions, not just the current snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub previous_state: String,
    pub last_state_change: DateTime<Utc>,
    pub restart_count: u32,
    pub health: String,
    pub exit_code: i32,
    pub oom_killed: bool,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub agent_name: String,
    pub alert_type: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,
    pub triggered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub status: AlertStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notified_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    agents: HashMap<String, AgentState>,
    alerts: HashMap<String, Alert>,
}

/// Concurrent store for agent snapshots and alerts.
pub struct StateStore {
    inner: RwLock<Inner>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Records a full metrics push, merging container state against the
    /// previous snapshot and carrying active alerts forward.
    pub async fn update_agent(&self, payload: MetricsPushPayload) {
        let now = Utc::now();
        let mut inner = self.inner.write().await;

        let previous = inner.agents.remove(&payload.agent_name);
        let (prior_containers, active_alerts) = match previous {
            Some(prev) => (prev.containers, prev.active_alerts),
            None => (Vec::new(), Vec::new()),
        };

        let containers =
            merge_containers(&prior_containers, &payload.system_metrics.containers, now);

        inner.agents.insert(
            payload.agent_name.clone(),
            AgentState {
                agent_name: payload.agent_name,
                cloud_metadata: payload.cloud_metadata,
                last_seen: now,
                status: AgentStatus::Online,
                system_metrics: payload.system_metrics,
                containers,
                active_alerts,
            },
        );
    }

    /// Records a heartbeat. Creates a minimal agent record when the agent
    /// has never pushed metrics, so liveness tracking works from the first
    /// ping.
    pub async fn update_heartbeat(&self, agent_name: &str) {
        let now = Utc::now();
        let mut inner = self.inner.write().await;

        match inner.agents.get_mut(agent_name) {
            Some(agent) => {
                agent.last_seen = now;
                agent.status = AgentStatus::Online;
            }
            None => {
                inner.agents.insert(
                    agent_name.to_string(),
                    AgentState {
                        agent_name: agent_name.to_string(),
                        cloud_metadata: None,
                        last_seen: now,
                        status: AgentStatus::Online,
                        system_metrics: SystemMetrics::default(),
                        containers: Vec::new(),
                        active_alerts: Vec::new(),
                    },
                );
            }
        }
    }

    pub async fn get_agent(&self, agent_name: &str) -> Option<AgentState> {
        self.inner.read().await.agents.get(agent_name).cloned()
    }

    pub async fn get_all_agents(&self) -> Vec<AgentState> {
        let mut agents: Vec<_> = self.inner.read().await.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_name.cmp(&b.agent_name));
        agents
    }

    /// Flips agents whose last_seen is older than `timeout` to offline and
    /// returns copies of the ones that changed on this call. Already-offline
    /// agents are skipped, so a second sweep returns nothing new.
    pub async fn check_offline_agents(&self, timeout: Duration) -> Vec<AgentState> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;

        let mut flipped = Vec::new();
        for agent in inner.agents.values_mut() {
            if agent.status == AgentStatus::Online && now - agent.last_seen > timeout {
                agent.status = AgentStatus::Offline;
                flipped.push(agent.clone());
            }
        }
        flipped
    }

    /// Registers an alert and attaches it to the agent's active list when
    /// the agent is known.
    pub async fn add_alert(&self, alert: Alert) {
        let mut inner = self.inner.write().await;
        if let Some(agent) = inner.agents.get_mut(&alert.agent_name) {
            agent.active_alerts.push(alert.clone());
        }
        inner.alerts.insert(alert.id.clone(), alert);
    }

    /// Marks an alert resolved and detaches it from its agent's active
    /// list. Returns false for unknown or already-resolved alerts.
    pub async fn resolve_alert(&self, alert_id: &str) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.write().await;

        let Some(alert) = inner.alerts.get_mut(alert_id) else {
            return false;
        };
        if alert.status == AlertStatus::Resolved {
            return false;
        }
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(now);
        let agent_name = alert.agent_name.clone();

        if let Some(agent) = inner.agents.get_mut(&agent_name) {
            agent.active_alerts.retain(|a| a.id != alert_id);
        }
        true
    }

    /// Stamps the successful-notification time on a stored alert.
    pub async fn mark_alert_notified(&self, alert_id: &str) {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        if let Some(alert) = inner.alerts.get_mut(alert_id) {
            alert.notified_at = Some(now);
        }
    }

    pub async fn get_alert(&self, alert_id: &str) -> Option<Alert> {
        self.inner.read().await.alerts.get(alert_id).cloned()
    }

    pub async fn get_active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<_> = self
            .inner
            .read()
            .await
            .alerts
            .values()
            .filter(|a| a.status == AlertStatus::Active)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        alerts
    }

    pub async fn get_alerts_by_agent(&self, agent_name: &str) -> Vec<Alert> {
        let mut alerts: Vec<_> = self
            .inner
            .read()
            .await
            .alerts
            .values()
            .filter(|a| a.agent_name == agent_name)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        alerts
    }

    /// Online/offline/active-alert counters for the health endpoint.
    pub async fn counters(&self) -> (usize, usize, usize) {
        let inner = self.inner.read().await;
        let online = inner
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Online)
            .count();
        let offline = inner.agents.len() - online;
        let active = inner
            .alerts
            .values()
            .filter(|a| a.status == AlertStatus::Active)
            .count();
        (online, offline, active)
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Merges incoming container metrics against the prior snapshot.
///
/// `previous_state` and `last_state_change` only move when the runtime state
/// actually differs from the stored one; repeated pushes with an unchanged
/// state keep the original transition timestamp. Containers absent from the
/// incoming snapshot are dropped.
fn merge_containers(
    prior: &[ContainerState],
    incoming: &[ContainerMetrics],
    now: DateTime<Utc>,
) -> Vec<ContainerState> {
    incoming
        .iter()
        .map(|c| {
            let (previous_state, last_state_change) =
                match prior.iter().find(|p| p.id == c.id) {
                    Some(p) if p.state != c.state => (p.state.clone(), now),
                    Some(p) => (p.previous_state.clone(), p.last_state_change),
                    None => (String::new(), now),
                };
            ContainerState {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.image.clone(),
                state: c.state.clone(),
                previous_state,
                last_state_change,
                restart_count: c.restart_count,
                health: c.health.clone(),
                exit_code: c.exit_code,
                oom_killed: c.oom_killed,
                cpu_percent: c.cpu_percent,
                memory_percent: c.memory_percent,
                memory_usage: c.memory_usage,
                memory_limit: c.memory_limit,
            }
        })
        .collect()
}
