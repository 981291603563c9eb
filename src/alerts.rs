//! Periodic alert evaluation over the state store.
//!
//! The engine runs one synchronous pass per tick: offline sweep first, then
//! system thresholds and container conditions for every online agent. A
//! windowed dedup map keeps repeat conditions from re-notifying; a key is
//! marked only after the notifier succeeded, so a failed delivery is retried
//! on the next pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::AlertingConfig;
use crate::notify::Notifier;
use crate::state::{AgentState, AgentStatus, Alert, AlertStatus, Severity, StateStore};

// Container high-water marks are fixed, unlike the configurable system
// thresholds.
const CONTAINER_CPU_LIMIT: f64 = 90.0;
const CONTAINER_MEMORY_LIMIT: f64 = 95.0;

pub struct AlertEngine {
    store: Arc<StateStore>,
    config: AlertingConfig,
    notifier: Arc<dyn Notifier>,
    recent: HashMap<String, Instant>,
}

impl AlertEngine {
    pub fn new(store: Arc<StateStore>, config: AlertingConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            config,
            notifier,
            recent: HashMap::new(),
        }
    }

    /// Evaluation loop. Returns when the token is cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("alert engine disabled by config");
            return;
        }

        let check_interval = Duration::from_secs(self.config.check_interval_secs);
        info!(?check_interval, "alert engine started");

        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // interval fires immediately; skip the startup tick so agents get a
        // chance to report before the first offline sweep.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_checks().await,
                _ = cancel.cancelled() => {
                    info!("alert engine stopping");
                    return;
                }
            }
        }
    }

    /// One full evaluation pass.
    pub async fn run_checks(&mut self) {
        self.check_offline_agents().await;

        let agents = self.store.get_all_agents().await;
        for agent in &agents {
            if agent.status == AgentStatus::Online {
                self.check_system_alerts(agent).await;
                self.check_container_alerts(agent).await;
            }
        }

        self.cleanup_dedup();
    }

    async fn check_offline_agents(&mut self) {
        let timeout = chrono::Duration::seconds(self.config.heartbeat_timeout_secs as i64);
        let offline = self.store.check_offline_agents(timeout).await;

        for agent in offline {
            let key = format!("agent_offline:{}", agent.agent_name);
            if !self.should_send(&key) {
                continue;
            }
            let alert = Alert {
                id: Uuid::new_v4().to_string(),
                agent_name: agent.agent_name.clone(),
                alert_type: "agent_offline".to_string(),
                severity: Severity::Critical,
                message: format!(
                    "Agent {} has not reported since {}",
                    agent.agent_name,
                    agent.last_seen.to_rfc3339()
                ),
                details: HashMap::from([
                    ("agent_name".to_string(), agent.agent_name.clone().into()),
                    (
                        "last_seen".to_string(),
                        agent.last_seen.to_rfc3339().into(),
                    ),
                ]),
                triggered_at: Utc::now(),
                resolved_at: None,
                status: AlertStatus::Active,
                notified_at: None,
            };
            self.dispatch(alert, key).await;
        }
    }

    async fn check_system_alerts(&mut self, agent: &AgentState) {
        let metrics = &agent.system_metrics;

        // A threshold of zero (or below) disables that check.
        if self.config.cpu_threshold > 0.0 && metrics.cpu.usage_percent > self.config.cpu_threshold
        {
            let key = format!("system_cpu:{}", agent.agent_name);
            if self.should_send(&key) {
                let alert = threshold_alert(
                    agent,
                    "system_cpu_high",
                    Severity::Warning,
                    format!(
                        "High CPU on {}: {:.1}%",
                        agent.agent_name, metrics.cpu.usage_percent
                    ),
                    [("cpu_percent".to_string(), metrics.cpu.usage_percent.into())],
                );
                self.dispatch(alert, key).await;
            }
        }

        if self.config.memory_threshold > 0.0
            && metrics.memory.used_percent > self.config.memory_threshold
        {
            let key = format!("system_memory:{}", agent.agent_name);
            if self.should_send(&key) {
                let alert = threshold_alert(
                    agent,
                    "system_memory_high",
                    Severity::Warning,
                    format!(
                        "High memory on {}: {:.1}%",
                        agent.agent_name, metrics.memory.used_percent
                    ),
                    [(
                        "memory_percent".to_string(),
                        metrics.memory.used_percent.into(),
                    )],
                );
                self.dispatch(alert, key).await;
            }
        }

        // Each mount alerts independently.
        for disk in &metrics.disk {
            if self.config.disk_threshold > 0.0 && disk.used_percent > self.config.disk_threshold {
                let key = format!("system_disk:{}:{}", agent.agent_name, disk.mount_point);
                if self.should_send(&key) {
                    let alert = threshold_alert(
                        agent,
                        "system_disk_high",
                        Severity::Critical,
                        format!(
                            "High disk usage on {} at {}: {:.1}%",
                            agent.agent_name, disk.mount_point, disk.used_percent
                        ),
                        [
                            ("mount_point".to_string(), disk.mount_point.clone().into()),
                            ("disk_percent".to_string(), disk.used_percent.into()),
                        ],
                    );
                    self.dispatch(alert, key).await;
                }
            }
        }
    }

    async fn check_container_alerts(&mut self, agent: &AgentState) {
        for container in &agent.containers {
            if container.previous_state == "running"
                && (container.state == "exited" || container.state == "dead")
            {
                let key = format!("container_stopped:{}:{}", agent.agent_name, container.id);
                if self.should_send(&key) {
                    let alert = threshold_alert(
                        agent,
                        "container_stopped",
                        Severity::Critical,
                        format!(
                            "Container {} on {} went {} (exit code {})",
                            container.name, agent.agent_name, container.state, container.exit_code
                        ),
                        [
                            ("container_id".to_string(), container.id.clone().into()),
                            ("container_name".to_string(), container.name.clone().into()),
                            ("state".to_string(), container.state.clone().into()),
                            (
                                "previous_state".to_string(),
                                container.previous_state.clone().into(),
                            ),
                            ("exit_code".to_string(), container.exit_code.into()),
                            ("oom_killed".to_string(), container.oom_killed.into()),
                        ],
                    );
                    self.dispatch(alert, key).await;
                }
            }

            if container.health == "unhealthy" {
                let key = format!("container_unhealthy:{}:{}", agent.agent_name, container.id);
                if self.should_send(&key) {
                    let alert = threshold_alert(
                        agent,
                        "container_unhealthy",
                        Severity::Warning,
                        format!(
                            "Container {} on {} is unhealthy",
                            container.name, agent.agent_name
                        ),
                        [
                            ("container_id".to_string(), container.id.clone().into()),
                            ("container_name".to_string(), container.name.clone().into()),
                            ("health".to_string(), container.health.clone().into()),
                        ],
                    );
                    self.dispatch(alert, key).await;
                }
            }

            if container.cpu_percent > CONTAINER_CPU_LIMIT {
                let key = format!("container_cpu:{}:{}", agent.agent_name, container.id);
                if self.should_send(&key) {
                    let alert = threshold_alert(
                        agent,
                        "container_cpu_high",
                        Severity::Warning,
                        format!(
                            "Container {} on {} at {:.1}% CPU",
                            container.name, agent.agent_name, container.cpu_percent
                        ),
                        [
                            ("container_id".to_string(), container.id.clone().into()),
                            ("container_name".to_string(), container.name.clone().into()),
                            ("cpu_percent".to_string(), container.cpu_percent.into()),
                        ],
                    );
                    self.dispatch(alert, key).await;
                }
            }

            if container.memory_percent > CONTAINER_MEMORY_LIMIT {
                let key = format!("container_memory:{}:{}", agent.agent_name, container.id);
                if self.should_send(&key) {
                    let alert = threshold_alert(
                        agent,
                        "container_memory_high",
                        Severity::Critical,
                        format!(
                            "Container {} on {} at {:.1}% memory",
                            container.name, agent.agent_name, container.memory_percent
                        ),
                        [
                            ("container_id".to_string(), container.id.clone().into()),
                            ("container_name".to_string(), container.name.clone().into()),
                            (
                                "memory_percent".to_string(),
                                container.memory_percent.into(),
                            ),
                        ],
                    );
                    self.dispatch(alert, key).await;
                }
            }
        }
    }

    /// Stores the alert, notifies, and only marks the dedup key when the
    /// notification went out.
    async fn dispatch(&mut self, alert: Alert, key: String) {
        let alert_id = alert.id.clone();
        self.store.add_alert(alert.clone()).await;

        match self.notifier.send_alert(&alert).await {
            Ok(()) => {
                self.store.mark_alert_notified(&alert_id).await;
                self.recent.insert(key, Instant::now());
                debug!(alert_type = %alert.alert_type, agent = %alert.agent_name, "alert sent");
            }
            Err(err) => {
                error!(
                    alert_type = %alert.alert_type,
                    agent = %alert.agent_name,
                    "failed to send alert notification: {err:#}"
                );
            }
        }
    }

    fn should_send(&self, key: &str) -> bool {
        if !self.config.dedup_enabled {
            return true;
        }
        match self.recent.get(key) {
            Some(last_sent) => {
                last_sent.elapsed() > Duration::from_secs(self.config.dedup_window_secs)
            }
            None => true,
        }
    }

    fn cleanup_dedup(&mut self) {
        let cutoff = Duration::from_secs(self.config.dedup_window_secs * 2);
        let before = self.recent.len();
        self.recent.retain(|_, last_sent| last_sent.elapsed() <= cutoff);
        let removed = before - self.recent.len();
        if removed > 0 {
            debug!(removed, "pruned stale dedup entries");
        }
    }
}

fn threshold_alert<const N: usize>(
    agent: &AgentState,
    alert_type: &str,
    severity: Severity,
    message: String,
    details: [(String, serde_json::Value); N],
) -> Alert {
    let mut details: HashMap<_, _> = details.into_iter().collect();
    details.insert("agent_name".to_string(), agent.agent_name.clone().into());
    Alert {
        id: Uuid::new_v4().to_string(),
        agent_name: agent.agent_name.clone(),
        alert_type: alert_type.to_string(),
        severity,
        message,
        details,
        triggered_at: Utc::now(),
        resolved_at: None,
        status: AlertStatus::Active,
        notified_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContainerMetrics, MetricsPushPayload, SystemMetrics};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Records every alert it is asked to deliver; can be flipped to fail.
    struct RecordingNotifier {
        sent: Mutex<Vec<Alert>>,
        fail: AtomicBool,
    }

    impl RecordingNotifier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }

        fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        fn sent_types(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|a| a.alert_type.clone())
                .collect()
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_alert(&self, alert: &Alert) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("notifier down");
            }
            self.sent.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    fn test_config() -> AlertingConfig {
        AlertingConfig {
            enabled: true,
            check_interval_secs: 30,
            heartbeat_timeout_secs: 120,
            dedup_enabled: true,
            dedup_window_secs: 300,
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            disk_threshold: 90.0,
        }
    }

    fn setup(
        config: AlertingConfig,
    ) -> (Arc<StateStore>, Arc<RecordingNotifier>, AlertEngine) {
        let store = Arc::new(StateStore::new());
        let notifier = RecordingNotifier::new();
        let engine = AlertEngine::new(store.clone(), config, notifier.clone());
        (store, notifier, engine)
    }

    fn push_with_metrics(agent: &str, metrics: SystemMetrics) -> MetricsPushPayload {
        MetricsPushPayload {
            agent_name: agent.to_string(),
            timestamp: Utc::now(),
            cloud_metadata: None,
            system_metrics: metrics,
        }
    }

    fn cpu_metrics(usage: f64) -> SystemMetrics {
        SystemMetrics {
            cpu: crate::CpuMetrics {
                usage_percent: usage,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn cpu_over_threshold_alerts_once_per_window() {
        tokio::time::pause();
        let (store, notifier, mut engine) = setup(test_config());
        store.update_agent(push_with_metrics("web-1", cpu_metrics(92.0))).await;

        engine.run_checks().await;
        assert_eq!(notifier.sent_types(), vec!["system_cpu_high"]);

        // Condition persists within the window: no duplicate.
        engine.run_checks().await;
        assert_eq!(notifier.sent_count(), 1);

        // Window elapsed: re-notify.
        tokio::time::advance(Duration::from_secs(301)).await;
        store.update_agent(push_with_metrics("web-1", cpu_metrics(92.0))).await;
        engine.run_checks().await;
        assert_eq!(notifier.sent_count(), 2);
    }

    #[tokio::test]
    async fn dedup_disabled_notifies_every_pass() {
        let mut config = test_config();
        config.dedup_enabled = false;
        let (store, notifier, mut engine) = setup(config);
        store.update_agent(push_with_metrics("web-1", cpu_metrics(92.0))).await;

        engine.run_checks().await;
        engine.run_checks().await;
        assert_eq!(notifier.sent_count(), 2);
    }

    #[tokio::test]
    async fn zero_threshold_disables_check() {
        let mut config = test_config();
        config.cpu_threshold = 0.0;
        let (store, notifier, mut engine) = setup(config);
        store.update_agent(push_with_metrics("web-1", cpu_metrics(99.9))).await;

        engine.run_checks().await;
        assert_eq!(notifier.sent_count(), 0);
    }

    #[tokio::test]
    async fn each_mount_alerts_independently() {
        let (store, notifier, mut engine) = setup(test_config());
        let metrics = SystemMetrics {
            disk: vec![
                crate::DiskMetrics {
                    mount_point: "/".to_string(),
                    used_percent: 95.0,
                    ..Default::default()
                },
                crate::DiskMetrics {
                    mount_point: "/var".to_string(),
                    used_percent: 50.0,
                    ..Default::default()
                },
                crate::DiskMetrics {
                    mount_point: "/data".to_string(),
                    used_percent: 97.0,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        store.update_agent(push_with_metrics("web-1", metrics)).await;

        engine.run_checks().await;
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|a| a.alert_type == "system_disk_high"));
        assert!(sent.iter().all(|a| a.severity == Severity::Critical));
    }

    #[tokio::test]
    async fn container_stop_transition_is_critical() {
        let (store, notifier, mut engine) = setup(test_config());
        let running = SystemMetrics {
            containers: vec![ContainerMetrics {
                id: "c1".to_string(),
                name: "db".to_string(),
                state: "running".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        store.update_agent(push_with_metrics("web-1", running)).await;
        engine.run_checks().await;
        assert_eq!(notifier.sent_count(), 0);

        let exited = SystemMetrics {
            containers: vec![ContainerMetrics {
                id: "c1".to_string(),
                name: "db".to_string(),
                state: "exited".to_string(),
                exit_code: 137,
                oom_killed: true,
                ..Default::default()
            }],
            ..Default::default()
        };
        store.update_agent(push_with_metrics("web-1", exited)).await;
        engine.run_checks().await;

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].alert_type, "container_stopped");
        assert_eq!(sent[0].severity, Severity::Critical);
        assert_eq!(sent[0].details["exit_code"], serde_json::json!(137));
    }

    #[tokio::test]
    async fn unhealthy_and_high_memory_fire_in_one_pass() {
        let (store, notifier, mut engine) = setup(test_config());
        let metrics = SystemMetrics {
            containers: vec![ContainerMetrics {
                id: "c1".to_string(),
                name: "api".to_string(),
                state: "running".to_string(),
                health: "unhealthy".to_string(),
                memory_percent: 97.0,
                ..Default::default()
            }],
            ..Default::default()
        };
        store.update_agent(push_with_metrics("web-1", metrics)).await;

        engine.run_checks().await;
        let mut types = notifier.sent_types();
        types.sort();
        assert_eq!(types, vec!["container_memory_high", "container_unhealthy"]);
    }

    #[tokio::test]
    async fn failed_notification_leaves_alert_active_and_retries() {
        let (store, notifier, mut engine) = setup(test_config());
        store.update_agent(push_with_metrics("web-1", cpu_metrics(92.0))).await;

        notifier.set_failing(true);
        engine.run_checks().await;
        assert_eq!(notifier.sent_count(), 0);

        // The alert is recorded and stays active even though delivery failed.
        let active = store.get_active_alerts().await;
        assert_eq!(active.len(), 1);
        assert!(active[0].notified_at.is_none());

        // Delivery recovers: the dedup key was never marked, so the next
        // pass sends.
        notifier.set_failing(false);
        engine.run_checks().await;
        assert_eq!(notifier.sent_types(), vec!["system_cpu_high"]);
        let notified: Vec<_> = store
            .get_active_alerts()
            .await
            .into_iter()
            .filter(|a| a.notified_at.is_some())
            .collect();
        assert_eq!(notified.len(), 1);
    }

    #[tokio::test]
    async fn offline_agent_alerts_once() {
        let (store, notifier, mut engine) = setup(AlertingConfig {
            heartbeat_timeout_secs: 1,
            ..test_config()
        });
        store.update_heartbeat("web-1").await;
        tokio::time::sleep(Duration::from_millis(1100)).await;

        engine.run_checks().await;
        assert_eq!(notifier.sent_types(), vec!["agent_offline"]);

        // Still offline on the next pass: the sweep returns nothing new.
        engine.run_checks().await;
        assert_eq!(notifier.sent_count(), 1);
    }

    #[tokio::test]
    async fn offline_agent_skips_threshold_checks() {
        let (store, notifier, mut engine) = setup(AlertingConfig {
            heartbeat_timeout_secs: 1,
            ..test_config()
        });
        store.update_agent(push_with_metrics("web-1", cpu_metrics(92.0))).await;
        tokio::time::sleep(Duration::from_millis(1100)).await;

        engine.run_checks().await;
        // Only the offline alert; the stale CPU reading is not evaluated.
        assert_eq!(notifier.sent_types(), vec!["agent_offline"]);
    }

    #[tokio::test]
    async fn one_bad_agent_does_not_stop_the_pass() {
        let (store, notifier, mut engine) = setup(test_config());
        // Agent with empty metrics and no containers evaluates cleanly.
        store.update_heartbeat("empty").await;
        store.update_agent(push_with_metrics("web-1", cpu_metrics(92.0))).await;

        engine.run_checks().await;
        assert_eq!(notifier.sent_types(), vec!["system_cpu_high"]);
    }

    #[tokio::test]
    async fn stale_dedup_entries_are_pruned() {
        tokio::time::pause();
        let (store, notifier, mut engine) = setup(test_config());
        store.update_agent(push_with_metrics("web-1", cpu_metrics(92.0))).await;

        engine.run_checks().await;
        assert_eq!(engine.recent.len(), 1);

        // Past twice the window the entry is swept even if the condition
        // cleared meanwhile.
        store.update_agent(push_with_metrics("web-1", cpu_metrics(10.0))).await;
        tokio::time::advance(Duration::from_secs(601)).await;
        engine.run_checks().await;
        assert!(engine.recent.is_empty());
        assert_eq!(notifier.sent_count(), 1);
    }
}
