use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

/// Liveness reporting for the long-running loops of a consumer process.
///
/// A consumer runtime is only trustworthy while its drains and dispatch
/// loops are actually turning. Each loop registers itself here and reports
/// on every cycle; a loop that stops reporting before its deadline is
/// considered stalled and takes the overall status down with it.

#[derive(Default, Debug)]
pub struct LivenessStatus {
    /// True when every registered component reported within its deadline.
    pub healthy: bool,
    /// Last known status of each component, for display.
    pub components: HashMap<String, ComponentStatus>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered but has not reported yet.
    Starting,
    /// Reported healthy; must report again before the instant passes.
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy.
    Unhealthy,
    /// Missed its reporting deadline.
    Stalled,
}

struct StatusUpdate {
    component: String,
    status: ComponentStatus,
}

/// Handle given to a component so it can report its status.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<StatusUpdate>,
}

impl HealthHandle {
    /// Report healthy until `deadline` from now. Must be called more often
    /// than the deadline the component registered with.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let update = StatusUpdate {
            component: self.component.clone(),
            status,
        };
        if self.sender.send(update).await.is_err() {
            warn!(component = %self.component, "liveness registry is gone");
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<StatusUpdate>,
}

impl HealthRegistry {
    /// Creates a registry and spawns the task that folds component reports
    /// into it. Must be called from within a tokio runtime.
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<StatusUpdate>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    _ = map.insert(update.component, update.status);
                } else {
                    // Poisoned lock: the probes will fail and the process restart
                    warn!("poisoned liveness registry lock")
                }
            }
        });

        registry
    }

    /// Registers a component. The returned handle should be handed to the
    /// component so it can report on every cycle of its loop.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Folds all component reports into the overall liveness status.
    pub fn get_status(&self) -> LivenessStatus {
        let Ok(components) = self.components.read() else {
            warn!(registry = %self.name, "poisoned liveness registry lock");
            return LivenessStatus::default();
        };

        let now = time::OffsetDateTime::now_utc();
        let mut status = LivenessStatus {
            // Unhealthy until at least one component has registered.
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, component) in components.iter() {
            match component {
                ComponentStatus::HealthyUntil(until) if until.gt(&now) => {
                    _ = status.components.insert(name.clone(), component.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    status.healthy = false;
                    _ = status
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                _ => {
                    status.healthy = false;
                    _ = status.components.insert(name.clone(), component.clone());
                }
            }
        }

        if !status.healthy {
            warn!(registry = %self.name, components = ?status.components, "liveness check failed");
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Sub;
    use std::time::Duration;
    use time::OffsetDateTime;

    async fn assert_eventually<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = OffsetDateTime::now_utc().add(time::Duration::seconds(5));
        while !check() && OffsetDateTime::now_utc().lt(&deadline) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn component_lifecycle() {
        let registry = HealthRegistry::new("liveness");

        let handle = registry
            .register("drain".to_string(), Duration::from_secs(30))
            .await;
        assert_eventually(|| registry.get_status().components.len() == 1).await;
        assert_eq!(
            registry.get_status().components.get("drain"),
            Some(&ComponentStatus::Starting)
        );
        assert!(!registry.get_status().healthy);

        handle.report_healthy().await;
        assert_eventually(|| registry.get_status().healthy).await;

        handle.report_status(ComponentStatus::Unhealthy).await;
        assert_eventually(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("dispatch".to_string(), Duration::from_secs(30))
            .await;

        handle.report_healthy().await;
        assert_eventually(|| registry.get_status().healthy).await;

        handle
            .report_status(ComponentStatus::HealthyUntil(
                OffsetDateTime::now_utc().sub(time::Duration::seconds(1)),
            ))
            .await;
        assert_eventually(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("dispatch"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[tokio::test]
    async fn all_components_must_report() {
        let registry = HealthRegistry::new("liveness");
        let one = registry
            .register("one".to_string(), Duration::from_secs(30))
            .await;
        let two = registry
            .register("two".to_string(), Duration::from_secs(30))
            .await;
        assert_eventually(|| registry.get_status().components.len() == 2).await;

        one.report_healthy().await;
        assert_eventually(|| {
            registry.get_status().components.get("one") != Some(&ComponentStatus::Starting)
        })
        .await;
        assert!(!registry.get_status().healthy);

        two.report_healthy().await;
        assert_eventually(|| registry.get_status().healthy).await;
    }
}
