use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Liveness reporting for the long-running loops of the bridge.
///
/// Each loop (the consumer iteration, the rdkafka client threads) registers a component and must
/// keep reporting healthy before its deadline runs out. The process is healthy only while every
/// registered component is. A component that misses its deadline is reported as stalled, which
/// is how a consumer stuck in an endless retry shows up to the orchestrator.
///
/// Keep one registry per probe: liveness and readiness answer different questions.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True if every registered component is healthy
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, has not reported yet
    Starting,
    /// Must report again before this date
    HealthyUntil(OffsetDateTime),
    Unhealthy,
    /// Missed its HealthyUntil deadline
    Stalled,
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report healthy until now + deadline. Returns once the report is queued.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        if let Err(err) = self.sender.send(self.message(status)).await {
            warn!(component = %self.component, "failed to report health status: {}", err)
        }
    }

    /// Blocking variant of `report_healthy`, for callbacks running outside the runtime such as
    /// rdkafka's statistics callback.
    pub fn report_healthy_blocking(&self) {
        self.report_status_blocking(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    pub fn report_status_blocking(&self, status: ComponentStatus) {
        if let Err(err) = self.sender.blocking_send(self.message(status)) {
            warn!(component = %self.component, "failed to report health status: {}", err)
        }
    }

    fn message(&self, status: ComponentStatus) -> HealthMessage {
        HealthMessage {
            component: self.component.clone(),
            status,
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    /// Create a registry and spawn the task applying reports to it. Must be called from within a
    /// tokio runtime.
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match components.write() {
                    Ok(mut map) => {
                        _ = map.insert(message.component, message.status);
                    }
                    // The probes will fail and the process will be restarted.
                    Err(_) => warn!("poisoned health registry lock"),
                }
            }
        });

        registry
    }

    /// Register a component, which starts in `Starting` until it first reports.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Compute the process status from every registered component. Usable as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned registry lock", self.name);
            return HealthStatus::default();
        };

        let now = OffsetDateTime::now_utc();
        // Unhealthy until at least one component has registered.
        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if *until > now => status.clone(),
                ComponentStatus::HealthyUntil(_) => {
                    result.healthy = false;
                    ComponentStatus::Stalled
                }
                _ => {
                    result.healthy = false;
                    status.clone()
                }
            };
            _ = result.components.insert(name.clone(), status);
        }

        match result.healthy {
            true => debug!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}
