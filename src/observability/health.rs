//! Subsystem health tracking
//!
//! Each subsystem (registry, capacity cache, reconciler, platform API)
//! reports healthy or unhealthy with a message and timestamp; the health
//! endpoint aggregates them into a single 200/503 answer.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Health status of a subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Subsystem is functioning normally
    Healthy,
    /// Subsystem has failed
    Unhealthy,
}

/// Information about a subsystem's health
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    /// Current status
    pub status: ComponentStatus,
    /// Explanation when unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix timestamp of the last check
    pub last_checked: i64,
}

impl ComponentHealth {
    /// A healthy report stamped now
    pub fn healthy() -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: None,
            last_checked: chrono::Utc::now().timestamp(),
        }
    }

    /// An unhealthy report stamped now
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: ComponentStatus::Unhealthy,
            message: Some(message.into()),
            last_checked: chrono::Utc::now().timestamp(),
        }
    }
}

/// Aggregate health response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Aggregate status: unhealthy if any subsystem is
    pub status: ComponentStatus,
    /// Per-subsystem map
    pub components: HashMap<String, ComponentHealth>,
}

/// Subsystem names tracked by the health checker
pub mod components {
    /// Model registry reachability
    pub const REGISTRY: &str = "registry";
    /// Capacity cache freshness
    pub const CAPACITY_CACHE: &str = "capacity_cache";
    /// Reconciler / leader status
    pub const RECONCILER: &str = "reconciler";
    /// Container platform API reachability
    pub const PLATFORM_API: &str = "platform_api";
}

/// Registry for subsystem health reports
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
}

impl HealthRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subsystem with an initial healthy status
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    /// Replace a subsystem's health report
    pub async fn update(&self, name: &str, health: ComponentHealth) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), health);
    }

    /// Mark a subsystem healthy
    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    /// Mark a subsystem unhealthy
    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Aggregate the current reports
    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = if components
            .values()
            .any(|h| h.status == ComponentStatus::Unhealthy)
        {
            ComponentStatus::Unhealthy
        } else {
            ComponentStatus::Healthy
        };
        HealthResponse { status, components }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_one_unhealthy_component_degrades_aggregate() {
        let registry = HealthRegistry::new();
        registry.register(components::REGISTRY).await;
        registry.register(components::PLATFORM_API).await;

        registry
            .set_unhealthy(components::PLATFORM_API, "connection refused")
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        assert_eq!(
            health.components[components::REGISTRY].status,
            ComponentStatus::Healthy
        );
        assert_eq!(
            health.components[components::PLATFORM_API].status,
            ComponentStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_recovery_restores_aggregate() {
        let registry = HealthRegistry::new();
        registry
            .set_unhealthy(components::CAPACITY_CACHE, "stale")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);

        registry.set_healthy(components::CAPACITY_CACHE).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_reports_carry_message_and_timestamp() {
        let registry = HealthRegistry::new();
        registry
            .set_unhealthy(components::REGISTRY, "catalog unreadable")
            .await;

        let health = registry.health().await;
        let report = &health.components[components::REGISTRY];
        assert_eq!(report.message.as_deref(), Some("catalog unreadable"));
        assert!(report.last_checked > 0);
    }
}
