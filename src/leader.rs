//! Leader election via `coordination.k8s.io/v1` Lease
//!
//! Only the leader runs the reconcile controller; followers stay warm and
//! take over when the lease expires. The acquire/renew decision is a pure
//! function over the observed lease, which keeps it testable without a
//! cluster; the surrounding loop does the API traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Error;

/// Leader election configuration
#[derive(Clone, Debug)]
pub struct LeaderConfig {
    /// Name of the Lease object
    pub lock_name: String,
    /// Namespace holding the Lease
    pub namespace: String,
    /// How long a renewal is valid
    pub lease_duration: Duration,
    /// How often the holder renews (and candidates re-check)
    pub renew_interval: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lock_name: "kiln-leader".to_string(),
            namespace: "default".to_string(),
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
        }
    }
}

/// What a candidate should do after observing the lease
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LeaseAction {
    /// Lease is vacant or expired: take it
    Acquire,
    /// We hold the lease: refresh the renew time
    Renew,
    /// Another holder's lease is still valid: wait
    Wait,
}

/// Decide the next action from the observed lease state.
fn lease_decision(
    lease: Option<&LeaseSpec>,
    identity: &str,
    now: DateTime<Utc>,
    lease_duration: Duration,
) -> LeaseAction {
    let Some(spec) = lease else {
        return LeaseAction::Acquire;
    };

    match spec.holder_identity.as_deref() {
        None | Some("") => LeaseAction::Acquire,
        Some(holder) if holder == identity => LeaseAction::Renew,
        Some(_) => {
            let renewed = spec
                .renew_time
                .as_ref()
                .map(|t| t.0)
                .or_else(|| spec.acquire_time.as_ref().map(|t| t.0));
            let valid_for = spec
                .lease_duration_seconds
                .map(|s| Duration::from_secs(s.max(0) as u64))
                .unwrap_or(lease_duration);

            match renewed {
                Some(renewed) if now.signed_duration_since(renewed).to_std().ok()
                    .map(|age| age < valid_for)
                    .unwrap_or(true) =>
                {
                    LeaseAction::Wait
                }
                // Never renewed or expired: the holder is gone
                _ => LeaseAction::Acquire,
            }
        }
    }
}

/// Read-only view of leadership for other tasks
#[derive(Clone)]
pub struct LeadershipHandle {
    is_leader: Arc<AtomicBool>,
    changed: tokio::sync::watch::Receiver<bool>,
}

impl LeadershipHandle {
    /// Whether this process currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    /// Wait until leadership is held or the token fires.
    ///
    /// Returns true when leadership was obtained.
    pub async fn wait_for_leadership(&self, cancel: &CancellationToken) -> bool {
        let mut changed = self.changed.clone();
        loop {
            if *changed.borrow() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                result = changed.changed() => {
                    if result.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

/// Lease-based leader elector
pub struct LeaderElector {
    client: Client,
    config: LeaderConfig,
    identity: String,
    is_leader: Arc<AtomicBool>,
    sender: tokio::sync::watch::Sender<bool>,
    receiver: tokio::sync::watch::Receiver<bool>,
}

impl LeaderElector {
    /// Create an elector with a unique process identity
    pub fn new(client: Client, config: LeaderConfig) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "kiln".to_string());
        let identity = format!("{host}-{}", uuid::Uuid::new_v4());
        let (sender, receiver) = tokio::sync::watch::channel(false);
        Self {
            client,
            config,
            identity,
            is_leader: Arc::new(AtomicBool::new(false)),
            sender,
            receiver,
        }
    }

    /// Handle for observing leadership from other tasks
    pub fn handle(&self) -> LeadershipHandle {
        LeadershipHandle {
            is_leader: self.is_leader.clone(),
            changed: self.receiver.clone(),
        }
    }

    fn leases(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn desired_lease(
        &self,
        acquire: bool,
        previous: Option<&LeaseSpec>,
        resource_version: Option<String>,
    ) -> Lease {
        let now = MicroTime(Utc::now());
        let transitions = previous
            .and_then(|s| s.lease_transitions)
            .unwrap_or(0);

        Lease {
            metadata: kube::api::ObjectMeta {
                name: Some(self.config.lock_name.clone()),
                namespace: Some(self.config.namespace.clone()),
                // Optimistic concurrency: a concurrent takeover makes the
                // replace fail with a conflict instead of splitting the lock
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.config.lease_duration.as_secs() as i32),
                acquire_time: if acquire {
                    Some(now.clone())
                } else {
                    previous.and_then(|s| s.acquire_time.clone())
                },
                renew_time: Some(now),
                lease_transitions: Some(if acquire { transitions + 1 } else { transitions }),
                ..Default::default()
            }),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let api = self.leases();
        let existing = api.get_opt(&self.config.lock_name).await?;
        let spec = existing.as_ref().and_then(|l| l.spec.as_ref());

        let action = lease_decision(spec, &self.identity, Utc::now(), self.config.lease_duration);
        match action {
            LeaseAction::Wait => Ok(false),
            LeaseAction::Acquire | LeaseAction::Renew => {
                let acquire = action == LeaseAction::Acquire;
                let resource_version = existing
                    .as_ref()
                    .and_then(|l| l.metadata.resource_version.clone());
                let lease = self.desired_lease(acquire, spec, resource_version);
                if existing.is_some() {
                    api.replace(&self.config.lock_name, &PostParams::default(), &lease)
                        .await?;
                } else {
                    api.create(&PostParams::default(), &lease).await?;
                }
                if acquire {
                    info!(identity = %self.identity, lock = %self.config.lock_name, "acquired leadership");
                }
                Ok(true)
            }
        }
    }

    async fn release(&self) {
        let api = self.leases();
        let patch = serde_json::json!({ "spec": { "holderIdentity": null, "renewTime": null } });
        match api
            .patch(
                &self.config.lock_name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => info!(lock = %self.config.lock_name, "released leadership lease"),
            Err(e) => warn!(error = %e, "failed to release leadership lease"),
        }
    }

    fn set_leader(&self, leading: bool) {
        let was = self.is_leader.swap(leading, Ordering::Relaxed);
        if was != leading {
            let _ = self.sender.send(leading);
        }
    }

    /// Run the acquire/renew loop until cancelled; releases the lease on
    /// the way out if we hold it.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.renew_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.try_acquire_or_renew().await {
                Ok(leading) => {
                    if self.is_leader.load(Ordering::Relaxed) && !leading {
                        warn!(identity = %self.identity, "lost leadership");
                    }
                    self.set_leader(leading);
                }
                Err(e) => {
                    debug!(error = %e, "lease check failed");
                    // A holder that cannot reach the API must not keep
                    // acting as leader past its lease
                    self.set_leader(false);
                }
            }
        }

        if self.is_leader.load(Ordering::Relaxed) {
            self.release().await;
        }
        self.set_leader(false);
    }
}
