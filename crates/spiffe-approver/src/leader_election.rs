//! Leader election using Kubernetes Leases
//!
//! The approver is a cluster singleton: only the holder of the lease runs
//! reconciliations. Every claim is a compare-and-swap: the lease is read,
//! classified, and written back through a resourceVersion-guarded replace,
//! so two candidates acting on the same observation cannot both win.
//!
//! Split-brain is prevented by timing: `lease_duration` (30s) >
//! `renew_interval` (10s) means a leader that loses its lease stops
//! renewing well before the next candidate can treat the lease as expired.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// Timing constants (not public - use new() defaults)
const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// What one observation of the lease means for this candidate
#[derive(Debug, PartialEq, Eq)]
enum LeaseState {
    /// We are the current holder and only need to renew
    HeldByUs,
    /// Another holder's claim is still within its duration
    HeldByOther,
    /// Nobody can defend the lease: no holder, no renew time, or the
    /// renew time plus duration has passed
    Claimable {
        /// Transition count observed on the lease, to be incremented on
        /// takeover
        transitions: i32,
    },
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaderElector {
    /// Create a new leader elector with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
        }
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard maintains leadership through periodic renewal. When the
    /// guard is dropped or leadership is lost, the lost channel signals.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            namespace = %self.namespace,
            "waiting for leadership..."
        );

        loop {
            match self.try_claim().await {
                Ok(true) => break,
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.retry_interval.as_secs(),
                        "lease unavailable, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "failed to claim lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }

        info!(identity = %self.identity, "leadership acquired");

        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(&self);
        let renewal_task = tokio::spawn(async move {
            elector.keep_renewed(lost_tx).await;
        });

        LeaderGuard {
            identity: self.identity.clone(),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// One claim attempt: read, classify, and conditionally write back.
    /// Returns whether we hold the lease afterwards. A lost write race is
    /// not an error, just a failed claim.
    async fn try_claim(&self) -> Result<bool, LeaderElectionError> {
        let api = self.api();
        let now = Utc::now();

        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            return self.create(&api, now).await;
        };

        match self.classify(&lease, now) {
            LeaseState::HeldByOther => Ok(false),
            LeaseState::HeldByUs => {
                let outcome = self.swap(&api, lease, now, None).await?;
                if outcome {
                    debug!(identity = %self.identity, "lease renewed");
                }
                Ok(outcome)
            }
            LeaseState::Claimable { transitions } => {
                let outcome = self.swap(&api, lease, now, Some(transitions + 1)).await?;
                if outcome {
                    info!(
                        identity = %self.identity,
                        transitions = transitions + 1,
                        "took over lapsed lease"
                    );
                }
                Ok(outcome)
            }
        }
    }

    /// Decide what the observed lease allows this candidate to do.
    fn classify(&self, lease: &Lease, now: DateTime<Utc>) -> LeaseState {
        let Some(spec) = lease.spec.as_ref() else {
            return LeaseState::Claimable { transitions: 0 };
        };

        if spec.holder_identity.as_deref() == Some(self.identity.as_str()) {
            return LeaseState::HeldByUs;
        }

        let defended_until = spec
            .renew_time
            .as_ref()
            .zip(spec.lease_duration_seconds)
            .map(|(renewed, secs)| renewed.0 + chrono::Duration::seconds(i64::from(secs)));

        match defended_until {
            Some(deadline) if now <= deadline => LeaseState::HeldByOther,
            _ => LeaseState::Claimable {
                transitions: spec.lease_transitions.unwrap_or(0),
            },
        }
    }

    /// The spec this candidate writes when it owns the lease.
    fn owned_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    /// First claimant creates the lease; a 409 means another candidate got
    /// there first.
    async fn create(
        &self,
        api: &Api<Lease>,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.owned_spec(now, 0)),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "created fresh lease");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Write our claim back at the resourceVersion we observed. With
    /// `took_over` the full ownership spec is installed; otherwise only the
    /// renew time moves. A 409 means the lease changed underneath us and
    /// the claim is forfeit.
    async fn swap(
        &self,
        api: &Api<Lease>,
        mut lease: Lease,
        now: DateTime<Utc>,
        took_over: Option<i32>,
    ) -> Result<bool, LeaderElectionError> {
        match took_over {
            Some(transitions) => lease.spec = Some(self.owned_spec(now, transitions)),
            None => {
                let spec = lease.spec.get_or_insert_with(Default::default);
                spec.renew_time = Some(MicroTime(now));
            }
        }

        match api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Renew on an interval until a claim fails, then signal loss. Any
    /// failure to confirm our own hold counts as loss; the caller exits
    /// rather than risk reconciling without the lease.
    async fn keep_renewed(self: Arc<Self>, lost_tx: oneshot::Sender<()>) {
        let mut ticker = tokio::time::interval(self.renew_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if !matches!(self.try_claim().await, Ok(true)) {
                warn!(identity = %self.identity, "leadership lost");
                let _ = lost_tx.send(());
                return;
            }
        }
    }
}

/// Guard that maintains leadership
///
/// While this guard exists, the elector holds leadership and periodically
/// renews the lease. Use `lost()` to wait for leadership loss. The renewal
/// task is aborted when the guard is dropped.
pub struct LeaderGuard {
    identity: String,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
        info!(identity = %self.identity, "leadership released");
    }
}
