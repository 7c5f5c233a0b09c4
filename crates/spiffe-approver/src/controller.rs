//! Approver controller
//!
//! Watches CertificateRequests cluster-wide and, for requests that match the
//! configured issuerRef and have no terminal condition yet, runs the
//! evaluator and writes exactly one of the Approved/Denied conditions.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::PostParams;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, warn};

use spiffe_common::crd::{approved_condition, denied_condition, CertificateRequest, IssuerRef};
use spiffe_common::{Error, DRIVER_NAME};

use crate::evaluator::Evaluator;

/// Shared state for the approver reconciler
pub struct Context {
    /// Kubernetes client
    pub client: Client,

    /// The issuerRef that requests must match to be evaluated
    pub issuer_ref: IssuerRef,

    /// Policy over matched requests
    pub evaluator: Evaluator,
}

/// Reconcile a single CertificateRequest.
///
/// Requests that are deleted, already terminal, or reference a different
/// issuer are ignored. For everything else exactly one of Approved/Denied is
/// written to the status subresource.
pub async fn reconcile(
    req: Arc<CertificateRequest>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = req.name_any();
    let namespace = req.namespace().unwrap_or_default();
    debug!(%namespace, %name, "syncing certificaterequest");

    let api: Api<CertificateRequest> = Api::namespaced(ctx.client.clone(), &namespace);

    // Re-read the request so the filter and the decision run on the latest
    // view. A request we cannot read cannot be filtered, and an unfiltered
    // event stream must never reach the evaluator; exiting forces a full
    // resync on restart.
    let mut request = match api.get(&name).await {
        Ok(request) => request,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            return Ok(Action::await_change());
        }
        Err(e) => {
            error!(%namespace, %name, error = %e, "failed to look up certificaterequest, exiting");
            std::process::exit(1);
        }
    };

    if request.is_terminal() {
        return Ok(Action::await_change());
    }
    if request.spec.issuer_ref != ctx.issuer_ref {
        return Ok(Action::await_change());
    }

    match ctx.evaluator.evaluate(&request) {
        Ok(()) => {
            info!(%namespace, %name, "approving request");
            request.set_condition(approved_condition(DRIVER_NAME));
        }
        Err(denial) => {
            warn!(%namespace, %name, reason = %denial, "denying request");
            request.set_condition(denied_condition(DRIVER_NAME, &denial.0));
        }
    }

    // Replace the status subresource at the resourceVersion we read; a
    // conflict surfaces as a reconcile error and the event is retried.
    let data = serde_json::to_vec(&request)
        .map_err(|e| Error::internal_with_context("approver", e.to_string()))?;
    api.replace_status(&name, &PostParams::default(), data)
        .await?;

    Ok(Action::await_change())
}

/// Decide how to retry after a reconcile error
pub fn error_policy(
    req: Arc<CertificateRequest>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    warn!(
        name = %req.name_any(),
        error = %error,
        "reconcile failed, requeueing"
    );
    Action::requeue(Duration::from_secs(5))
}

/// Run the approver controller until the stream completes (shutdown signal).
pub async fn run(ctx: Arc<Context>) {
    let requests: Api<CertificateRequest> = Api::all(ctx.client.clone());

    info!(issuer = %ctx.issuer_ref, "starting approver controller");

    Controller::new(requests, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "reconciliation error");
                }
            }
        })
        .await;

    info!("approver controller stopped");
}
