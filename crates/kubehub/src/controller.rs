//! Controller wiring: watches JsonServers and the artifacts they own and
//! turns every change into a reconcile signal for the owning definition.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use futures::StreamExt;
use jsrv_core::{JsonServer, ObjectKey};
use jsrv_reconcile::{ReconcileError, ReconcileOutcome, Reconciler};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::{
    api::{Api, ListParams},
    runtime::{controller::Action, watcher, Controller},
    Client, ResourceExt,
};
use tracing::{debug, info, warn};

use crate::KubeStore;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Watch a single namespace; all namespaces when `None`.
    pub namespace: Option<String>,
    /// Requeue interval after a successful pass.
    pub resync: Duration,
    /// Requeue interval after a failed pass.
    pub error_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { namespace: None, resync: Duration::from_secs(300), error_backoff: Duration::from_secs(15) }
    }
}

struct Context {
    reconciler: Reconciler<KubeStore>,
    cfg: ControllerConfig,
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Next action after a pass that did not fail.
fn next_action(outcome: &ReconcileOutcome, cfg: &ControllerConfig) -> Action {
    match outcome {
        // Invalid definitions only change when someone edits them.
        ReconcileOutcome::Invalid { .. } | ReconcileOutcome::Absent => Action::await_change(),
        ReconcileOutcome::Synced { .. } => Action::requeue(cfg.resync),
    }
}

async fn reconcile(js: Arc<JsonServer>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let Some(key) = ObjectKey::of(js.as_ref()) else {
        warn!(name = %js.name_any(), "JsonServer without namespace; ignoring");
        return Ok(Action::await_change());
    };
    let outcome = ctx.reconciler.reconcile(&key).await?;
    info!(key = %key, outcome = outcome.label(), "reconciled");
    Ok(next_action(&outcome, &ctx.cfg))
}

fn error_policy(js: Arc<JsonServer>, err: &ReconcileError, ctx: Arc<Context>) -> Action {
    warn!(name = %js.name_any(), ns = ?js.namespace(), error = %err, "reconcile failed; requeueing");
    Action::requeue(ctx.cfg.error_backoff)
}

/// Run the controller until SIGTERM or ctrl-c.
pub async fn run(client: Client, cfg: ControllerConfig) -> Result<()> {
    let ns = cfg.namespace.clone();
    let definitions: Api<JsonServer> = scoped(&client, ns.as_deref());
    definitions
        .list(&ListParams::default().limit(1))
        .await
        .context("listing JsonServers failed; is the CRD installed? (jsrvctl crd | kubectl apply -f -)")?;

    let ctx = Arc::new(Context { reconciler: Reconciler::new(Arc::new(KubeStore::new(client.clone()))), cfg });
    info!(ns = ?ns, resync_secs = ctx.cfg.resync.as_secs(), backoff_secs = ctx.cfg.error_backoff.as_secs(), "controller starting");

    Controller::new(definitions, watcher::Config::default())
        .owns(scoped::<ConfigMap>(&client, ns.as_deref()), watcher::Config::default())
        .owns(scoped::<Deployment>(&client, ns.as_deref()), watcher::Config::default())
        .owns(scoped::<Service>(&client, ns.as_deref()), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(obj = %obj, ?action, "pass finished"),
                Err(e) => warn!(error = %e, "controller error"),
            }
        })
        .await;
    info!("controller stopped");
    Ok(())
}
