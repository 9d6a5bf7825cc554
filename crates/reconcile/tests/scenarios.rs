#![forbid(unsafe_code)]

use std::sync::Arc;

use jsrv_apply::Operation;
use jsrv_core::crd::{SYNCED_MESSAGE, UNEXPECTED_FAILURE_MESSAGE};
use jsrv_core::{JsonServer, JsonServerSpec, JsonServerStatus, ObjectKey, ObjectStore, StoreError, SyncState, ValidationError};
use jsrv_reconcile::{Artifact, ArtifactReport, ReconcileError, ReconcileOutcome, Reconciler, StatusWrite};
use jsrv_store::{MemStore, Op};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

const NS: &str = "default";

fn definition(name: &str, replicas: i32, payload: &str) -> JsonServer {
    let mut js = JsonServer::new(name, JsonServerSpec { replica_count: replicas, config_payload: payload.to_string() });
    js.metadata.namespace = Some(NS.into());
    js
}

fn setup(js: &JsonServer) -> (Arc<MemStore>, Reconciler<MemStore>, ObjectKey) {
    let store = Arc::new(MemStore::new());
    store.seed(js).expect("seed definition");
    let key = ObjectKey::new(NS, js.metadata.name.clone().unwrap_or_default());
    (store.clone(), Reconciler::new(store), key)
}

fn status_of(store: &MemStore, key: &ObjectKey) -> Option<JsonServerStatus> {
    store.peek::<JsonServer>(key).and_then(|js| js.status)
}

fn artifact_count(store: &MemStore) -> usize {
    store.count("ConfigMap") + store.count("Deployment") + store.count("Service")
}

fn synced(outcome: ReconcileOutcome) -> (Vec<ArtifactReport>, JsonServerStatus, StatusWrite) {
    match outcome {
        ReconcileOutcome::Synced { artifacts, status, write } => (artifacts, status, write),
        other => panic!("expected synced, got {other:?}"),
    }
}

async fn edit(store: &MemStore, key: &ObjectKey, f: impl FnOnce(&mut JsonServer)) {
    let mut js: JsonServer = store.peek(key).expect("definition exists");
    f(&mut js);
    store.replace(&js).await.expect("edit definition");
}

#[tokio::test]
async fn scenario_a_fresh_definition_converges() {
    let (store, reconciler, key) = setup(&definition("app-demo", 2, r#"{"users":[]}"#));

    let outcome = reconciler.reconcile(&key).await.unwrap();
    let (artifacts, status, write) = synced(outcome);
    assert_eq!(write, StatusWrite::Written);
    assert_eq!(status, JsonServerStatus::synced(2));
    let order: Vec<_> = artifacts.iter().map(|a| (a.artifact, a.name.as_str(), a.op)).collect();
    assert_eq!(
        order,
        vec![
            (Artifact::Config, "app-demo-config", Operation::Created),
            (Artifact::Workload, "app-demo", Operation::Created),
            (Artifact::Network, "app-demo", Operation::Created),
        ]
    );

    let cm: ConfigMap = store.peek(&ObjectKey::new(NS, "app-demo-config")).unwrap();
    assert_eq!(cm.data.unwrap().get("db.json").map(String::as_str), Some(r#"{"users":[]}"#));
    let dep: Deployment = store.peek(&ObjectKey::new(NS, "app-demo")).unwrap();
    assert_eq!(dep.spec.and_then(|s| s.replicas), Some(2));
    let svc: Service = store.peek(&ObjectKey::new(NS, "app-demo")).unwrap();
    assert_eq!(svc.spec.and_then(|s| s.ports).unwrap()[0].port, 3000);

    let stored = status_of(&store, &key).unwrap();
    assert_eq!(stored.state, Some(SyncState::Synced));
    assert_eq!(stored.message, SYNCED_MESSAGE);
    assert_eq!(stored.replicas, 2);
}

#[tokio::test]
async fn scenario_b_missing_prefix_creates_nothing() {
    let (store, reconciler, key) = setup(&definition("demo", 2, r#"{"users":[]}"#));

    let outcome = reconciler.reconcile(&key).await.unwrap();
    let (reason, status) = match outcome {
        ReconcileOutcome::Invalid { reason, status, .. } => (reason, status),
        other => panic!("expected invalid, got {other:?}"),
    };
    assert_eq!(reason, ValidationError::MissingPrefix("demo".into()));
    assert_eq!(status.state, Some(SyncState::Error));
    assert!(status.message.contains("naming convention"), "{}", status.message);

    assert_eq!(artifact_count(&store), 0);
    assert_eq!(status_of(&store, &key), Some(status));
}

#[tokio::test]
async fn scenario_c_invalid_json_creates_nothing() {
    let (store, reconciler, key) = setup(&definition("app-demo", 1, "{not json}"));

    let outcome = reconciler.reconcile(&key).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Invalid { reason: ValidationError::InvalidJson, .. }), "{outcome:?}");
    assert_eq!(artifact_count(&store), 0);
    let writes = store.writes();
    assert!(writes.iter().all(|c| c.op == Op::ReplaceStatus && c.kind == "JsonServer"), "{writes:?}");

    let status = status_of(&store, &key).unwrap();
    assert_eq!(status.state, Some(SyncState::Error));
    assert_eq!(status.message, "Error: spec.configPayload is not valid JSON");
    assert_eq!(status.replicas, 1);
}

#[tokio::test]
async fn scenario_d_replica_change_updates_workload_in_place() {
    let (store, reconciler, key) = setup(&definition("app-demo", 2, r#"{"users":[]}"#));
    reconciler.reconcile(&key).await.unwrap();
    let before: Deployment = store.peek(&ObjectKey::new(NS, "app-demo")).unwrap();

    edit(&store, &key, |js| js.spec.replica_count = 5).await;
    let outcome = reconciler.reconcile(&key).await.unwrap();
    let (artifacts, status, _) = synced(outcome);
    let ops: Vec<_> = artifacts.iter().map(|a| a.op).collect();
    assert_eq!(ops, vec![Operation::Unchanged, Operation::Updated, Operation::Unchanged]);
    assert_eq!(status.replicas, 5);

    let after: Deployment = store.peek(&ObjectKey::new(NS, "app-demo")).unwrap();
    assert_eq!(after.metadata.uid, before.metadata.uid, "workload must be updated, not recreated");
    assert_eq!(after.spec.and_then(|s| s.replicas), Some(5));
    assert_eq!(status_of(&store, &key).unwrap().replicas, 5);
}

#[tokio::test]
async fn scenario_e_transient_workload_failure_keeps_prior_status() {
    let (store, reconciler, key) = setup(&definition("app-demo", 2, r#"{"users":[]}"#));
    reconciler.reconcile(&key).await.unwrap();
    edit(&store, &key, |js| js.spec.replica_count = 5).await;

    store.fail_next(Op::Replace, "Deployment", 1, StoreError::Transient("etcd timeout".into()));
    let err = reconciler.reconcile(&key).await.unwrap_err();
    match &err {
        ReconcileError::Sync { artifact, reported, .. } => {
            assert_eq!(*artifact, Artifact::Workload);
            assert!(!reported);
        }
        other => panic!("expected sync error, got {other:?}"),
    }
    assert_eq!(status_of(&store, &key), Some(JsonServerStatus::synced(2)));
    assert!(store.peek::<Service>(&ObjectKey::new(NS, "app-demo")).is_some());

    let outcome = reconciler.reconcile(&key).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Synced { .. }), "{outcome:?}");
    let dep: Deployment = store.peek(&ObjectKey::new(NS, "app-demo")).unwrap();
    assert_eq!(dep.spec.and_then(|s| s.replicas), Some(5));
    assert_eq!(status_of(&store, &key), Some(JsonServerStatus::synced(5)));
    assert_eq!(artifact_count(&store), 3);
}

#[tokio::test]
async fn second_pass_is_a_no_op() {
    let (store, reconciler, key) = setup(&definition("app-demo", 2, r#"{"users":[]}"#));
    reconciler.reconcile(&key).await.unwrap();
    let first = serde_json::to_value(store.peek::<Deployment>(&ObjectKey::new(NS, "app-demo")).unwrap()).unwrap();
    store.clear_journal();

    let outcome = reconciler.reconcile(&key).await.unwrap();
    let (artifacts, status, write) = synced(outcome);
    assert!(artifacts.iter().all(|a| a.op == Operation::Unchanged), "{artifacts:?}");
    assert_eq!(write, StatusWrite::Unchanged);
    assert_eq!(status, JsonServerStatus::synced(2));
    assert!(store.writes().is_empty(), "{:?}", store.writes());

    let second = serde_json::to_value(store.peek::<Deployment>(&ObjectKey::new(NS, "app-demo")).unwrap()).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn every_artifact_points_back_to_definition() {
    let (store, reconciler, key) = setup(&definition("app-demo", 1, "[]"));
    reconciler.reconcile(&key).await.unwrap();
    let js: JsonServer = store.peek(&key).unwrap();

    let check = |refs: Option<Vec<OwnerReference>>| {
        let refs = refs.expect("owner references set");
        assert_eq!(refs.len(), 1);
        assert_eq!(Some(&refs[0].uid), js.metadata.uid.as_ref());
        assert_eq!(refs[0].kind, "JsonServer");
        assert_eq!(refs[0].name, "app-demo");
        assert_eq!(refs[0].controller, Some(true));
    };
    check(store.peek::<ConfigMap>(&ObjectKey::new(NS, "app-demo-config")).unwrap().metadata.owner_references);
    check(store.peek::<Deployment>(&ObjectKey::new(NS, "app-demo")).unwrap().metadata.owner_references);
    check(store.peek::<Service>(&ObjectKey::new(NS, "app-demo")).unwrap().metadata.owner_references);
}

#[tokio::test]
async fn absent_definition_is_nothing_to_do() {
    let store = Arc::new(MemStore::new());
    let reconciler = Reconciler::new(store.clone());
    let outcome = reconciler.reconcile(&ObjectKey::new(NS, "app-gone")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Absent);
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn fetch_failure_propagates() {
    let (store, reconciler, key) = setup(&definition("app-demo", 1, "{}"));
    store.fail_next(Op::Get, "JsonServer", 1, StoreError::Transient("connection refused".into()));
    let err = reconciler.reconcile(&key).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Fetch { .. }), "{err:?}");
    assert_eq!(artifact_count(&store), 0);
}

#[tokio::test]
async fn status_conflict_propagates() {
    let (store, reconciler, key) = setup(&definition("app-demo", 1, "{}"));
    let conflict = StoreError::Conflict { kind: "JsonServer".into(), key: key.clone(), message: "stale".into() };
    store.fail_next(Op::ReplaceStatus, "JsonServer", 1, conflict);

    let err = reconciler.reconcile(&key).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Status { .. }), "{err:?}");
    assert_eq!(status_of(&store, &key), None);

    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(status_of(&store, &key), Some(JsonServerStatus::synced(1)));
}

#[tokio::test]
async fn rejected_write_reports_generic_error() {
    let (store, reconciler, key) = setup(&definition("app-demo", 3, "{}"));
    let rejected = StoreError::Rejected { code: 422, message: "Service \"app-demo\" is invalid".into() };
    store.fail_next(Op::Create, "Service", 1, rejected);

    let err = reconciler.reconcile(&key).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Sync { artifact: Artifact::Network, reported: true, .. }), "{err:?}");
    let status = status_of(&store, &key).unwrap();
    assert_eq!(status, JsonServerStatus::error(UNEXPECTED_FAILURE_MESSAGE, 3));
    assert!(!status.message.contains("invalid"), "store detail leaked: {}", status.message);
    assert_eq!(store.count("ConfigMap"), 1);
    assert_eq!(store.count("Deployment"), 1);
    assert_eq!(store.count("Service"), 0);
}

#[tokio::test]
async fn artifact_owned_by_another_controller_is_not_taken_over() {
    let (store, reconciler, key) = setup(&definition("app-demo", 1, "{}"));
    let mut squatter = ConfigMap::default();
    squatter.metadata.name = Some("app-demo-config".into());
    squatter.metadata.namespace = Some(NS.into());
    squatter.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "apps/v1".into(),
        kind: "ReplicaSet".into(),
        name: "other".into(),
        uid: "not-ours".into(),
        controller: Some(true),
        block_owner_deletion: None,
    }]);
    store.seed(&squatter).unwrap();

    let err = reconciler.reconcile(&key).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Sync { artifact: Artifact::Config, reported: true, .. }), "{err:?}");
    assert_eq!(store.count("Deployment"), 0);
    assert_eq!(status_of(&store, &key).unwrap().state, Some(SyncState::Error));
}

#[tokio::test]
async fn status_mirrors_attempted_replicas_on_invalid_definition() {
    let (store, reconciler, key) = setup(&definition("app-demo", 0, "{}"));
    let outcome = reconciler.reconcile(&key).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Invalid { reason: ValidationError::ReplicasBelowMinimum(0), .. }), "{outcome:?}");
    let status = status_of(&store, &key).unwrap();
    assert_eq!(status.replicas, 0);
    assert_eq!(status.message, "Error: spec.replicaCount must be at least 1: got 0");
}

#[tokio::test]
async fn invalid_edit_leaves_existing_artifacts_alone() {
    let (store, reconciler, key) = setup(&definition("app-demo", 2, r#"{"users":[]}"#));
    reconciler.reconcile(&key).await.unwrap();
    edit(&store, &key, |js| js.spec.config_payload = "{broken".into()).await;
    store.clear_journal();

    let outcome = reconciler.reconcile(&key).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Invalid { .. }), "{outcome:?}");
    let writes = store.writes();
    assert_eq!(writes.len(), 1, "{writes:?}");
    assert_eq!(writes[0].op, Op::ReplaceStatus);
    let cm: ConfigMap = store.peek(&ObjectKey::new(NS, "app-demo-config")).unwrap();
    assert_eq!(cm.data.unwrap().get("db.json").map(String::as_str), Some(r#"{"users":[]}"#));
}

#[tokio::test]
async fn partial_application_is_picked_up_by_next_pass() {
    let (store, reconciler, key) = setup(&definition("app-demo", 1, "{}"));
    store.fail_next(Op::Create, "Deployment", 1, StoreError::Transient("connection reset".into()));
    reconciler.reconcile(&key).await.unwrap_err();
    assert_eq!(store.count("ConfigMap"), 1);
    assert_eq!(store.count("Deployment"), 0);
    assert_eq!(status_of(&store, &key), None);

    let outcome = reconciler.reconcile(&key).await.unwrap();
    let (artifacts, _, _) = synced(outcome);
    let ops: Vec<_> = artifacts.iter().map(|a| a.op).collect();
    assert_eq!(ops, vec![Operation::Unchanged, Operation::Created, Operation::Created]);
}

#[tokio::test]
async fn status_report_for_deleted_definition_is_skipped() {
    let store = MemStore::new();
    let key = ObjectKey::new(NS, "app-demo");
    let write = jsrv_reconcile::status::report(&store, &key, &JsonServerStatus::synced(1)).await.unwrap();
    assert_eq!(write, StatusWrite::Gone);
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn artifact_write_conflict_propagates_without_status_change() {
    let (store, reconciler, key) = setup(&definition("app-demo", 2, "{}"));
    reconciler.reconcile(&key).await.unwrap();
    edit(&store, &key, |js| js.spec.replica_count = 4).await;

    let conflict = StoreError::Conflict {
        kind: "Deployment".into(),
        key: ObjectKey::new(NS, "app-demo"),
        message: "the object has been modified".into(),
    };
    store.fail_next(Op::Replace, "Deployment", 1, conflict);
    let err = reconciler.reconcile(&key).await.unwrap_err();
    match &err {
        ReconcileError::Sync { artifact, reported, status_error, source, .. } => {
            assert_eq!(*artifact, Artifact::Workload);
            assert!(!reported);
            assert!(status_error.is_none());
            assert!(source.is_transient(), "{source}");
        }
        other => panic!("expected sync error, got {other:?}"),
    }
    assert_eq!(status_of(&store, &key), Some(JsonServerStatus::synced(2)));
    let dep: Deployment = store.peek(&ObjectKey::new(NS, "app-demo")).unwrap();
    assert_eq!(dep.spec.and_then(|s| s.replicas), Some(2));
}

#[tokio::test]
async fn failed_failure_report_keeps_store_error() {
    let (store, reconciler, key) = setup(&definition("app-demo", 1, "{}"));
    store.fail_next(Op::Create, "Service", 1, StoreError::Rejected { code: 422, message: "bad port".into() });
    let outage = StoreError::Transient("apiserver unavailable".into());
    store.fail_next(Op::ReplaceStatus, "JsonServer", 1, outage.clone());

    let err = reconciler.reconcile(&key).await.unwrap_err();
    match err {
        ReconcileError::Sync { artifact, reported, status_error, .. } => {
            assert_eq!(artifact, Artifact::Network);
            assert!(!reported);
            assert_eq!(status_error, Some(outage));
        }
        other => panic!("expected sync error, got {other:?}"),
    }
    assert_eq!(status_of(&store, &key), None);
}

#[tokio::test]
async fn stray_selector_and_config_keys_are_removed() {
    let (store, reconciler, key) = setup(&definition("app-demo", 1, r#"{"users":[]}"#));
    reconciler.reconcile(&key).await.unwrap();

    let svc_key = ObjectKey::new(NS, "app-demo");
    let mut svc: Service = store.peek(&svc_key).unwrap();
    svc.spec.as_mut().unwrap().selector.as_mut().unwrap().insert("tier".into(), "nothing".into());
    store.replace(&svc).await.unwrap();
    let cm_key = ObjectKey::new(NS, "app-demo-config");
    let mut cm: ConfigMap = store.peek(&cm_key).unwrap();
    cm.data.as_mut().unwrap().insert("stray.json".into(), "[]".into());
    store.replace(&cm).await.unwrap();

    let (artifacts, status, _) = synced(reconciler.reconcile(&key).await.unwrap());
    let ops: Vec<_> = artifacts.iter().map(|a| (a.artifact, a.op)).collect();
    assert_eq!(
        ops,
        vec![(Artifact::Config, Operation::Updated), (Artifact::Workload, Operation::Unchanged), (Artifact::Network, Operation::Updated)]
    );
    assert_eq!(status, JsonServerStatus::synced(1));

    let svc: Service = store.peek(&svc_key).unwrap();
    let selector: Vec<_> = svc.spec.unwrap().selector.unwrap().into_keys().collect();
    assert_eq!(selector, vec!["app".to_string()]);
    let cm: ConfigMap = store.peek(&cm_key).unwrap();
    let keys: Vec<_> = cm.data.unwrap().into_keys().collect();
    assert_eq!(keys, vec!["db.json".to_string()]);
}
