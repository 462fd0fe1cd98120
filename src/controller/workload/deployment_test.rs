use super::*;
use crate::cluster::memory::MemoryCluster;
use crate::controller::clock::parse_rfc3339;
use crate::controller::metadata::ROLLOUT_ID_ANNOTATION;
use crate::controller::testing::{
    canary, canary_from, canary_json, config_map, context, deployment, deployment_json, from_json,
    insert_podinfo_configs, mark_deployment_ready, reload, secret, NAMESPACE, NOW,
};
use crate::controller::tracker::ConfigTracker;
use crate::controller::{scaler, Controller};
use crate::crd::canary::{CanaryPhase, CanaryStatus};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::ConfigMap;
use crate::cluster::memory::merge_patch;
use serde_json::{json, Value};

fn controller(cluster: &MemoryCluster, canary: &Canary) -> DeploymentController<MemoryCluster> {
    let ctx = context(cluster);
    let scaler = scaler::for_canary(&ctx, canary);
    PodController::new(ctx.clone(), Box::new(ConfigTracker::new(ctx)), scaler)
}

fn podinfo(cluster: &MemoryCluster) -> Canary {
    cluster.insert(deployment("podinfo", 1));
    insert_podinfo_configs(cluster);
    canary(cluster, "Deployment", "podinfo")
}

fn stored(cluster: &MemoryCluster, name: &str) -> Deployment {
    cluster.object(NAMESPACE, name).unwrap()
}

fn replicas(cluster: &MemoryCluster, name: &str) -> Option<i32> {
    stored(cluster, name).spec.unwrap().replicas
}

fn set_image(cluster: &MemoryCluster, tag: &str) {
    let mut target = stored(cluster, "podinfo");
    let spec = target.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
    spec.containers[0].image = Some(format!("ghcr.io/stefanprodan/podinfo:{tag}"));
    cluster.insert(target);
}

fn image(deployment: &Deployment) -> String {
    deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
        .image
        .clone()
        .unwrap()
}

fn status(phase: CanaryPhase) -> CanaryStatus {
    CanaryStatus {
        phase: Some(phase),
        ..Default::default()
    }
}

fn readiness(deployment: Value) -> Result<(), CanaryError> {
    deployment_ready(&from_json(deployment), 60, parse_rfc3339(NOW).unwrap())
}

fn with_status(status: Value) -> Value {
    let mut value = deployment_json("podinfo", 2);
    value["metadata"]["generation"] = json!(2);
    value["status"] = status;
    value
}

#[tokio::test]
async fn test_initialize_creates_primary() {
    let cluster = MemoryCluster::new();
    let canary = podinfo(&cluster);

    controller(&cluster, &canary).initialize(&canary, true).await.unwrap();

    let primary = stored(&cluster, "podinfo-primary");
    let spec = primary.spec.clone().unwrap();
    assert_eq!(spec.replicas, Some(1));
    assert_eq!(spec.min_ready_seconds, Some(3));
    assert_eq!(spec.revision_history_limit, Some(5));
    assert_eq!(spec.selector.match_labels.unwrap()["app"], "podinfo-primary");

    let template_meta = spec.template.metadata.unwrap();
    assert_eq!(template_meta.labels.unwrap()["app"], "podinfo-primary");
    let annotations = template_meta.annotations.unwrap();
    assert_eq!(annotations["prometheus.io/scrape"], "true");
    assert!(annotations.contains_key(ROLLOUT_ID_ANNOTATION));

    let pod = serde_json::to_value(&spec.template.spec).unwrap();
    assert_eq!(
        pod["containers"][0]["env"][0]["valueFrom"]["configMapKeyRef"]["name"],
        "podinfo-config-env-primary"
    );
    assert_eq!(
        pod["containers"][0]["envFrom"][0]["secretRef"]["name"],
        "podinfo-secret-env-primary"
    );
    assert_eq!(pod["volumes"][0]["configMap"]["name"], "podinfo-config-vol-primary");

    let owner = &primary.metadata.owner_references.unwrap()[0];
    assert_eq!(owner.kind, "Canary");
    assert_eq!(owner.controller, Some(true));
    assert!(cluster.contains::<ConfigMap>(NAMESPACE, "podinfo-config-env-primary"));

    // The target is scaled down once the primary is up
    assert_eq!(replicas(&cluster, "podinfo"), Some(0));
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let cluster = MemoryCluster::new();
    let canary = podinfo(&cluster);
    let controller = controller(&cluster, &canary);

    controller.initialize(&canary, true).await.unwrap();
    let first = serde_json::to_value(stored(&cluster, "podinfo-primary")).unwrap();
    let writes = cluster.writes();

    controller.initialize(&canary, true).await.unwrap();
    let second = serde_json::to_value(stored(&cluster, "podinfo-primary")).unwrap();

    assert_eq!(first, second);
    assert_eq!(cluster.writes(), writes);
    assert_eq!(cluster.count::<Deployment>(), 2);
}

#[tokio::test]
async fn test_initialize_waits_for_primary() {
    let cluster = MemoryCluster::new();
    let canary = podinfo(&cluster);
    let controller = controller(&cluster, &canary);

    let err = controller.initialize(&canary, false).await.unwrap_err();
    assert!(err.is_retryable(), "{err}");
    assert!(cluster.contains::<Deployment>(NAMESPACE, "podinfo-primary"));
    assert_eq!(replicas(&cluster, "podinfo"), Some(1));

    mark_deployment_ready(&cluster, "podinfo-primary");
    controller.initialize(&canary, false).await.unwrap();
    assert_eq!(replicas(&cluster, "podinfo"), Some(0));
}

#[tokio::test]
async fn test_initialize_after_first_run_leaves_target_alone() {
    let cluster = MemoryCluster::new();
    let canary = podinfo(&cluster);
    let controller = controller(&cluster, &canary);
    controller.initialize(&canary, true).await.unwrap();
    controller.scale_from_zero(&canary).await.unwrap();

    controller
        .set_status_phase(&reload(&cluster, "podinfo"), CanaryPhase::Initialized)
        .await
        .unwrap();
    controller
        .initialize(&reload(&cluster, "podinfo"), false)
        .await
        .unwrap();

    assert_eq!(replicas(&cluster, "podinfo"), Some(1));
}

#[tokio::test]
async fn test_selector_without_known_label_is_fatal() {
    let cluster = MemoryCluster::new();
    let mut value = deployment_json("podinfo", 1);
    value["spec"]["selector"] = json!({"matchLabels": {"tier": "web"}});
    cluster.insert::<Deployment>(from_json(value));
    insert_podinfo_configs(&cluster);
    let canary = canary(&cluster, "Deployment", "podinfo");

    let err = controller(&cluster, &canary)
        .initialize(&canary, true)
        .await
        .unwrap_err();

    assert!(matches!(err, CanaryError::SelectorLabel { .. }), "{err}");
    assert!(!err.is_retryable());
    assert!(!cluster.contains::<Deployment>(NAMESPACE, "podinfo-primary"));
}

#[tokio::test]
async fn test_inconsistent_naming() {
    let cluster = MemoryCluster::new();
    let mut value = deployment_json("podinfo-service", 1);
    value["spec"]["selector"] = json!({"matchLabels": {"name": "podinfo"}});
    value["spec"]["template"]["metadata"]["labels"] = json!({"name": "podinfo"});
    cluster.insert::<Deployment>(from_json(value));
    insert_podinfo_configs(&cluster);
    let canary = canary(&cluster, "Deployment", "podinfo-service");

    controller(&cluster, &canary).initialize(&canary, true).await.unwrap();

    let primary = stored(&cluster, "podinfo-service-primary");
    let spec = primary.spec.unwrap();
    assert_eq!(spec.selector.match_labels.unwrap()["name"], "podinfo-primary");
    assert_eq!(
        spec.template.metadata.unwrap().labels.unwrap()["name"],
        "podinfo-primary"
    );
}

#[tokio::test]
async fn test_initialize_creates_primary_autoscaler() {
    let cluster = MemoryCluster::new();
    cluster.insert(deployment("podinfo", 2));
    insert_podinfo_configs(&cluster);
    cluster.insert::<HorizontalPodAutoscaler>(from_json(json!({
        "metadata": {"name": "podinfo", "namespace": NAMESPACE},
        "spec": {
            "scaleTargetRef": {"apiVersion": "apps/v1", "kind": "Deployment", "name": "podinfo"},
            "minReplicas": 2,
            "maxReplicas": 4
        }
    })));
    let mut value = canary_json("Deployment", "podinfo");
    value["spec"]["autoscalerRef"] = json!({
        "apiVersion": "autoscaling/v2",
        "kind": "HorizontalPodAutoscaler",
        "name": "podinfo"
    });
    let canary = canary_from(&cluster, value);

    controller(&cluster, &canary).initialize(&canary, true).await.unwrap();

    let hpa: HorizontalPodAutoscaler = cluster.object(NAMESPACE, "podinfo-primary").unwrap();
    assert_eq!(hpa.spec.unwrap().scale_target_ref.name, "podinfo-primary");
}

#[tokio::test]
async fn test_promote_after_config_and_image_change() {
    let cluster = MemoryCluster::new();
    cluster.insert(deployment("podinfo", 1));
    cluster.insert(config_map("podinfo-config-env", &[("color", "red")]));
    cluster.insert(config_map("podinfo-config-vol", &[("output", "console")]));
    cluster.insert(secret("podinfo-secret-env", "Opaque", &[("user", "YWRtaW4=")]));
    let canary = canary(&cluster, "Deployment", "podinfo");
    let controller = controller(&cluster, &canary);

    controller.initialize(&canary, true).await.unwrap();
    controller
        .sync_status(&canary, status(CanaryPhase::Initialized))
        .await
        .unwrap();

    assert_eq!(replicas(&cluster, "podinfo-primary"), Some(1));
    let mirror: ConfigMap = cluster.object(NAMESPACE, "podinfo-config-env-primary").unwrap();
    assert_eq!(mirror.data.unwrap()["color"], "red");
    assert_eq!(replicas(&cluster, "podinfo"), Some(0));

    cluster.modify::<ConfigMap>(NAMESPACE, "podinfo-config-env", json!({"data": {"color": "blue"}}));
    set_image(&cluster, "6.0.1");
    let canary = reload(&cluster, "podinfo");

    assert!(controller.has_target_changed(&canary).await.unwrap());
    assert!(controller.have_dependencies_changed(&canary).await.unwrap());

    controller.promote(&canary).await.unwrap();

    let primary = stored(&cluster, "podinfo-primary");
    assert_eq!(image(&primary), image(&stored(&cluster, "podinfo")));
    assert_eq!(image(&primary), "ghcr.io/stefanprodan/podinfo:6.0.1");
    let mirror: ConfigMap = cluster.object(NAMESPACE, "podinfo-config-env-primary").unwrap();
    assert_eq!(mirror.data.unwrap()["color"], "blue");
}

#[tokio::test]
async fn test_promote_copies_settings_and_forces_rollout() {
    let cluster = MemoryCluster::new();
    let canary = podinfo(&cluster);
    let controller = controller(&cluster, &canary);
    controller.initialize(&canary, true).await.unwrap();
    let before = stored(&cluster, "podinfo-primary");

    cluster.modify::<Deployment>(
        NAMESPACE,
        "podinfo",
        json!({"spec": {"replicas": 3, "minReadySeconds": 10}}),
    );
    controller.promote(&canary).await.unwrap();

    let after = stored(&cluster, "podinfo-primary");
    let spec = after.spec.clone().unwrap();
    assert_eq!(spec.replicas, Some(3));
    assert_eq!(spec.min_ready_seconds, Some(10));
    assert_eq!(spec.selector.match_labels.unwrap()["app"], "podinfo-primary");

    let rollout_id = |d: &Deployment| {
        d.spec.as_ref().unwrap().template.metadata.as_ref().unwrap().annotations.as_ref().unwrap()
            [ROLLOUT_ID_ANNOTATION]
            .clone()
    };
    assert_ne!(rollout_id(&before), rollout_id(&after));
}

#[tokio::test]
async fn test_promote_keeps_replicas_with_autoscaler() {
    let cluster = MemoryCluster::new();
    cluster.insert(deployment("podinfo", 2));
    insert_podinfo_configs(&cluster);
    cluster.insert::<HorizontalPodAutoscaler>(from_json(json!({
        "metadata": {"name": "podinfo", "namespace": NAMESPACE},
        "spec": {"scaleTargetRef": {"kind": "Deployment", "name": "podinfo"}, "maxReplicas": 4}
    })));
    let mut value = canary_json("Deployment", "podinfo");
    value["spec"]["autoscalerRef"] = json!({"kind": "HorizontalPodAutoscaler", "name": "podinfo"});
    let canary = canary_from(&cluster, value);
    let controller = controller(&cluster, &canary);
    controller.initialize(&canary, true).await.unwrap();

    cluster.modify::<Deployment>(NAMESPACE, "podinfo", json!({"spec": {"replicas": 4}}));
    controller.promote(&canary).await.unwrap();

    assert_eq!(replicas(&cluster, "podinfo-primary"), Some(2));
}

#[tokio::test]
async fn test_promote_without_primary_fails() {
    let cluster = MemoryCluster::new();
    let canary = podinfo(&cluster);

    let err = controller(&cluster, &canary).promote(&canary).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

#[tokio::test]
async fn test_rollback_to_promoted_spec_is_not_a_change() {
    let cluster = MemoryCluster::new();
    let canary = podinfo(&cluster);
    let controller = controller(&cluster, &canary);
    controller.initialize(&canary, true).await.unwrap();

    controller
        .sync_status(&canary, status(CanaryPhase::Initialized))
        .await
        .unwrap();
    controller
        .set_status_phase(&reload(&cluster, "podinfo"), CanaryPhase::Succeeded)
        .await
        .unwrap();
    assert!(!controller
        .has_target_changed(&reload(&cluster, "podinfo"))
        .await
        .unwrap());

    set_image(&cluster, "6.0.1");
    let canary = reload(&cluster, "podinfo");
    assert!(controller.has_target_changed(&canary).await.unwrap());
    controller
        .sync_status(&canary, status(CanaryPhase::Progressing))
        .await
        .unwrap();

    // Manual rollback to the promoted image
    set_image(&cluster, "6.0.0");
    let canary = reload(&cluster, "podinfo");
    let status = canary.status.clone().unwrap();
    assert_ne!(status.last_applied_spec, status.last_promoted_spec);
    assert!(!controller.has_target_changed(&canary).await.unwrap());
}

#[tokio::test]
async fn test_scale_to_zero_and_back() {
    let cluster = MemoryCluster::new();
    let canary = podinfo(&cluster);
    let controller = controller(&cluster, &canary);
    controller.initialize(&canary, true).await.unwrap();

    controller.scale(&canary, 3).await.unwrap();
    assert_eq!(replicas(&cluster, "podinfo"), Some(3));

    controller.scale_to_zero(&canary).await.unwrap();
    assert_eq!(replicas(&cluster, "podinfo"), Some(0));

    // Without an autoscaler the primary's count is used
    cluster.modify::<Deployment>(NAMESPACE, "podinfo-primary", json!({"spec": {"replicas": 2}}));
    controller.scale_from_zero(&canary).await.unwrap();
    assert_eq!(replicas(&cluster, "podinfo"), Some(2));
}

#[tokio::test]
async fn test_scale_from_zero_uses_hpa_min_replicas() {
    let cluster = MemoryCluster::new();
    cluster.insert(deployment("podinfo", 0));
    insert_podinfo_configs(&cluster);
    cluster.insert::<HorizontalPodAutoscaler>(from_json(json!({
        "metadata": {"name": "podinfo", "namespace": NAMESPACE},
        "spec": {
            "scaleTargetRef": {"kind": "Deployment", "name": "podinfo"},
            "minReplicas": 3,
            "maxReplicas": 6
        }
    })));
    let mut value = canary_json("Deployment", "podinfo");
    value["spec"]["autoscalerRef"] = json!({"kind": "HorizontalPodAutoscaler", "name": "podinfo"});
    let canary = canary_from(&cluster, value);

    controller(&cluster, &canary).scale_from_zero(&canary).await.unwrap();

    assert_eq!(replicas(&cluster, "podinfo"), Some(3));
}

#[tokio::test]
async fn test_scale_retries_conflicts() {
    let cluster = MemoryCluster::new();
    let canary = podinfo(&cluster);
    cluster.fail_with_conflict::<Deployment>(NAMESPACE, "podinfo", 2);

    controller(&cluster, &canary).scale(&canary, 4).await.unwrap();

    assert_eq!(replicas(&cluster, "podinfo"), Some(4));
}

#[tokio::test]
async fn test_finalize() {
    let cluster = MemoryCluster::new();
    let canary = podinfo(&cluster);
    let controller = controller(&cluster, &canary);

    // No primary: scale up from zero
    cluster.modify::<Deployment>(NAMESPACE, "podinfo", json!({"spec": {"replicas": 0}}));
    let err = controller.finalize(&canary).await.unwrap_err();
    assert!(err.is_not_found());

    controller.initialize(&canary, true).await.unwrap();
    assert_eq!(replicas(&cluster, "podinfo"), Some(0));
    controller.finalize(&canary).await.unwrap();
    assert_eq!(replicas(&cluster, "podinfo"), Some(1));
}

#[tokio::test]
async fn test_get_metadata() {
    let cluster = MemoryCluster::new();
    cluster.insert(deployment("podinfo", 1));
    let mut value = canary_json("Deployment", "podinfo");
    value["spec"]["service"]["portDiscovery"] = json!(true);
    let canary = canary_from(&cluster, value);

    let metadata = controller(&cluster, &canary).get_metadata(&canary).await.unwrap();

    assert_eq!(metadata.label, "app");
    assert_eq!(metadata.label_value, "podinfo");
    assert_eq!(
        metadata.ports,
        Some(std::collections::BTreeMap::from([("grpc".to_string(), 9999)]))
    );
}

#[tokio::test]
async fn test_sync_status_records_fingerprint_and_configs() {
    let cluster = MemoryCluster::new();
    let canary = podinfo(&cluster);
    let controller = controller(&cluster, &canary);

    controller
        .sync_status(&canary, status(CanaryPhase::Initializing))
        .await
        .unwrap();

    let status = reload(&cluster, "podinfo").status.unwrap();
    assert!(status.last_applied_spec.is_some());
    let tracked = status.tracked_configs.unwrap();
    assert_eq!(tracked.len(), 3);
    assert!(tracked.contains_key("configmap/podinfo-config-env"));
}

#[test]
fn test_ready_deployment() {
    let value = with_status(json!({
        "observedGeneration": 2,
        "replicas": 2,
        "updatedReplicas": 2,
        "availableReplicas": 2,
        "conditions": [{"type": "Progressing", "status": "True", "reason": "NewReplicaSetAvailable"}]
    }));
    readiness(value).unwrap();
}

#[test]
fn test_generation_not_observed_is_retryable() {
    let err = readiness(with_status(json!({"observedGeneration": 1}))).unwrap_err();
    assert!(err.is_retryable());
    assert!(err.to_string().contains("generation"));
}

#[test]
fn test_progress_deadline_exceeded_is_fatal() {
    let err = readiness(with_status(json!({
        "observedGeneration": 2,
        "replicas": 2,
        "updatedReplicas": 1,
        "conditions": [{"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded"}]
    })))
    .unwrap_err();
    assert!(!err.is_retryable());
}

#[test]
fn test_updating_replicas_is_retryable() {
    let err = readiness(with_status(json!({
        "observedGeneration": 2,
        "replicas": 2,
        "updatedReplicas": 1,
        "conditions": [{"type": "Progressing", "status": "True", "reason": "ReplicaSetUpdated"}]
    })))
    .unwrap_err();
    assert!(err.is_retryable());
    assert!(err.to_string().contains("1 out of 2"));
}

#[test]
fn test_unavailable_past_deadline_is_fatal() {
    let stuck = |since: &str| {
        with_status(json!({
            "observedGeneration": 2,
            "replicas": 2,
            "updatedReplicas": 1,
            "conditions": [
                {"type": "Progressing", "status": "True", "reason": "ReplicaSetUpdated"},
                {"type": "Available", "status": "False", "reason": "MinimumReplicasUnavailable",
                 "lastUpdateTime": since}
            ]
        }))
    };

    // 60s deadline, "now" is 10:00:00
    let slow = readiness(stuck("2024-05-01T09:59:30Z")).unwrap_err();
    assert!(slow.is_retryable());

    let stuck = readiness(stuck("2024-05-01T09:58:00Z")).unwrap_err();
    assert!(!stuck.is_retryable());
}

#[test]
fn test_old_and_unavailable_replicas() {
    let err = readiness(with_status(json!({
        "observedGeneration": 2,
        "replicas": 3,
        "updatedReplicas": 2,
        "availableReplicas": 2
    })))
    .unwrap_err();
    assert!(err.to_string().contains("1 old replicas"));

    let mut value = with_status(json!({
        "observedGeneration": 2,
        "replicas": 2,
        "updatedReplicas": 2,
        "availableReplicas": 1
    }));
    merge_patch(&mut value, &json!({"spec": {"replicas": 2}}));
    let err = readiness(value).unwrap_err();
    assert!(err.is_retryable());
    assert!(err.to_string().contains("1 of 2 updated replicas are available"));
}
