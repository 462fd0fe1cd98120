//! Labels, annotations, selectors and ports shared by the workload controllers

use crate::crd::canary::CanaryService;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

pub const PRIMARY_SUFFIX: &str = "-primary";
pub const CANARY_SUFFIX: &str = "-canary";

/// Annotation set to a fresh token on every primary build to force a pod rollout
pub const ROLLOUT_ID_ANNOTATION: &str = "kanari.io/rollout-id";

/// Keys written by GitOps tooling; copying them would make the tool adopt the primary
pub const TOOLKIT_MARKER: &str = "toolkit.fluxcd.io";

/// Service mesh sidecars whose ports are never discovered
const SIDECARS: [&str; 2] = ["istio-proxy", "envoy"];

pub fn primary_name(name: &str) -> String {
    format!("{name}{PRIMARY_SUFFIX}")
}

pub fn canary_name(name: &str) -> String {
    format!("{name}{CANARY_SUFFIX}")
}

/// Copy annotations minus toolkit keys, with a new rollout id
pub fn make_annotations(annotations: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    let mut res = filter_metadata(annotations);
    res.insert(
        ROLLOUT_ID_ANNOTATION.to_string(),
        uuid::Uuid::new_v4().to_string(),
    );
    res
}

/// Copy labels or annotations minus toolkit keys
pub fn filter_metadata(meta: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    meta.into_iter()
        .flatten()
        .filter(|(k, _)| !k.contains(TOOLKIT_MARKER))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Labels whose key starts with one of `prefixes`; `*` matches any key
pub fn include_labels_by_prefix(
    labels: Option<&BTreeMap<String, String>>,
    prefixes: &[String],
) -> BTreeMap<String, String> {
    filter_metadata(labels)
        .into_iter()
        .filter(|(k, _)| prefixes.iter().any(|p| p == "*" || k.starts_with(p.as_str())))
        .collect()
}

/// Pod labels for the primary: the selector label points at `value`
pub fn make_primary_labels(
    labels: Option<&BTreeMap<String, String>>,
    label: &str,
    value: &str,
) -> BTreeMap<String, String> {
    let mut res = filter_metadata(labels);
    res.insert(label.to_string(), value.to_string());
    res
}

/// First candidate label key present in the selector, with its value
pub fn selector_label(
    selector: Option<&LabelSelector>,
    candidates: &[String],
) -> Option<(String, String)> {
    let match_labels = selector?.match_labels.as_ref()?;
    candidates
        .iter()
        .find_map(|key| match_labels.get(key).map(|v| (key.clone(), v.clone())))
}

/// Retarget anti-affinity and topology spread selectors from the target's
/// pods to the primary's
///
/// Only selector terms keyed by one of `selector_labels` whose value equals
/// `target_name` are rewritten.
pub fn retarget_pod_selectors(spec: &mut PodSpec, selector_labels: &[String], target_name: &str) {
    let mut selectors: Vec<&mut LabelSelector> = Vec::new();

    for constraint in spec.topology_spread_constraints.iter_mut().flatten() {
        if let Some(selector) = constraint.label_selector.as_mut() {
            selectors.push(selector);
        }
    }

    if let Some(anti) = spec
        .affinity
        .as_mut()
        .and_then(|a| a.pod_anti_affinity.as_mut())
    {
        for term in anti
            .preferred_during_scheduling_ignored_during_execution
            .iter_mut()
            .flatten()
        {
            if let Some(selector) = term.pod_affinity_term.label_selector.as_mut() {
                selectors.push(selector);
            }
        }
        for term in anti
            .required_during_scheduling_ignored_during_execution
            .iter_mut()
            .flatten()
        {
            if let Some(selector) = term.label_selector.as_mut() {
                selectors.push(selector);
            }
        }
    }

    let primary = primary_name(target_name);
    for selector in selectors {
        for requirement in selector.match_expressions.iter_mut().flatten() {
            if !selector_labels.contains(&requirement.key) {
                continue;
            }
            if let Some(value) = requirement
                .values
                .iter_mut()
                .flatten()
                .find(|v| v.as_str() == target_name)
            {
                *value = primary.clone();
            }
        }
        for (key, value) in selector.match_labels.iter_mut().flatten() {
            if selector_labels.contains(key) && value.as_str() == target_name {
                *value = primary.clone();
            }
        }
    }
}

/// Container ports to expose besides the canary's own service port
///
/// Sidecar containers are skipped, and so is the port matching the
/// service's `targetPort` (or `port` when no target port is set). Unnamed
/// ports are called `tcp-{container}-{index}`.
pub fn discover_ports(spec: &PodSpec, service: &CanaryService) -> BTreeMap<String, i32> {
    let mut ports = BTreeMap::new();
    for container in &spec.containers {
        if SIDECARS.contains(&container.name.as_str()) {
            continue;
        }
        for (i, port) in container.ports.iter().flatten().enumerate() {
            let excluded = match &service.target_port {
                None | Some(IntOrString::Int(0)) => port.container_port == service.port,
                Some(IntOrString::Int(target)) => port.container_port == *target,
                Some(IntOrString::String(target)) => port.name.as_deref() == Some(target.as_str()),
            };
            if excluded {
                continue;
            }
            let name = match port.name.as_deref() {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => format!("tcp-{}-{}", container.name, i),
            };
            ports.insert(name, port.container_port);
        }
    }
    ports
}
