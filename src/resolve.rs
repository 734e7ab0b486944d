use std::{collections::HashMap, thread, time::Duration};

use log::{debug, info};

use crate::{
    kubectl::{ContainerSpec, Kubectl, Pod},
    session, version, Error, Result,
};

const READY_ATTEMPTS: u32 = 120;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The single pod a session proxies through. Valid only while the pod stays
/// in a non-terminal phase.
#[derive(Debug, Clone)]
pub struct PodRef {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub image_tag: String,
}

pub struct Resolved {
    pub pod: PodRef,
    /// Names of the variables the workload declares for the proxy container.
    pub declared_env: Vec<String>,
}

/// Locates the pod backing `workload`, verifies it runs a proxy image of the
/// same version as this binary, and waits for it to report ready.
pub fn resolve(kubectl: &Kubectl, workload: &str, namespace: Option<&str>) -> Result<Resolved> {
    let deployment = kubectl.deployment(namespace, workload)?;

    let namespace = deployment
        .metadata
        .namespace
        .clone()
        .or_else(|| namespace.map(str::to_owned))
        .unwrap_or_else(|| String::from("default"));
    let expected_labels = deployment.pod_labels().clone();

    let pods = kubectl.pods(Some(&namespace))?;
    let pod = select_pod(&pods, workload, &expected_labels, &namespace).ok_or_else(|| {
        Error::PodNotFound {
            workload: workload.to_owned(),
            namespace: namespace.clone(),
        }
    })?;

    let container = companion_container(&pod.spec.containers).ok_or_else(|| {
        Error::Other(format!(
            "pod {name:?} does not run a {image} container",
            name = pod.metadata.name,
            image = version::IMAGE_NAME,
        ))
    })?;

    let image_tag = image_tag(&container.image).to_owned();
    let local_version = version::version();
    if image_tag != local_version {
        return Err(Error::VersionMismatch {
            image_version: image_tag,
            local_version,
        });
    }

    let declared_env = companion_container(deployment.containers())
        .or_else(|| {
            deployment
                .containers()
                .iter()
                .find(|candidate| candidate.name == container.name)
        })
        .map(|candidate| candidate.env.iter().map(|var| var.name.clone()).collect())
        .unwrap_or_default();

    let pod = PodRef {
        namespace,
        pod_name: pod.metadata.name.clone(),
        container_name: container.name.clone(),
        image_tag,
    };

    wait_until_ready(kubectl, &pod)?;

    Ok(Resolved { pod, declared_env })
}

/// The first pod that belongs to the workload: named after it, in the right
/// namespace, carrying at least the template's labels, not yet terminal.
fn select_pod<'a>(
    pods: &'a [Pod],
    workload: &str,
    expected_labels: &HashMap<String, String>,
    namespace: &str,
) -> Option<&'a Pod> {
    let prefix = format!("{workload}-");
    pods.iter().find(|pod| {
        pod.metadata.name.starts_with(&prefix)
            && pod.metadata.namespace.as_deref() == Some(namespace)
            && expected_labels
                .iter()
                .all(|(key, value)| pod.metadata.labels.get(key) == Some(value))
            && pod.status.phase.is_startable()
    })
}

fn companion_container(containers: &[ContainerSpec]) -> Option<&ContainerSpec> {
    containers
        .iter()
        .find(|container| container.image.contains(version::IMAGE_NAME))
}

/// The tag of an image reference: everything after the final `:`.
fn image_tag(image: &str) -> &str {
    image.rsplit_once(':').map(|(_, tag)| tag).unwrap_or("")
}

fn wait_until_ready(kubectl: &Kubectl, pod: &PodRef) -> Result<()> {
    info!(
        "Waiting for pod {namespace}/{name} to become ready...",
        namespace = pod.namespace,
        name = pod.pod_name,
    );

    for _ in 0..READY_ATTEMPTS {
        if session::interrupted() {
            return Err(Error::Interrupted);
        }

        // A failed status fetch consumes an attempt like a not-ready pod;
        // the control plane can be briefly unavailable while the pod comes
        // up.
        match kubectl.pod(Some(&pod.namespace), &pod.pod_name) {
            Ok(fetched) => {
                let status = fetched.status;
                if status.phase == crate::kubectl::PodPhase::Running
                    && status.container_ready(&pod.container_name)
                {
                    return Ok(());
                }
                debug!("Pod status: {phase}", phase = status.phase);
            }
            Err(error) => debug!("Pod status fetch failed: {error}"),
        }

        thread::sleep(POLL_INTERVAL);
    }

    Err(Error::PodNotReady {
        pod: pod.pod_name.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubectl::Pod;

    fn pod_fixture(name: &str, namespace: &str, phase: &str, labels: &str) -> Pod {
        serde_json::from_str(&format!(
            r#"{{
                "metadata": {{"name": "{name}", "namespace": "{namespace}", "labels": {labels}}},
                "spec": {{"containers": [{{"name": "web", "image": "datawire/telepresence-k8s:0.26.0"}}]}},
                "status": {{"phase": "{phase}"}}
            }}"#
        ))
        .unwrap()
    }

    fn labels(pairs: &str) -> HashMap<String, String> {
        serde_json::from_str(pairs).unwrap()
    }

    #[test]
    fn selects_matching_pod() {
        let pods = vec![
            pod_fixture("web-abc12", "default", "Succeeded", r#"{"run": "web"}"#),
            pod_fixture("webby-abc12", "default", "Running", r#"{"run": "web"}"#),
            pod_fixture("web-def34", "other", "Running", r#"{"run": "web"}"#),
            pod_fixture("web-ghi56", "default", "Running", r#"{"run": "other"}"#),
            pod_fixture("web-jkl78", "default", "Running", r#"{"run": "web"}"#),
        ];

        let selected = select_pod(&pods, "web", &labels(r#"{"run": "web"}"#), "default").unwrap();
        assert_eq!(selected.metadata.name, "web-jkl78");
    }

    #[test]
    fn pending_pods_are_eligible() {
        let pods = vec![pod_fixture(
            "web-abc12",
            "default",
            "Pending",
            r#"{"run": "web"}"#,
        )];
        assert!(select_pod(&pods, "web", &labels("{}"), "default").is_some());
    }

    #[test]
    fn superset_labels_match() {
        let pods = vec![pod_fixture(
            "web-abc12",
            "default",
            "Running",
            r#"{"run": "web", "pod-template-hash": "abc12"}"#,
        )];
        assert!(select_pod(&pods, "web", &labels(r#"{"run": "web"}"#), "default").is_some());
    }

    #[test]
    fn finds_companion_container_by_image_token() {
        let pod = pod_fixture("web-abc12", "default", "Running", "{}");
        let container = companion_container(&pod.spec.containers).unwrap();
        assert_eq!(container.name, "web");
    }

    #[test]
    fn image_tag_is_suffix_after_final_colon() {
        assert_eq!(image_tag("datawire/telepresence-k8s:0.26.0"), "0.26.0");
        assert_eq!(
            image_tag("registry.example.com:5000/telepresence-k8s:0.25"),
            "0.25"
        );
        assert_eq!(image_tag("telepresence-k8s"), "");
    }
}
