use std::fmt;

use serde::Deserialize;

use super::common;

/// Partially implements [Pod](https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/pod-v1/).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub metadata: common::ResourceMetadata,

    #[serde(default)]
    pub spec: PodSpec,

    pub status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

/// Container entry of a pod spec or pod template. Only the fields the session
/// inspects: the image reference identifies the proxy container and its tag,
/// `env` carries the variables declared for the workload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,

    pub image: String,

    #[serde(default)]
    pub env: Vec<EnvVar>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,

    #[serde(default)]
    pub value: Option<String>,
}

/// Partially implements [PodStatus](https://kubernetes.io/docs/reference/generated/kubernetes-api/v1.30/#podstatus-v1-core).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    pub phase: PodPhase,

    /// One entry per container in the manifest.
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

impl PodStatus {
    pub fn container_ready(&self, name: &str) -> bool {
        self.container_statuses
            .iter()
            .any(|status| status.name == name && status.ready)
    }
}

/// https://kubernetes.io/docs/reference/generated/kubernetes-api/v1.30/#containerstatus-v1-core
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub name: String,

    /// Whether the container passed its readiness probe.
    pub ready: bool,
}

/// Field `phase` of [PodStatus](https://kubernetes.io/docs/reference/generated/kubernetes-api/v1.30/#podstatus-v1-core).
#[derive(Debug, Deserialize, Eq, PartialEq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// A pod in a terminal phase can never serve as a proxy endpoint.
    pub fn is_startable(&self) -> bool {
        matches!(self, PodPhase::Pending | PodPhase::Running)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_pod_with_readiness() {
        let pod: Pod = serde_json::from_str(
            r#"{
                "metadata": {
                    "name": "web-6b8c9f",
                    "namespace": "default",
                    "labels": {"run": "web"}
                },
                "spec": {
                    "containers": [{"name": "web", "image": "datawire/telepresence-k8s:0.26.0"}]
                },
                "status": {
                    "phase": "Running",
                    "containerStatuses": [{"name": "web", "ready": true}]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(pod.metadata.name, "web-6b8c9f");
        assert_eq!(pod.status.phase, PodPhase::Running);
        assert!(pod.status.container_ready("web"));
        assert!(!pod.status.container_ready("sidecar"));
    }

    #[test]
    fn terminal_phases_are_not_startable() {
        assert!(PodPhase::Pending.is_startable());
        assert!(PodPhase::Running.is_startable());
        assert!(!PodPhase::Succeeded.is_startable());
        assert!(!PodPhase::Failed.is_startable());
        assert!(!PodPhase::Unknown.is_startable());
    }
}
