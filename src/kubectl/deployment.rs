use std::collections::HashMap;

use serde::Deserialize;
use serde_json::json;

use super::{common, pod};

/// Partially implements [Deployment](https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/deployment-v1/).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub metadata: common::ResourceMetadata,
    pub spec: DeploymentSpec,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    pub template: PodTemplateSpec,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub metadata: TemplateMetadata,

    pub spec: pod::PodSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Deployment {
    /// Labels every pod materialized from this deployment carries.
    pub fn pod_labels(&self) -> &HashMap<String, String> {
        &self.spec.template.metadata.labels
    }

    pub fn containers(&self) -> &[pod::ContainerSpec] {
        &self.spec.template.spec.containers
    }
}

/// Body for `kubectl create -f -`: a single-replica deployment running the
/// proxy image, labeled the way `kubectl run` labels its deployments so that
/// pods can be traced back by label.
pub fn deployment_spec(
    namespace: Option<&str>,
    name: &str,
    image: &str,
    ports: &[u16],
) -> serde_json::Value {
    let container_ports: Vec<serde_json::Value> = ports
        .iter()
        .map(|port| json!({"containerPort": port}))
        .collect();

    let mut metadata = json!({"name": name, "labels": {"run": name}});
    if let Some(namespace) = namespace {
        metadata["namespace"] = json!(namespace);
    }

    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": metadata,
        "spec": {
            "replicas": 1,
            "selector": {"matchLabels": {"run": name}},
            "template": {
                "metadata": {"labels": {"run": name}},
                "spec": {
                    "containers": [{
                        "name": name,
                        "image": image,
                        "ports": container_ports,
                    }],
                },
            },
        },
    })
}

/// Body for the companion service exposing the requested ports on the
/// deployment's pods.
pub fn service_spec(namespace: Option<&str>, name: &str, ports: &[u16]) -> serde_json::Value {
    let service_ports: Vec<serde_json::Value> = ports
        .iter()
        .map(|port| json!({"name": format!("port-{port}"), "port": port, "targetPort": port}))
        .collect();

    let mut metadata = json!({"name": name});
    if let Some(namespace) = namespace {
        metadata["namespace"] = json!(namespace);
    }

    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": metadata,
        "spec": {
            "selector": {"run": name},
            "ports": service_ports,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_deployment_template() {
        let deployment: Deployment = serde_json::from_str(
            r#"{
                "metadata": {"name": "web", "namespace": "team"},
                "spec": {
                    "template": {
                        "metadata": {"labels": {"run": "web"}},
                        "spec": {
                            "containers": [{
                                "name": "web",
                                "image": "datawire/telepresence-k8s:0.26.0",
                                "env": [{"name": "BAR", "value": "2"}]
                            }]
                        }
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(deployment.metadata.namespace.as_deref(), Some("team"));
        assert_eq!(deployment.pod_labels().get("run").unwrap(), "web");
        let container = &deployment.containers()[0];
        assert_eq!(container.env[0].name, "BAR");
        assert_eq!(container.env[0].value.as_deref(), Some("2"));
    }

    #[test]
    fn deployment_spec_shape() {
        let spec = deployment_spec(Some("team"), "dev", "datawire/telepresence-k8s:0.26.0", &[8080]);

        assert_eq!(spec["metadata"]["name"], "dev");
        assert_eq!(spec["metadata"]["namespace"], "team");
        assert_eq!(spec["metadata"]["labels"]["run"], "dev");
        assert_eq!(spec["spec"]["selector"]["matchLabels"]["run"], "dev");
        assert_eq!(
            spec["spec"]["template"]["metadata"]["labels"]["run"],
            "dev"
        );
        let container = &spec["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "datawire/telepresence-k8s:0.26.0");
        assert_eq!(container["ports"][0]["containerPort"], 8080);
    }

    #[test]
    fn deployment_spec_omits_namespace_when_unset() {
        let spec = deployment_spec(None, "dev", "img", &[]);
        assert!(spec["metadata"].get("namespace").is_none());
        assert_eq!(
            spec["spec"]["template"]["spec"]["containers"][0]["ports"],
            json!([])
        );
    }

    #[test]
    fn service_spec_shape() {
        let spec = service_spec(None, "dev", &[8080, 9090]);

        assert_eq!(spec["metadata"]["name"], "dev");
        assert_eq!(spec["spec"]["selector"]["run"], "dev");
        assert_eq!(spec["spec"]["ports"][0]["port"], 8080);
        assert_eq!(spec["spec"]["ports"][1]["targetPort"], 9090);
        assert_eq!(spec["spec"]["ports"][1]["name"], "port-9090");
    }
}
