use std::collections::BTreeMap;

use crate::{kubectl::Kubectl, resolve::PodRef, Result};

pub const POD_VAR: &str = "TELEPRESENCE_POD";
pub const CONTAINER_VAR: &str = "TELEPRESENCE_CONTAINER";

/// Suffixes of the service discovery variable families the orchestrator
/// derives from a service (`<KEY>_SERVICE_HOST`, `<KEY>_PORT_80_TCP_ADDR`, ...).
const SERVICE_SUFFIXES: [&str; 5] = ["_ADDR", "_PORT", "_PROTO", "_HOST", "_TCP"];

/// Environment of the proxy container, as printed by `env` inside it.
/// Immutable once captured.
pub struct PodEnv {
    vars: BTreeMap<String, String>,
}

impl PodEnv {
    pub fn capture(kubectl: &Kubectl, pod: &PodRef) -> Result<Self> {
        let output = kubectl.exec(
            Some(&pod.namespace),
            &pod.pod_name,
            &pod.container_name,
            &["env"],
        )?;
        Ok(Self::parse(&output))
    }

    /// One `NAME=value` record per line. Values containing newlines spill
    /// continuation lines without a `=`; those are dropped.
    pub fn parse(output: &str) -> Self {
        let vars = output
            .lines()
            .filter_map(|line| {
                let (name, value) = line.split_once('=')?;
                if name.is_empty() {
                    return None;
                }
                Some((name.to_owned(), value.to_owned()))
            })
            .collect();
        Self { vars }
    }

    // Part of the API but currently only exercised by tests.
    #[allow(unused)]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// The `<KEY>` prefixes of all `<KEY>_SERVICE_HOST` variables, sorted
    /// lexicographically. The order is the tunnel slot assignment order of
    /// the in-pod forwarder and must be stable across runs.
    pub fn service_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .vars
            .keys()
            .filter_map(|name| name.strip_suffix("_SERVICE_HOST"))
            .filter(|key| !key.is_empty())
            .collect();
        keys.sort_unstable();
        keys
    }
}

/// The subset of the pod environment that is meaningful in the local shell:
/// two synthetic variables naming the proxy endpoint, everything the workload
/// declares for the proxy container, and the service discovery families.
/// Addresses are copied verbatim; the shell dials them through the SOCKS
/// tunnel, so cluster-internal IPs stay valid.
pub fn project(env: &PodEnv, declared: &[String], pod: &PodRef) -> BTreeMap<String, String> {
    let service_keys = env.service_keys();

    let mut projected = BTreeMap::new();
    projected.insert(POD_VAR.to_owned(), pod.pod_name.clone());
    projected.insert(CONTAINER_VAR.to_owned(), pod.container_name.clone());

    for (name, value) in &env.vars {
        if declared.iter().any(|declared| declared == name)
            || is_service_var(name, &service_keys)
        {
            projected.insert(name.clone(), value.clone());
        }
    }

    projected
}

fn is_service_var(name: &str, service_keys: &[&str]) -> bool {
    service_keys.iter().any(|key| {
        name.len() > key.len() + 1
            && name.starts_with(key)
            && name.as_bytes()[key.len()] == b'_'
            && SERVICE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_ref() -> PodRef {
        PodRef {
            namespace: "default".to_owned(),
            pod_name: "web-abc12".to_owned(),
            container_name: "web".to_owned(),
            image_tag: "0.26.0".to_owned(),
        }
    }

    #[test]
    fn parse_skips_malformed_lines() {
        let env = PodEnv::parse("FOO=1\nnot a record\n=empty\nBAR=a=b\n");
        assert_eq!(env.get("FOO"), Some("1"));
        assert_eq!(env.get("BAR"), Some("a=b"));
        assert_eq!(env.get("not a record"), None);
    }

    #[test]
    fn service_keys_are_sorted() {
        let env = PodEnv::parse(
            "ZOO_SERVICE_HOST=10.0.0.3\nAPI_SERVICE_HOST=10.0.0.1\nDB_SERVICE_HOST=10.0.0.2\nAPI_SERVICE_PORT=80\n",
        );
        assert_eq!(env.service_keys(), ["API", "DB", "ZOO"]);
    }

    #[test]
    fn projection_keeps_declared_and_service_variables() {
        let env = PodEnv::parse(
            "FOO=1\nBAR=2\nAPI_SERVICE_HOST=10.0.0.1\nAPI_SERVICE_PORT=80\nAPI_PORT_80_TCP_ADDR=10.0.0.1\nOTHER=x\n",
        );
        let declared = vec!["BAR".to_owned()];

        let projected = project(&env, &declared, &pod_ref());

        assert_eq!(projected.get("BAR").map(String::as_str), Some("2"));
        assert_eq!(
            projected.get("API_SERVICE_HOST").map(String::as_str),
            Some("10.0.0.1")
        );
        assert_eq!(
            projected.get("API_SERVICE_PORT").map(String::as_str),
            Some("80")
        );
        assert_eq!(
            projected.get("API_PORT_80_TCP_ADDR").map(String::as_str),
            Some("10.0.0.1")
        );
        assert!(!projected.contains_key("FOO"));
        assert!(!projected.contains_key("OTHER"));
    }

    #[test]
    fn projection_adds_synthetic_identifiers() {
        let env = PodEnv::parse("");
        let projected = project(&env, &[], &pod_ref());

        assert_eq!(
            projected.get(POD_VAR).map(String::as_str),
            Some("web-abc12")
        );
        assert_eq!(projected.get(CONTAINER_VAR).map(String::as_str), Some("web"));
    }

    #[test]
    fn service_variables_need_matching_suffix() {
        let env = PodEnv::parse(
            "API_SERVICE_HOST=10.0.0.1\nAPI_TOKEN=secret\nAPI_PORT=tcp://10.0.0.1:80\nAPI_PORT_80_TCP=tcp://10.0.0.1:80\n",
        );
        let projected = project(&env, &[], &pod_ref());

        assert!(projected.contains_key("API_SERVICE_HOST"));
        assert!(projected.contains_key("API_PORT"));
        assert!(projected.contains_key("API_PORT_80_TCP"));
        assert!(!projected.contains_key("API_TOKEN"));
    }

    #[test]
    fn projection_is_deterministic() {
        let input = "B_SERVICE_HOST=2\nA_SERVICE_HOST=1\nA_SERVICE_PORT=80\nDECLARED=yes\n";
        let declared = vec!["DECLARED".to_owned()];

        let first = project(&PodEnv::parse(input), &declared, &pod_ref());
        let second = project(&PodEnv::parse(input), &declared, &pod_ref());

        assert_eq!(first, second);
        let names: Vec<&String> = first.keys().collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
