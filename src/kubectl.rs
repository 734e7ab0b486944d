use std::sync::Arc;

use crate::{logfile::LogSink, process, Result};

mod common;
pub use common::*;

mod pod;
pub use pod::*;

mod deployment;
pub use deployment::*;

/// Typed facade over the `kubectl` command line client. Authentication,
/// context selection and namespace defaulting stay with the client's own
/// configuration; failures propagate to the caller without retries.
#[derive(Clone)]
pub struct Kubectl {
    log: Arc<LogSink>,
}

impl Kubectl {
    pub fn new(log: Arc<LogSink>) -> Self {
        Self { log }
    }

    fn kubectl(&self, namespace: Option<&str>) -> process::Command {
        let mut command = process::command!("kubectl").log_to(&self.log);
        if let Some(namespace) = namespace {
            command = process::args!(command, "--namespace", namespace);
        }
        command
    }

    /// Short name of the active cluster context. Doubles as the check that the
    /// client is installed and configured.
    pub fn current_context(&self) -> Result<String> {
        let output =
            process::args!(self.kubectl(None), "config", "current-context").output()?;
        Ok(std::str::from_utf8(&output.stdout)?.trim().to_owned())
    }

    /// The namespace the active context defaults to, if it declares one.
    pub fn default_namespace(&self) -> Result<Option<String>> {
        let output = process::args!(
            self.kubectl(None),
            "config",
            "view",
            "--minify",
            "--output",
            "jsonpath={..namespace}"
        )
        .output()?;

        let value = std::str::from_utf8(&output.stdout)?.trim().to_owned();
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    /// Creates a deployment running `image`, plus a service when `ports` is
    /// non-empty. Idempotent: existing resources of the same name are deleted
    /// first.
    pub fn create_workload(
        &self,
        namespace: Option<&str>,
        name: &str,
        image: &str,
        ports: &[u16],
    ) -> Result<()> {
        self.delete_workload(namespace, name)?;

        let deployment = deployment_spec(namespace, name, image, ports);
        process::args!(self.kubectl(namespace), "create", "-f", "-")
            .output_with_input(serde_json::to_vec(&deployment)?)?;

        if !ports.is_empty() {
            let service = service_spec(namespace, name, ports);
            process::args!(self.kubectl(namespace), "create", "-f", "-")
                .output_with_input(serde_json::to_vec(&service)?)?;
        }

        Ok(())
    }

    /// Deletes the service and deployment of that name, tolerating absence.
    pub fn delete_workload(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        process::args!(
            self.kubectl(namespace),
            "delete",
            "svc,deployment",
            "--ignore-not-found",
            name
        )
        .status()?;
        Ok(())
    }

    pub fn deployment(&self, namespace: Option<&str>, name: &str) -> Result<Deployment> {
        let output = process::args!(
            self.kubectl(namespace),
            "get",
            "deployment",
            name,
            "--output=json"
        )
        .output()?;

        Ok(serde_json::from_slice(&output.stdout)?)
    }

    pub fn pods(&self, namespace: Option<&str>) -> Result<Vec<Pod>> {
        let output = process::args!(self.kubectl(namespace), "get", "pods", "--output=json")
            .output()?;

        Ok(serde_json::from_slice::<GetResource<_>>(&output.stdout)?.items)
    }

    pub fn pod(&self, namespace: Option<&str>, pod_name: &str) -> Result<Pod> {
        let output = process::args!(
            self.kubectl(namespace),
            "get",
            "pod",
            pod_name,
            "--output=json"
        )
        .output()?;

        Ok(serde_json::from_slice(&output.stdout)?)
    }

    /// Runs `argv` inside the container and returns the trimmed stdout.
    pub fn exec(
        &self,
        namespace: Option<&str>,
        pod_name: &str,
        container: &str,
        argv: &[&str],
    ) -> Result<String> {
        let mut command = process::args!(
            self.kubectl(namespace),
            "exec",
            pod_name,
            "--container",
            container,
            "--"
        );
        for arg in argv {
            command = command.arg(arg);
        }
        let output = command.output()?;

        Ok(std::str::from_utf8(&output.stdout)?.trim().to_owned())
    }

    /// Starts a `kubectl port-forward` helper binding `local` on loopback to
    /// `remote` in the pod. The caller probes the local port for readiness.
    pub fn port_forward(
        &self,
        namespace: Option<&str>,
        pod_name: &str,
        local: u16,
        remote: u16,
    ) -> Result<process::ChildProcess> {
        let child = process::args!(
            self.kubectl(namespace),
            "port-forward",
            format!("pod/{pod_name}"),
            format!("{local}:{remote}")
        )
        .spawn_supervised("kubectl port-forward")?;

        Ok(child)
    }
}
