use clap::{ArgGroup, Parser};
use constcat::concat;

use crate::{session, version, Error, Result};

#[derive(Debug, Parser)]
#[command(version = version::VERSION, about)]
#[command(group(
    ArgGroup::new("workload")
        .required(true)
        .args(["deployment", "new_deployment"])
))]
pub struct Cli {
    /// Adopt an existing deployment that already runs the proxy image.
    #[arg(long = "deployment", value_name = "NAME")]
    deployment: Option<String>,

    #[arg(
        long = "new-deployment",
        value_name = "NAME",
        help = concat!("Create a throwaway deployment running the ", version::DEFAULT_IMAGE, " image and delete it again on exit")
    )]
    new_deployment: Option<String>,

    /// Kubernetes namespace; defaults to the active context's namespace.
    #[arg(long = "namespace", value_name = "NAME")]
    namespace: Option<String>,

    /// Local port to make reachable from inside the cluster. May be repeated.
    #[arg(long = "expose", value_name = "PORT")]
    expose: Vec<u16>,

    /// Start a proxied local shell. Required; reserved for future modes.
    #[arg(long = "run-shell")]
    run_shell: bool,

    /// Where to write the session log; `-` means standard output.
    #[arg(long = "logfile", value_name = "PATH", default_value = "./telepresence.log")]
    logfile: String,
}

impl Cli {
    pub fn run(&self) -> Result<session::Exit> {
        self.require_run_shell()?;

        let (workload, create) = match (&self.deployment, &self.new_deployment) {
            (Some(name), None) => (name.clone(), false),
            (None, Some(name)) => (name.clone(), true),
            // clap enforces exactly one of the two.
            _ => unreachable!(),
        };

        session::run(session::Options {
            workload,
            create,
            namespace: self.namespace.clone(),
            expose: self.expose.clone(),
            logfile: self.logfile.clone(),
        })
    }

    /// The only implemented mode must be requested explicitly; the flag is
    /// reserved for future alternatives.
    fn require_run_shell(&self) -> Result<()> {
        if self.run_shell {
            Ok(())
        } else {
            Err(Error::Preflight(
                "the --run-shell flag is required; no other session modes exist yet".to_owned(),
            ))
        }
    }

    /// Printed when the session fails outside the enumerated failure modes.
    pub fn crash_report(&self) {
        eprintln!();
        eprintln!("This looks like a bug. Please file an issue and include the report below.");
        eprintln!("  version: {}", version::version());
        eprintln!(
            "  os: {os} {arch}",
            os = std::env::consts::OS,
            arch = std::env::consts::ARCH,
        );
        eprintln!("  argv: {:?}", std::env::args().collect::<Vec<_>>());
        if let Ok(output) = std::process::Command::new("kubectl")
            .args(["version", "--client"])
            .output()
        {
            if let Some(line) = String::from_utf8_lossy(&output.stdout).lines().next() {
                eprintln!("  kubectl: {line}");
            }
        }
        if self.logfile != "-" {
            if let Ok(contents) = std::fs::read_to_string(&self.logfile) {
                eprintln!("  log tail:");
                let lines: Vec<&str> = contents.lines().collect();
                let start = lines.len().saturating_sub(20);
                for line in &lines[start..] {
                    eprintln!("    {line}");
                }
            }
        }
    }
}
