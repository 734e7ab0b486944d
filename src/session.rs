use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    deadline::Deadline,
    environment::{self, PodEnv},
    kubectl::Kubectl,
    logfile::LogSink,
    process::{self, ChildProcess},
    resolve, shell, tunnel, version, Error, Result,
};

const WATCH_INTERVAL: Duration = Duration::from_millis(100);
const SETTLE: Duration = Duration::from_secs(5);
const GRACE: Duration = Duration::from_secs(2);

pub struct Options {
    pub workload: String,
    /// Create the workload first and delete it again on exit.
    pub create: bool,
    pub namespace: Option<String>,
    pub expose: Vec<u16>,
    pub logfile: String,
}

/// How a session ended.
#[derive(Debug)]
pub enum Exit {
    /// The shell exited on its own; carries its exit status.
    Shell(i32),
    /// A supervised helper died while the shell was still running; carries
    /// the helper's name.
    ProxyLost(String),
}

static SIGNALS: AtomicUsize = AtomicUsize::new(0);

/// True once SIGINT or SIGTERM has been received. Long-running poll loops
/// check this between iterations so that teardown always runs.
pub(crate) fn interrupted() -> bool {
    SIGNALS.load(Ordering::SeqCst) > 0
}

fn install_signal_handler() {
    // The handler runs on its own thread and only flips a counter; the
    // supervisor observes it from its poll loops and owns all teardown.
    if let Err(error) = ctrlc::set_handler(|| {
        SIGNALS.fetch_add(1, Ordering::SeqCst);
    }) {
        warn!("Could not install signal handler: {error}");
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum State {
    Starting,
    Running,
    Draining,
    Exited,
}

/// One invocation of the tool: owns the log sink, the cleanup stack and the
/// supervised helper processes. Cleanup actions run exactly once, in reverse
/// registration order, on every exit path including panics (via `Drop`).
pub struct Session {
    log: Arc<LogSink>,
    cleanups: Vec<(String, Box<dyn FnOnce() + Send>)>,
    supervised: Vec<ChildProcess>,
    state: State,
}

impl Session {
    pub(crate) fn new(log: LogSink) -> Self {
        Self {
            log: Arc::new(log),
            cleanups: Vec::new(),
            supervised: Vec::new(),
            state: State::Starting,
        }
    }

    pub(crate) fn log(&self) -> &Arc<LogSink> {
        &self.log
    }

    /// Registers a cleanup action for teardown.
    pub fn defer(&mut self, what: &str, action: impl FnOnce() + Send + 'static) {
        self.cleanups.push((what.to_owned(), Box::new(action)));
    }

    /// Adds a long-lived helper to the watch list. If it dies before the
    /// shell exits, the session is torn down.
    pub fn supervise(&mut self, child: ChildProcess) {
        debug!("supervising {name}", name = child.name());
        self.supervised.push(child);
    }

    fn advance(&mut self, next: State) {
        // Transitions are irreversible.
        if next <= self.state {
            return;
        }
        debug!("session state: {current:?} -> {next:?}", current = self.state);
        self.state = next;
    }

    /// Blocks until the shell exits or a helper dies, whichever comes first,
    /// then tears everything down. Child deaths are noticed within the watch
    /// interval.
    pub fn watch(&mut self, mut shell: ChildProcess) -> Exit {
        self.advance(State::Running);
        let exit = loop {
            if interrupted() {
                info!("Interrupted; shutting down the session");
                let status = stop(&mut shell);
                break Exit::Shell(status.unwrap_or(1));
            }
            if let Some(status) = shell.poll() {
                break Exit::Shell(status.code().unwrap_or(1));
            }
            if let Some(name) = self.dead_helper() {
                warn!("{name} exited while the shell was still running");
                stop(&mut shell);
                break Exit::ProxyLost(name);
            }
            thread::sleep(WATCH_INTERVAL);
        };
        self.drain();
        exit
    }

    fn dead_helper(&mut self) -> Option<String> {
        for child in self.supervised.iter_mut() {
            if !child.alive() {
                return Some(child.name().to_owned());
            }
        }
        None
    }

    /// Terminates helpers and runs the cleanup stack. Idempotent.
    pub fn drain(&mut self) {
        self.advance(State::Draining);
        self.shutdown_children();
        while let Some((what, action)) = self.cleanups.pop() {
            debug!("cleanup: {what}");
            action();
        }
        self.advance(State::Exited);
    }

    /// Asks every helper to terminate, allowing a grace window before
    /// escalating to SIGKILL. A second interrupt cuts the window short.
    fn shutdown_children(&mut self) {
        for child in &mut self.supervised {
            child.terminate();
        }

        let signals_before = SIGNALS.load(Ordering::SeqCst);
        let deadline = Deadline::after(GRACE);
        loop {
            if self.supervised.iter_mut().all(|child| !child.alive()) {
                return;
            }
            if SIGNALS.load(Ordering::SeqCst) > signals_before
                || deadline.sleep(WATCH_INTERVAL).is_err()
            {
                break;
            }
        }

        for child in &mut self.supervised {
            child.kill();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.drain();
    }
}

/// Terminates a child, escalating after the grace window, and returns its
/// exit code if one could be collected.
fn stop(child: &mut ChildProcess) -> Option<i32> {
    child.terminate();
    match child.wait_timeout(GRACE) {
        Some(status) => status.code(),
        None => {
            child.kill();
            None
        }
    }
}

/// Runs a whole session: preflight, workload creation, pod resolution,
/// tunnels, environment projection, shell, watch loop. Strictly staged; no
/// step starts before the previous one reported success.
pub fn run(options: Options) -> Result<Exit> {
    install_signal_handler();

    let log = LogSink::open(&options.logfile)?;
    let mut session = Session::new(log);
    let kubectl = Kubectl::new(Arc::clone(session.log()));

    let context = preflight(&kubectl, &session)?;

    let namespace = match options.namespace.clone() {
        Some(namespace) => Some(namespace),
        None => kubectl.default_namespace()?,
    };

    if options.create {
        let image = version::companion_image();
        info!(
            "Creating deployment {workload} running {image}",
            workload = options.workload,
        );
        kubectl.create_workload(
            namespace.as_deref(),
            &options.workload,
            &image,
            &options.expose,
        )?;

        let deleter = kubectl.clone();
        let delete_namespace = namespace.clone();
        let name = options.workload.clone();
        session.defer("delete deployment", move || {
            if let Err(error) = deleter.delete_workload(delete_namespace.as_deref(), &name) {
                warn!("Failed to delete deployment {name}: {error}");
            }
        });
    }

    let resolved = resolve::resolve(&kubectl, &options.workload, namespace.as_deref())?;
    info!(
        "Proxying via pod {namespace}/{name} (proxy image tag {tag})",
        namespace = resolved.pod.namespace,
        name = resolved.pod.pod_name,
        tag = resolved.pod.image_tag,
    );

    let tunnels = tunnel::establish(&mut session, &kubectl, &resolved.pod, &options.expose)?;
    debug!(
        "control channel on 127.0.0.1:{control}, SOCKS on 127.0.0.1:{socks}",
        control = tunnels.control_port,
        socks = tunnels.socks_port,
    );

    settle();
    if interrupted() {
        return Err(Error::Interrupted);
    }

    let pod_env = PodEnv::capture(&kubectl, &resolved.pod)?;
    let projected = environment::project(&pod_env, &resolved.declared_env, &resolved.pod);

    let shell = shell::launch(&mut session, projected, tunnels.socks_port, &context)?;

    Ok(session.watch(shell))
}

/// The ssh port-forward reports ready slightly before the reverse and
/// forward bindings are usable end to end.
fn settle() {
    info!("Waiting for the tunnels to settle...");
    let deadline = Deadline::after(SETTLE);
    while !interrupted() && deadline.sleep(WATCH_INTERVAL).is_ok() {}
}

/// Verifies the external collaborators before touching the cluster: kubectl
/// must have an active context, ssh must be OpenSSH, torsocks must be
/// installed. Returns the context name.
fn preflight(kubectl: &Kubectl, session: &Session) -> Result<String> {
    let context = kubectl
        .current_context()
        .map_err(|error| Error::Preflight(format!("kubectl is not usable: {error}")))?;

    let banner = process::command!("ssh", "-V")
        .log_to(session.log())
        .capture_stderr()
        .output()
        .map_err(|error| Error::Preflight(error.to_string()))?;
    // ssh prints its version banner on stderr.
    let banner = String::from_utf8_lossy(&banner.stderr);
    if !banner.contains("OpenSSH") {
        return Err(Error::Preflight(format!(
            "unsupported ssh client ({banner}); OpenSSH is required",
            banner = banner.trim(),
        )));
    }

    // torsocks without arguments prints usage and exits non-zero; only a
    // missing binary is an error here.
    if let Err(error) = process::command!("torsocks").log_to(session.log()).try_status() {
        return Err(Error::Preflight(error.to_string()));
    }

    Ok(context)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn test_session() -> Session {
        Session::new(LogSink::open("-").unwrap())
    }

    #[test]
    fn cleanups_run_in_reverse_order_exactly_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut session = test_session();
        for index in 0..3 {
            let order = Arc::clone(&order);
            session.defer(&format!("cleanup {index}"), move || {
                order.lock().unwrap().push(index);
            });
        }

        session.drain();
        assert_eq!(*order.lock().unwrap(), [2, 1, 0]);

        // A second drain must not run anything again.
        session.drain();
        assert_eq!(*order.lock().unwrap(), [2, 1, 0]);
    }

    #[test]
    fn cleanups_run_on_drop() {
        let ran = Arc::new(Mutex::new(false));
        {
            let ran = Arc::clone(&ran);
            let mut session = test_session();
            session.defer("mark", move || *ran.lock().unwrap() = true);
        }
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn drain_terminates_supervised_children() {
        let mut session = test_session();
        let child = process::command!("sleep", "30")
            .spawn_supervised("sleep")
            .unwrap();
        session.supervise(child);

        session.drain();
        assert!(session.supervised.iter_mut().all(|child| !child.alive()));
    }

    #[test]
    fn state_never_goes_backwards() {
        let mut session = test_session();
        session.advance(State::Running);
        session.advance(State::Starting);
        assert_eq!(session.state, State::Running);
        session.drain();
        assert_eq!(session.state, State::Exited);
    }
}
