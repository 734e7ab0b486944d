use std::{
    ffi::OsStr,
    fmt, io,
    num::NonZeroI32,
    process,
    sync::Arc,
    time::Duration,
};

use log::debug;

use crate::{deadline::Deadline, logfile::LogSink};

/// Builder over [`std::process::Command`]. Children never read from the
/// terminal: stdin is closed on every launch path except
/// [`Command::spawn_terminal`]. When a [`LogSink`] is attached, the launch is
/// recorded as a `Running: <argv>` line and the child's output is wired into
/// the sink.
pub struct Command {
    inner: process::Command,
    log: Option<Arc<LogSink>>,
    capture_stderr: bool,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl Command {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            inner: process::Command::new(program),
            log: None,
            capture_stderr: false,
        }
    }

    pub fn args<'a, I>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = &'a OsStr>,
    {
        self.inner.args(args);
        self
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.inner.arg(arg);
        self
    }

    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> Self {
        self.inner.env(key, value);
        self
    }

    pub(crate) fn log_to(mut self, log: &Arc<LogSink>) -> Self {
        self.log = Some(Arc::clone(log));
        self
    }

    /// Keep stderr out of the log sink and capture it instead. Used where the
    /// child reports on stderr (ssh prints its version banner there).
    pub fn capture_stderr(mut self) -> Self {
        self.capture_stderr = true;
        self
    }

    fn record_launch(&self) {
        if let Some(log) = &self.log {
            log.note(&format!("Running: {:?}", self.inner));
        }
        if log::log_enabled!(log::Level::Debug) {
            debug!("running `{command:?}`...", command = &self.inner);
        }
    }

    fn sink_stdio(&self) -> io::Result<process::Stdio> {
        match &self.log {
            Some(log) => log.stdio(),
            None => Ok(process::Stdio::inherit()),
        }
    }

    fn fail(self, error: io::Error) -> Error {
        Error {
            command: self,
            kind: error.into(),
        }
    }

    pub fn try_status(mut self) -> Result<ExitStatus, Error> {
        self.record_launch();
        self.inner.stdin(process::Stdio::null());
        let (stdout, stderr) = match (self.sink_stdio(), self.sink_stdio()) {
            (Ok(stdout), Ok(stderr)) => (stdout, stderr),
            (Err(error), _) | (_, Err(error)) => return Err(self.fail(error)),
        };
        self.inner.stdout(stdout);
        self.inner.stderr(stderr);

        match self.inner.status() {
            Ok(status) => Ok(ExitStatus {
                command: self,
                status,
            }),
            Err(error) => Err(self.fail(error)),
        }
    }

    pub fn status(self) -> Result<(), Error> {
        self.try_status().and_then(ExitStatus::require_success)
    }

    pub fn try_output(mut self) -> Result<Output, Error> {
        self.record_launch();
        self.inner.stdin(process::Stdio::null());
        self.inner.stdout(process::Stdio::piped());
        if !self.capture_stderr {
            let stderr = match self.sink_stdio() {
                Ok(stderr) => stderr,
                Err(error) => return Err(self.fail(error)),
            };
            self.inner.stderr(stderr);
        }

        match self.inner.output() {
            Ok(output) => Ok(Output {
                command: self,
                output,
            }),
            Err(error) => Err(self.fail(error)),
        }
    }

    pub fn output(self) -> Result<Output, Error> {
        self.try_output().and_then(Output::require_success)
    }

    /// Runs the command with the provided bytes piped to its stdin and the
    /// stdout captured.
    pub fn output_with_input(mut self, input: Vec<u8>) -> Result<Output, Error> {
        self.record_launch();
        self.inner.stdin(process::Stdio::piped());
        self.inner.stdout(process::Stdio::piped());
        let stderr = match self.sink_stdio() {
            Ok(stderr) => stderr,
            Err(error) => return Err(self.fail(error)),
        };
        self.inner.stderr(stderr);

        let mut child = match self.inner.spawn() {
            Ok(child) => child,
            Err(error) => return Err(self.fail(error)),
        };

        let stdin_thread = std::thread::spawn({
            let mut stdin = child.stdin.take().expect("Failed to open stdin");
            move || {
                use std::io::Write;
                stdin.write_all(&input).expect("Failed to write to stdin");
            }
        });

        let output = child.wait_with_output().expect("Failed to read stdout");
        stdin_thread
            .join()
            .expect("Thread writing to stdin panicked");

        Output {
            command: self,
            output,
        }
        .require_success()
    }

    /// Starts a long-lived helper with its output wired to the log sink.
    pub fn spawn_supervised(mut self, name: &str) -> Result<ChildProcess, Error> {
        self.record_launch();
        self.inner.stdin(process::Stdio::null());
        let (stdout, stderr) = match (self.sink_stdio(), self.sink_stdio()) {
            (Ok(stdout), Ok(stderr)) => (stdout, stderr),
            (Err(error), _) | (_, Err(error)) => return Err(self.fail(error)),
        };
        self.inner.stdout(stdout);
        self.inner.stderr(stderr);

        match self.inner.spawn() {
            Ok(child) => Ok(ChildProcess::new(name, child)),
            Err(error) => Err(self.fail(error)),
        }
    }

    /// Starts a child that inherits the controlling terminal.
    pub fn spawn_terminal(mut self, name: &str) -> Result<ChildProcess, Error> {
        self.record_launch();
        match self.inner.spawn() {
            Ok(child) => Ok(ChildProcess::new(name, child)),
            Err(error) => Err(self.fail(error)),
        }
    }
}

#[derive(Debug)]
pub struct ExitStatus {
    command: Command,
    status: process::ExitStatus,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn require_success(self) -> Result<(), Error> {
        let ExitStatus { command, status } = self;
        if status.success() {
            Ok(())
        } else {
            Err(Error {
                command,
                kind: ErrorKind::NonZeroExitStatus(status.code().and_then(NonZeroI32::new)),
            })
        }
    }
}

#[derive(Debug)]
pub struct Output {
    pub command: Command,
    pub output: process::Output,
}

impl Output {
    pub fn require_success(self) -> Result<Output, Error> {
        let Output { command, output } = self;
        if output.status.success() {
            Ok(Output { command, output })
        } else {
            Err(Error {
                command,
                kind: ErrorKind::NonZeroExitStatus(output.status.code().and_then(NonZeroI32::new)),
            })
        }
    }
}

impl std::ops::Deref for Output {
    type Target = process::Output;

    fn deref(&self) -> &Self::Target {
        &self.output
    }
}

/// Handle over a spawned helper. Death is observed by polling; termination
/// first asks politely and only escalates to SIGKILL through [`kill`].
///
/// [`kill`]: ChildProcess::kill
pub struct ChildProcess {
    name: String,
    child: process::Child,
    status: Option<process::ExitStatus>,
}

impl ChildProcess {
    fn new(name: &str, child: process::Child) -> Self {
        Self {
            name: name.to_owned(),
            child,
            status: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The exit status if the child has exited, reaping it as a side effect.
    pub fn poll(&mut self) -> Option<process::ExitStatus> {
        if self.status.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.status = Some(status);
            }
        }
        self.status
    }

    pub fn alive(&mut self) -> bool {
        self.poll().is_none()
    }

    /// Requests graceful termination. No-op if the child already exited.
    pub fn terminate(&mut self) {
        if !self.alive() {
            return;
        }
        #[cfg(unix)]
        // SAFETY: kill with a valid pid and signal has no memory effects.
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }
    }

    pub fn kill(&mut self) {
        if self.alive() {
            let _ = self.child.kill();
        }
        self.poll();
    }

    /// Waits for the child to exit, polling at a coarse interval.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<process::ExitStatus> {
        const INTERVAL: Duration = Duration::from_millis(50);

        let deadline = Deadline::after(timeout);
        loop {
            if let Some(status) = self.poll() {
                return Some(status);
            }
            if deadline.sleep(INTERVAL).is_err() {
                return self.poll();
            }
        }
    }
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcess")
            .field("name", &self.name)
            .field("pid", &self.child.id())
            .finish()
    }
}

#[derive(Debug)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    NonZeroExitStatus(Option<NonZeroI32>),
    Io(io::Error),
}

impl From<io::Error> for ErrorKind {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::Io(value),
        }
    }
}

#[derive(Debug)]
pub struct Error {
    pub command: Command,
    pub kind: ErrorKind,
}

impl Error {
    // Part of the API but currently only exercised by tests.
    #[allow(unused)]
    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::NotFound)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to run `{command:?}`: ",
            command = &self.command.inner
        )?;
        match &self.kind {
            ErrorKind::NotFound => {
                let program = self.command.inner.get_program().to_string_lossy();
                write!(f, "the `{program}` command is required but not available on your system, please install it")
            }
            ErrorKind::PermissionDenied => {
                let program = self.command.inner.get_program().to_string_lossy();
                write!(f, "the `{program}` command is available but does not have the right permissions, please make sure the binary is executable")
            }
            ErrorKind::NonZeroExitStatus(code) => {
                if let Some(code) = code {
                    write!(f, "exited with non-zero exit code `{code}`")
                } else {
                    write!(f, "did not run succesfully")
                }
            }
            ErrorKind::Io(error) => error.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Creates a new [`Command`] and supplies the provided arguments, if any, while calling
/// [`std::convert::AsRef::as_ref`] on each.
macro_rules! command {
    ($program:expr) => {
        $crate::process::Command::new($program)
    };
    ($program:expr, $($arg:expr),+ $(,)?) => {
        $crate::process::args!($crate::process::Command::new($program), $($arg),+)
    };
}

/// Calls [`Command::args`] on the provided [`Command`] while calling [`std::convert::AsRef::as_ref`]
/// on each argument.
macro_rules! args {
    ($command:expr, $($arg:expr),+ $(,)?) => {
        $command.args([
            $(($arg).as_ref(),)*
        ])
    }
}

pub(crate) use args;
pub(crate) use command;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_captures_trimmed_stdout() {
        let output = command!("echo", "hello").output().unwrap();
        assert_eq!(std::str::from_utf8(&output.stdout).unwrap().trim(), "hello");
    }

    #[test]
    fn status_reports_nonzero_exit() {
        let error = command!("sh", "-c", "exit 3").status().unwrap_err();
        match error.kind {
            ErrorKind::NonZeroExitStatus(Some(code)) => assert_eq!(code.get(), 3),
            other => panic!("unexpected error kind: {other:?}"),
        }
    }

    #[test]
    fn missing_program_maps_to_not_found() {
        let error = command!("telepresence-no-such-program").status().unwrap_err();
        assert!(error.is_not_found());
    }

    #[test]
    fn output_with_input_pipes_stdin() {
        let output = command!("cat").output_with_input(b"ping".to_vec()).unwrap();
        assert_eq!(&output.stdout, b"ping");
    }

    #[test]
    fn stdin_is_closed_for_background_children() {
        // `cat` exits immediately on EOF instead of blocking forever.
        let mut child = command!("cat").spawn_supervised("cat").unwrap();
        let status = child.wait_timeout(Duration::from_secs(5)).unwrap();
        assert!(status.success());
    }

    #[test]
    fn terminate_stops_a_running_child() {
        let mut child = command!("sleep", "30").spawn_supervised("sleep").unwrap();
        assert!(child.alive());
        child.terminate();
        assert!(child.wait_timeout(Duration::from_secs(5)).is_some());
        assert!(!child.alive());
    }
}
