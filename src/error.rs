use std::{fmt, io};

use crate::process;

#[derive(Debug)]
pub enum Error {
    /// A required tool is missing or unusable.
    Preflight(String),
    /// A collaborator command failed to run or exited non-zero.
    Command(process::Error),
    PodNotFound { workload: String, namespace: String },
    PodNotReady { pod: String },
    VersionMismatch { image_version: String, local_version: String },
    TunnelNotReady,
    Interrupted,
    Io(io::Error),
    Json(serde_json::Error),
    Utf8(std::str::Utf8Error),
    Other(String),
}

impl Error {
    /// True for faults outside the enumerated failure modes, for which the
    /// user is asked to file a bug report.
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Json(_) | Error::Utf8(_) | Error::Other(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Preflight(message) => f.write_str(message),
            Error::Command(error) => error.fmt(f),
            Error::PodNotFound {
                workload,
                namespace,
            } => write!(
                f,
                "no running pod found for deployment {workload:?} in namespace {namespace:?}"
            ),
            Error::PodNotReady { pod } => {
                write!(f, "pod {pod:?} did not become ready in time")
            }
            Error::VersionMismatch {
                image_version,
                local_version,
            } => write!(
                f,
                "the deployment runs proxy image version {image_version} but this binary is version {local_version}; use the matching release or recreate the deployment"
            ),
            Error::TunnelNotReady => {
                f.write_str("could not establish the ssh tunnel into the pod")
            }
            Error::Interrupted => f.write_str("interrupted"),
            Error::Io(error) => error.fmt(f),
            Error::Json(error) => write!(f, "unexpected kubectl output: {error}"),
            Error::Utf8(error) => write!(f, "unexpected non-UTF-8 command output: {error}"),
            Error::Other(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Command(error) => Some(error),
            Error::Io(error) => Some(error),
            Error::Json(error) => Some(error),
            Error::Utf8(error) => Some(error),
            _ => None,
        }
    }
}

impl From<process::Error> for Error {
    fn from(error: process::Error) -> Self {
        Error::Command(error)
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Json(error)
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(error: std::str::Utf8Error) -> Self {
        Error::Utf8(error)
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Other(message)
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::Other(message.to_owned())
    }
}
