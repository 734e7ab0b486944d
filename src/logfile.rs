use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    process::Stdio,
};

/// Destination for session records and the combined stdout/stderr of every
/// child process. Either the process' own standard output or a file that is
/// truncated once at session start and appended to afterwards.
///
/// Children write through their own descriptors in append mode, so the kernel
/// serializes records at line granularity without any in-process locking.
pub enum LogSink {
    Stdout,
    File { path: PathBuf, file: fs::File },
}

impl LogSink {
    /// `-` selects standard output.
    pub fn open(target: &str) -> io::Result<Self> {
        if target == "-" {
            return Ok(LogSink::Stdout);
        }
        let path = PathBuf::from(target);
        // Truncate first, then reopen in append mode so that every handle
        // cloned for a child inherits O_APPEND.
        fs::File::create(&path)?;
        let file = fs::OpenOptions::new().append(true).open(&path)?;
        Ok(LogSink::File { path, file })
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            LogSink::Stdout => None,
            LogSink::File { path, .. } => Some(path),
        }
    }

    /// Writes a single record, flushed immediately.
    pub fn note(&self, line: &str) {
        match self {
            LogSink::Stdout => println!("{line}"),
            LogSink::File { file, .. } => {
                let mut file: &fs::File = file;
                let _ = writeln!(file, "{line}");
                let _ = file.flush();
            }
        }
    }

    /// A stdio handle a child process can write to directly.
    pub fn stdio(&self) -> io::Result<Stdio> {
        Ok(match self {
            LogSink::Stdout => Stdio::inherit(),
            LogSink::File { file, .. } => Stdio::from(file.try_clone()?),
        })
    }

}
