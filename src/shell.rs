use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
};

use log::{debug, info};

use crate::{process, session::Session, temp_path, Result};

const PROMPT_MARKER: &str = "[telepresence]";

/// Prefixes whose binaries macOS System Integrity Protection shields from
/// DYLD-based interposition, which torsocks depends on.
const PROTECTED_PREFIXES: [&str; 4] = ["/bin", "/sbin", "/usr/bin", "/usr/sbin"];

/// Starts the user's shell wrapped in torsocks so that every connection it
/// makes is routed into the cluster, with the projected pod environment and a
/// prompt that advertises the session. The child owns the terminal.
pub fn launch(
    session: &mut Session,
    projected: BTreeMap<String, String>,
    socks_port: u16,
    context: &str,
) -> Result<process::ChildProcess> {
    let conf_path = write_torsocks_conf(socks_port)?;
    {
        let conf_path = conf_path.clone();
        session.defer("remove torsocks configuration", move || {
            let _ = fs::remove_file(&conf_path);
        });
    }

    let shell = env::var("SHELL").unwrap_or_else(|_| String::from("/bin/sh"));

    let mut command = process::command!("torsocks", &shell).log_to(session.log());
    for (name, value) in &projected {
        command = command.env(name, value);
    }
    command = command
        .env("PS1", prompt())
        .env("PROMPT_COMMAND", prompt_command(context))
        .env("TORSOCKS_CONF_FILE", &conf_path);
    if let Some(path) = session.log().path() {
        command = command.env("TORSOCKS_LOG_FILE_PATH", path);
    }
    if let Some(shim) = shadow_protected_binaries(session)? {
        command = command.env("PATH", prepend_search_path(&shim));
    }

    info!("Starting {shell} inside the pod's network; exit it to end the session");
    let child = command.spawn_terminal("local shell")?;
    Ok(child)
}

fn prompt() -> String {
    let current = env::var("PS1").unwrap_or_else(|_| String::from("\\$ "));
    format!("{PROMPT_MARKER} {current}")
}

/// Prepends the cluster context to the prompt once the shell has sourced its
/// rc files, then removes itself.
fn prompt_command(context: &str) -> String {
    format!("PS1=\"@{context}|$PS1\";unset PROMPT_COMMAND")
}

fn write_torsocks_conf(socks_port: u16) -> Result<PathBuf> {
    let path = temp_path::in_temp_dir("telepresence-torsocks-", ".conf");
    fs::write(&path, torsocks_conf(socks_port))?;
    Ok(path)
}

/// The wrapper must accept inbound listeners (the reverse tunnels dial back
/// in) and loopback connections (the SOCKS endpoint itself is local).
fn torsocks_conf(socks_port: u16) -> String {
    format!("AllowInbound 1\nAllowOutboundLocalhost 1\nTorPort {socks_port}\n")
}

/// On macOS, copies the protected system binaries into a scratch directory so
/// the wrapper can inject into them, and returns that directory. Elsewhere
/// this is a no-op and no directory is created.
fn shadow_protected_binaries(session: &mut Session) -> Result<Option<PathBuf>> {
    if !cfg!(target_os = "macos") {
        return Ok(None);
    }

    let dir = temp_path::in_temp_dir("telepresence-bin-", "");
    fs::create_dir_all(&dir)?;
    {
        let dir = dir.clone();
        session.defer("remove shadow bin directory", move || {
            let _ = fs::remove_dir_all(&dir);
        });
    }

    for prefix in PROTECTED_PREFIXES {
        copy_binaries(Path::new(prefix), &dir);
    }

    Ok(Some(dir))
}

/// Best-effort copy; unreadable entries are skipped.
fn copy_binaries(from: &Path, to: &Path) {
    let Ok(entries) = fs::read_dir(from) else {
        return;
    };
    for entry in entries.flatten() {
        let source = entry.path();
        if !source.is_file() {
            continue;
        }
        let Some(name) = source.file_name() else {
            continue;
        };
        let target = to.join(name);
        if fs::copy(&source, &target).is_err() {
            debug!("skipping unreadable binary {source:?}");
            continue;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&target, fs::Permissions::from_mode(0o755));
        }
    }
}

fn prepend_search_path(dir: &Path) -> String {
    match env::var("PATH") {
        Ok(path) => format!("{}:{path}", dir.display()),
        Err(_) => dir.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn torsocks_conf_contains_only_recognized_options() {
        let conf = torsocks_conf(12345);
        assert_eq!(
            conf,
            "AllowInbound 1\nAllowOutboundLocalhost 1\nTorPort 12345\n"
        );
    }

    #[test]
    fn prompt_carries_the_session_marker() {
        assert!(prompt().starts_with(PROMPT_MARKER));
    }

    #[test]
    fn prompt_command_prepends_context_once() {
        let command = prompt_command("minikube");
        assert!(command.starts_with("PS1=\"@minikube|"));
        assert!(command.ends_with("unset PROMPT_COMMAND"));
    }

    #[test]
    fn copy_binaries_skips_missing_directories() {
        let target = temp_path::in_temp_dir("telepresence-test-", "");
        fs::create_dir_all(&target).unwrap();
        copy_binaries(Path::new("/no/such/prefix"), &target);
        assert_eq!(fs::read_dir(&target).unwrap().count(), 0);
        fs::remove_dir_all(&target).unwrap();
    }
}
