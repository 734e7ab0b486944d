use std::{
    io::{self, Read, Write},
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    thread,
    time::Duration,
};

use log::{debug, info};

use crate::{
    kubectl::Kubectl,
    process,
    resolve::PodRef,
    session::{self, Session},
    Error, Result,
};

/// The proxy image runs sshd on the standard port and a SOCKS listener on
/// loopback.
pub const POD_SSH_PORT: u16 = 22;
pub const POD_SOCKS_PORT: u16 = 9050;

const PROBE_ATTEMPTS: u32 = 30;
const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Local endpoints of an established tunnel ensemble. The helper processes
/// themselves are supervised by the session; if any of them dies the set is
/// dead.
pub struct TunnelSet {
    pub control_port: u16,
    pub socks_port: u16,
}

/// Picks a currently free loopback port. The port is released before the
/// child binds it, so another process can grab it in between; an accepted
/// race for a developer tool.
pub fn free_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// ssh with the fixed session flags: quiet, no host key persistence or
/// validation (the endpoint is a loopback port-forward), 1 s keepalives so a
/// broken tunnel dies within ~3 s, never interactive.
fn ssh(control_port: u16, session: &Session) -> process::Command {
    process::command!(
        "ssh",
        "-q",
        "-oStrictHostKeyChecking=no",
        "-oUserKnownHostsFile=/dev/null",
        "-oServerAliveInterval=1",
        "-oServerAliveCountMax=3",
        "-oBatchMode=yes",
        "-p",
        control_port.to_string(),
    )
    .log_to(session.log())
}

/// Builds the full tunnel ensemble into the pod: a port-forward carrying the
/// ssh control channel, one reverse tunnel per exposed local port, and a
/// forward tunnel to the in-pod SOCKS listener. All children are registered
/// with the session supervisor; none are restarted on failure.
pub fn establish(
    session: &mut Session,
    kubectl: &Kubectl,
    pod: &PodRef,
    expose: &[u16],
) -> Result<TunnelSet> {
    let control_port = free_port()?;
    info!(
        "Forwarding local port {control_port} to pod {name} port {POD_SSH_PORT}",
        name = pod.pod_name,
    );
    let forward = kubectl.port_forward(
        Some(&pod.namespace),
        &pod.pod_name,
        control_port,
        POD_SSH_PORT,
    )?;
    session.supervise(forward);

    wait_for_listener(control_port)?;
    probe_ssh(control_port, session)?;

    for &port in expose {
        let child = process::args!(
            ssh(control_port, session),
            "-N",
            "-R",
            format!("*:{port}:127.0.0.1:{port}"),
            "root@localhost"
        )
        .spawn_supervised(&format!("reverse tunnel for port {port}"))?;
        session.supervise(child);
    }

    let socks_port = free_port()?;
    let child = process::args!(
        ssh(control_port, session),
        "-N",
        "-L",
        format!("127.0.0.1:{socks_port}:127.0.0.1:{POD_SOCKS_PORT}"),
        "root@localhost"
    )
    .spawn_supervised("socks tunnel")?;
    session.supervise(child);

    probe_socks(socks_port)?;
    info!("Tunnels established; SOCKS proxy on 127.0.0.1:{socks_port}");

    Ok(TunnelSet {
        control_port,
        socks_port,
    })
}

/// Waits until a TCP connect to the port-forward's local side succeeds.
fn wait_for_listener(port: u16) -> Result<()> {
    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    for _ in 0..PROBE_ATTEMPTS {
        if session::interrupted() {
            return Err(Error::Interrupted);
        }
        if TcpStream::connect_timeout(&address, CONNECT_TIMEOUT).is_ok() {
            return Ok(());
        }
        thread::sleep(PROBE_INTERVAL);
    }
    Err(Error::TunnelNotReady)
}

/// Runs a no-op command over the control channel until sshd answers.
fn probe_ssh(control_port: u16, session: &Session) -> Result<()> {
    for attempt in 0..PROBE_ATTEMPTS {
        if session::interrupted() {
            return Err(Error::Interrupted);
        }
        let status = process::args!(ssh(control_port, session), "root@localhost", "/bin/true")
            .try_status()?;
        if status.success() {
            return Ok(());
        }
        debug!("ssh probe attempt {attempt} failed");
        thread::sleep(PROBE_INTERVAL);
    }
    Err(Error::TunnelNotReady)
}

/// Confirms the in-pod SOCKS listener answers through the forward tunnel. A
/// freshly authenticated sshd does not guarantee the proxy daemon is up yet,
/// so a plain TCP accept is not enough; require a SOCKS5 no-auth greeting.
fn probe_socks(socks_port: u16) -> Result<()> {
    for _ in 0..PROBE_ATTEMPTS {
        if session::interrupted() {
            return Err(Error::Interrupted);
        }
        if socks_greeting(socks_port).is_ok() {
            return Ok(());
        }
        thread::sleep(PROBE_INTERVAL);
    }
    Err(Error::TunnelNotReady)
}

fn socks_greeting(port: u16) -> io::Result<()> {
    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut stream = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(PROBE_INTERVAL))?;

    // Version 5, one method offered: no authentication.
    stream.write_all(&[0x05, 0x01, 0x00])?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply)?;
    if reply == [0x05, 0x00] {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unexpected SOCKS greeting reply",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_port_is_bindable() {
        let port = free_port().unwrap();
        assert_ne!(port, 0);
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    }

    #[test]
    fn socks_greeting_accepts_no_auth_reply() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, 0x00]).unwrap();
        });

        socks_greeting(port).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn socks_greeting_rejects_other_protocols() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).unwrap();
            stream.write_all(b"HT").unwrap();
        });

        assert!(socks_greeting(port).is_err());
        server.join().unwrap();
    }
}
