//! Host reachability probes used by the liveness watchdog.

use {
    crossbeam_channel::{Receiver, RecvTimeoutError},
    log::{debug, trace},
    std::{
        fmt,
        net::{TcpStream, ToSocketAddrs},
        process::{Command, Stdio},
        time::Duration,
    },
};

/// Answers "is this host alive right now" with a single attempt.
pub trait ReachabilityProbe: Send + Sync + fmt::Debug {
    fn probe(&self, host: &str) -> bool;
}

/// Runs the system `ping` once and looks for one echoed packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandProbe;

impl ReachabilityProbe for CommandProbe {
    fn probe(&self, host: &str) -> bool {
        let output = match Command::new("ping")
            .args(["-c", "1", host])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                debug!("ping {host} could not run: {e}");
                return false;
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        // Linux prints "1 received", BSD and macOS "1 packets received"
        stdout.contains(" 1 received,") || stdout.contains(" 1 packets received,")
    }
}

/// Treats a host as alive when a TCP connection to `port` succeeds.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    pub port: u16,
    pub timeout: Duration,
}

impl ReachabilityProbe for TcpProbe {
    fn probe(&self, host: &str) -> bool {
        let addrs = match (host, self.port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!("cannot resolve {host}: {e}");
                return false;
            }
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, self.timeout).is_ok())
    }
}

/// A probe whose verdict is set by hand.  Clones share the verdict.
#[cfg(any(test, feature = "dev-context-only-utils"))]
#[derive(Debug, Clone)]
pub struct ManualProbe {
    alive: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(any(test, feature = "dev-context-only-utils"))]
impl ManualProbe {
    pub fn new(alive: bool) -> Self {
        Self {
            alive: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(alive)),
        }
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(any(test, feature = "dev-context-only-utils"))]
impl ReachabilityProbe for ManualProbe {
    fn probe(&self, _host: &str) -> bool {
        self.alive.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Probe `host` up to `attempts` times, pausing between failures.  A message
/// on `wake`, or its senders going away, abandons the probe and reports the
/// host as alive so the caller can act on the wake reason instead of a
/// partial verdict.
pub fn probe_with_retries(
    probe: &dyn ReachabilityProbe,
    host: &str,
    attempts: u32,
    pause: Duration,
    wake: &Receiver<()>,
) -> bool {
    for attempt in 1..=attempts.max(1) {
        if probe.probe(host) {
            return true;
        }
        trace!("probe {attempt}/{attempts} of {host} failed");
        if attempt < attempts {
            match wake.recv_timeout(pause) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return true,
            }
        }
    }
    false
}
