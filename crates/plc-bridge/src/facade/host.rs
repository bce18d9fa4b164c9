//! Automation host liveness tracking.

use std::net::{Shutdown, TcpStream};
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default)]
enum HostTarget {
    #[default]
    None,
    Child(Child),
    /// Clone of the link socket to an attached host. Liveness is read off this
    /// socket; no extra connections are opened to the host.
    Remote(TcpStream),
    Simulated(Arc<AtomicBool>),
}

/// Shared view of the automation host process.
///
/// The facade binds the process it launched or the link it attached over;
/// the health monitor checks liveness without going through the facade. The
/// last observed result is cached for status queries, which never block.
#[derive(Debug, Clone, Default)]
pub struct HostWatch {
    target: Arc<Mutex<HostTarget>>,
    last_alive: Arc<AtomicBool>,
}

impl HostWatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_child(&self, child: Child) {
        self.replace(HostTarget::Child(child));
        self.last_alive.store(true, Ordering::SeqCst);
    }

    pub fn bind_remote(&self, link: TcpStream) {
        self.replace(HostTarget::Remote(link));
        self.last_alive.store(true, Ordering::SeqCst);
    }

    pub fn bind_simulated(&self, alive: Arc<AtomicBool>) {
        let now = alive.load(Ordering::SeqCst);
        self.replace(HostTarget::Simulated(alive));
        self.last_alive.store(now, Ordering::SeqCst);
    }

    /// Forget the current host, terminating a launched process that is still running.
    pub fn clear(&self) {
        self.replace(HostTarget::None);
        self.last_alive.store(false, Ordering::SeqCst);
    }

    /// Cut the bridge off from the current host.
    ///
    /// An attached link is shut down and a launched helper is killed, so a
    /// facade call blocked on the old handle returns with an error instead of
    /// holding the worker. Returns `true` if there was a host to sever.
    pub fn sever(&self) -> bool {
        let previous = std::mem::take(&mut *self.target.lock());
        self.last_alive.store(false, Ordering::SeqCst);
        match previous {
            HostTarget::None => false,
            HostTarget::Remote(link) => {
                if let Err(err) = link.shutdown(Shutdown::Both) {
                    debug!("automation host link already closed: {err}");
                }
                true
            }
            HostTarget::Child(mut child) => {
                if matches!(child.try_wait(), Ok(None)) {
                    warn!("terminating unresponsive automation host process");
                    let _ = child.kill();
                }
                let _ = child.wait();
                true
            }
            HostTarget::Simulated(_) => true,
        }
    }

    /// Check liveness now and cache the result.
    pub fn is_alive(&self) -> bool {
        let alive = {
            let mut target = self.target.lock();
            match &mut *target {
                HostTarget::None => false,
                HostTarget::Child(child) => matches!(child.try_wait(), Ok(None)),
                HostTarget::Remote(link) => {
                    matches!(link.take_error(), Ok(None)) && link.peer_addr().is_ok()
                }
                HostTarget::Simulated(flag) => flag.load(Ordering::SeqCst),
            }
        };
        self.last_alive.store(alive, Ordering::SeqCst);
        alive
    }

    /// Most recently observed liveness.
    #[must_use]
    pub fn last_known_alive(&self) -> bool {
        self.last_alive.load(Ordering::SeqCst)
    }

    /// Hard-kill a launched host. Attached remote hosts cannot be killed.
    pub fn kill(&self) -> bool {
        let mut target = self.target.lock();
        let killed = match &mut *target {
            HostTarget::Child(child) => match child.kill() {
                Ok(()) => {
                    let _ = child.wait();
                    true
                }
                Err(err) => {
                    warn!("failed to kill automation host: {err}");
                    false
                }
            },
            HostTarget::Simulated(flag) => {
                flag.store(false, Ordering::SeqCst);
                true
            }
            HostTarget::None | HostTarget::Remote(_) => false,
        };
        if killed {
            self.last_alive.store(false, Ordering::SeqCst);
        }
        killed
    }

    fn replace(&self, next: HostTarget) {
        let previous = std::mem::replace(&mut *self.target.lock(), next);
        if let HostTarget::Child(mut child) = previous {
            if matches!(child.try_wait(), Ok(None)) {
                debug!("terminating previous automation host process");
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}
