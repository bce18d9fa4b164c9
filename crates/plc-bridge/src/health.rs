//! Automation host health monitoring.
//!
//! Every interval the monitor checks that the host process is alive and, if
//! the dispatcher is idle, pushes a probe command through the queue. It never
//! calls the facade directly. A probe still unanswered at the next round, or
//! a command running past its own timeout, counts as another failure. After
//! `failure_threshold` consecutive failures the session is forced into
//! `crashed`; recovery is an explicit `connect`.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use smol_str::SmolStr;
use tracing::{debug, error, warn};

use crate::command::CommandResult;
use crate::dispatcher::{DispatcherHandle, Ticket};
use crate::error::{BridgeError, CommandError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub interval: Duration,
    pub failure_threshold: u32,
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            failure_threshold: 2,
            probe_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// No live handle to watch.
    Skipped,
    Healthy,
    Failed { consecutive: u32, reason: SmolStr },
    Crashed { failed_commands: usize },
}

pub struct HealthMonitor {
    dispatcher: DispatcherHandle,
    config: HealthConfig,
    consecutive: u32,
    /// Probe submitted in an earlier round that has not answered yet.
    outstanding: Option<Ticket>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(dispatcher: DispatcherHandle, config: HealthConfig) -> Self {
        Self {
            dispatcher,
            config,
            consecutive: 0,
            outstanding: None,
        }
    }

    /// Run one probe round.
    pub fn check(&mut self) -> ProbeOutcome {
        if !self.dispatcher.session().state().has_handle() {
            self.consecutive = 0;
            self.outstanding = None;
            return ProbeOutcome::Skipped;
        }
        let reason = match self.probe() {
            Ok(()) => {
                if self.consecutive > 0 {
                    debug!(after = self.consecutive, "automation host probe recovered");
                }
                self.consecutive = 0;
                return ProbeOutcome::Healthy;
            }
            Err(None) => {
                self.consecutive = 0;
                return ProbeOutcome::Skipped;
            }
            Err(Some(reason)) => reason,
        };
        self.consecutive += 1;
        warn!(
            consecutive = self.consecutive,
            threshold = self.config.failure_threshold,
            "automation host probe failed: {reason}"
        );
        if self.consecutive < self.config.failure_threshold {
            return ProbeOutcome::Failed {
                consecutive: self.consecutive,
                reason,
            };
        }
        let consecutive = self.consecutive;
        self.consecutive = 0;
        self.outstanding = None;
        match self.dispatcher.crash(&reason) {
            Some(failed_commands) => {
                error!(failed_commands, "automation host declared crashed: {reason}");
                ProbeOutcome::Crashed { failed_commands }
            }
            None => ProbeOutcome::Failed {
                consecutive,
                reason,
            },
        }
    }

    /// `Err(None)` means the round was not applicable (session left the
    /// monitored states, the bridge is stopping, or the probe has not been
    /// picked up yet).
    fn probe(&mut self) -> Result<(), Option<SmolStr>> {
        if !self.dispatcher.host().is_alive() {
            return Err(Some("automation host process is not alive".into()));
        }
        if let Some(ticket) = self.outstanding.take() {
            return self.await_probe(ticket);
        }
        if let Some((kind, running)) = self.dispatcher.overdue() {
            return Err(Some(
                format!("{kind} still running after {} ms", running.as_millis()).into(),
            ));
        }
        match self.dispatcher.submit_probe() {
            None => Ok(()),
            Some(Ok(ticket)) => self.await_probe(ticket),
            Some(Err(err)) => classify(Err(err)),
        }
    }

    fn await_probe(&mut self, ticket: Ticket) -> Result<(), Option<SmolStr>> {
        if let Some(result) = ticket.wait_for(self.config.probe_timeout) {
            return classify(result);
        }
        let running = ticket.is_running();
        let id = ticket.id();
        self.outstanding = Some(ticket);
        if !running {
            debug!(id, "probe not started yet");
            return Err(None);
        }
        Err(Some(
            format!(
                "probe {id} unanswered after {} ms",
                self.config.probe_timeout.as_millis()
            )
            .into(),
        ))
    }

    /// Run the monitor on its own thread.
    pub fn spawn(self) -> Result<HealthHandle, BridgeError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let mut monitor = self;
        let join = thread::Builder::new()
            .name("plc-bridge-health".into())
            .spawn(move || {
                while !stop_thread.load(Ordering::SeqCst) {
                    thread::park_timeout(monitor.config.interval);
                    if stop_thread.load(Ordering::SeqCst) || monitor.dispatcher.is_shutdown() {
                        break;
                    }
                    monitor.check();
                }
                debug!("health monitor stopped");
            })
            .map_err(|err| BridgeError::ThreadSpawn(err.to_string().into()))?;
        Ok(HealthHandle {
            stop,
            join: Some(join),
        })
    }
}

fn classify(result: CommandResult) -> Result<(), Option<SmolStr>> {
    match result {
        Ok(_) => Ok(()),
        Err(CommandError::InvalidState { .. } | CommandError::Shutdown) => Err(None),
        Err(err) => Err(Some(err.to_string().into())),
    }
}

/// Handle to a running health monitor thread.
pub struct HealthHandle {
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl HealthHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = &self.join {
            join.thread().unpark();
        }
    }

    pub fn join(&mut self) {
        self.stop();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("health monitor panicked");
            }
        }
    }
}

impl Drop for HealthHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
