//! Single-flight command dispatcher.
//!
//! One worker thread owns the automation facade and executes queued commands
//! strictly in submission order. Everything else (HTTP handlers, the health
//! monitor) talks to it through [`DispatcherHandle`].

#![allow(missing_docs)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::command::{CommandKind, CommandOutput, CommandRequest, CommandResult, ResultSlot};
use crate::config::{BridgeConfig, TimeoutPolicy, TimeoutTable};
use crate::error::{BridgeError, CommandError};
use crate::facade::{order_blocks, AutomationFacade, HostWatch, LaunchMode};
use crate::session::{Admission, SessionMachine, SessionState};
use crate::status::{BridgeStats, StatusSnapshot};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Ceiling on commands waiting behind the one in flight.
    pub max_pending: usize,
    pub timeouts: TimeoutTable,
    pub timeout_policy: TimeoutPolicy,
    pub launch_mode: LaunchMode,
    pub project_dir: Option<PathBuf>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_pending: 32,
            timeouts: TimeoutTable::default(),
            timeout_policy: TimeoutPolicy::default(),
            launch_mode: LaunchMode::default(),
            project_dir: None,
        }
    }
}

impl From<&BridgeConfig> for DispatcherConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            max_pending: config.max_pending,
            timeouts: config.timeouts.clone(),
            timeout_policy: config.host.timeout_policy,
            launch_mode: config.host.launch_mode,
            project_dir: config.host.project_dir.clone(),
        }
    }
}

struct Queued {
    slot: Arc<ResultSlot>,
    request: CommandRequest,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Queued>,
    current: Option<Arc<ResultSlot>>,
    current_started: Option<Instant>,
    shutdown: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.current.is_none()
    }
}

struct Shared {
    queue: Mutex<QueueState>,
    wake: Condvar,
    session: SessionMachine,
    host: HostWatch,
    stats: Mutex<BridgeStats>,
    config: DispatcherConfig,
    next_id: AtomicU64,
}

impl Shared {
    fn reject(&self, kind: CommandKind, err: CommandError) -> CommandError {
        if tracked(kind) {
            self.stats.lock().rejected += 1;
        }
        debug!(command = %kind, "rejected: {err}");
        err
    }

    /// Fail every queued command; returns how many were failed.
    fn drain_pending(queue: &mut QueueState, err: &CommandError) -> usize {
        let mut failed = 0;
        for queued in queue.pending.drain(..) {
            if queued.slot.complete(Err(err.clone())) {
                failed += 1;
            }
        }
        failed
    }

    fn signal_shutdown(&self) -> usize {
        let mut queue = self.queue.lock();
        if queue.shutdown {
            return 0;
        }
        queue.shutdown = true;
        let failed = Self::drain_pending(&mut queue, &CommandError::Shutdown);
        self.wake.notify_all();
        failed
    }
}

/// Probes are internal traffic and stay out of the command statistics.
fn tracked(kind: CommandKind) -> bool {
    kind != CommandKind::Probe
}

/// Owner of the worker thread.
pub struct Dispatcher {
    shared: Arc<Shared>,
    join: Option<thread::JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn the worker thread that owns `facade`.
    pub fn spawn(
        facade: Box<dyn AutomationFacade>,
        session: SessionMachine,
        host: HostWatch,
        config: DispatcherConfig,
    ) -> Result<Self, BridgeError> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState::default()),
            wake: Condvar::new(),
            session,
            host,
            stats: Mutex::new(BridgeStats::default()),
            config,
            next_id: AtomicU64::new(1),
        });
        let worker_shared = shared.clone();
        let join = thread::Builder::new()
            .name("plc-bridge-dispatcher".into())
            .spawn(move || run_worker(&worker_shared, facade))
            .map_err(|err| BridgeError::ThreadSpawn(err.to_string().into()))?;
        Ok(Self {
            shared,
            join: Some(join),
        })
    }

    /// Cloneable submission handle.
    #[must_use]
    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            shared: self.shared.clone(),
        }
    }

    /// Fail queued commands with `Shutdown` and join the worker once its
    /// current facade call returns.
    pub fn shutdown(&mut self) {
        let failed = self.shared.signal_shutdown();
        if failed > 0 {
            info!(failed, "dispatcher shutdown failed queued commands");
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("dispatcher worker panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.signal_shutdown();
    }
}

/// Cloneable handle used by request handlers and the health monitor.
#[derive(Clone)]
pub struct DispatcherHandle {
    shared: Arc<Shared>,
}

impl DispatcherHandle {
    /// Enqueue a command. Fails fast on backpressure, shutdown, a crashed
    /// session, or a command invalid for an idle session.
    pub fn submit(&self, request: CommandRequest) -> Result<Ticket, CommandError> {
        let queue = self.shared.queue.lock();
        self.admit(&queue, request.kind())?;
        Ok(self.push(queue, request))
    }

    /// Enqueue a liveness probe, but only onto an empty queue with nothing in
    /// flight. `None` means the worker is busy with other traffic.
    pub fn submit_probe(&self) -> Option<Result<Ticket, CommandError>> {
        let queue = self.shared.queue.lock();
        if queue.shutdown || !queue.is_idle() {
            return None;
        }
        if let Err(err) = self.admit(&queue, CommandKind::Probe) {
            return Some(Err(err));
        }
        Some(Ok(self.push(queue, CommandRequest::Probe)))
    }

    fn admit(&self, queue: &QueueState, kind: CommandKind) -> Result<(), CommandError> {
        let shared = &self.shared;
        if queue.shutdown {
            return Err(shared.reject(kind, CommandError::Shutdown));
        }
        let state = shared.session.state();
        if state == SessionState::Crashed && kind != CommandKind::Connect {
            return Err(shared.reject(
                kind,
                CommandError::Unreachable("automation host crashed; connect required".into()),
            ));
        }
        if queue.pending.len() >= shared.config.max_pending {
            return Err(shared.reject(
                kind,
                CommandError::TooManyPending {
                    limit: shared.config.max_pending,
                },
            ));
        }
        if queue.is_idle() {
            if let Err(err) = shared.session.check(kind) {
                return Err(shared.reject(kind, err));
            }
        }
        Ok(())
    }

    fn push(&self, mut queue: MutexGuard<'_, QueueState>, request: CommandRequest) -> Ticket {
        let shared = &self.shared;
        let kind = request.kind();
        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        let slot = Arc::new(ResultSlot::new(id, kind));
        queue.pending.push_back(Queued {
            slot: slot.clone(),
            request,
        });
        let depth = queue.pending.len();
        drop(queue);
        shared.wake.notify_all();
        if tracked(kind) {
            shared.stats.lock().submitted += 1;
            debug!(id, command = %kind, depth, "queued");
        }
        Ticket {
            slot,
            shared: shared.clone(),
        }
    }

    /// Submit and wait, bounded by `request_timeout` from submission.
    pub fn execute(&self, request: CommandRequest, request_timeout: Duration) -> CommandResult {
        self.submit(request)?.wait(request_timeout)
    }

    /// Queued commands plus the one in flight.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        let queue = self.shared.queue.lock();
        queue.pending.len() + usize::from(queue.current.is_some())
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue_depth() == 0
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shared.queue.lock().shutdown
    }

    #[must_use]
    pub fn session(&self) -> &SessionMachine {
        &self.shared.session
    }

    #[must_use]
    pub fn host(&self) -> &HostWatch {
        &self.shared.host
    }

    #[must_use]
    pub fn stats(&self) -> BridgeStats {
        self.shared.stats.lock().clone()
    }

    /// Snapshot from cached state. Never waits on the worker.
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        let view = self.shared.session.view();
        let (queue_depth, shutdown) = {
            let queue = self.shared.queue.lock();
            (
                queue.pending.len() + usize::from(queue.current.is_some()),
                queue.shutdown,
            )
        };
        StatusSnapshot {
            bridge: if shutdown { "offline" } else { "online" },
            session_state: view.state,
            active_project_path: view
                .active_project_path
                .map(|path| path.display().to_string()),
            host_process_alive: self.shared.host.last_known_alive(),
            queue_depth,
            handle_epoch: view.handle_epoch,
            last_error: view.last_error,
            stats: self.stats(),
        }
    }

    /// The in-flight command, if it has run past its operation timeout.
    #[must_use]
    pub fn overdue(&self) -> Option<(CommandKind, Duration)> {
        let queue = self.shared.queue.lock();
        let (current, started) = (queue.current.as_ref()?, queue.current_started?);
        let running = started.elapsed();
        (running > self.shared.config.timeouts.get(current.kind()))
            .then_some((current.kind(), running))
    }

    /// Declare the automation host crashed.
    ///
    /// Forces the session into `crashed`, completes every queued command and
    /// the one in flight with `ProcessUnreachable`, then severs the old host
    /// so a facade call blocked on it returns. Returns the number of commands
    /// failed, or `None` if there was no live handle to lose.
    pub fn crash(&self, reason: &str) -> Option<usize> {
        if !self.shared.session.force_crash(reason) {
            return None;
        }
        let err = CommandError::Unreachable(format!("automation host crashed: {reason}").into());
        let mut queue = self.shared.queue.lock();
        let mut failed = Shared::drain_pending(&mut queue, &err);
        if let Some(current) = &queue.current {
            if current.complete(Err(err.clone())) {
                failed += 1;
            }
        }
        drop(queue);
        if failed > 0 {
            warn!(failed, "failed pending commands after crash");
        }
        if self.shared.host.sever() {
            debug!("severed crashed automation host");
        }
        Some(failed)
    }
}

/// Pending result of a submitted command.
pub struct Ticket {
    slot: Arc<ResultSlot>,
    shared: Arc<Shared>,
}

impl Ticket {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.slot.id()
    }

    #[must_use]
    pub fn kind(&self) -> CommandKind {
        self.slot.kind()
    }

    /// Whether the worker has started executing this command.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.slot.is_running()
    }

    /// Wait up to `timeout` for the result without abandoning the command.
    pub fn wait_for(&self, timeout: Duration) -> Option<CommandResult> {
        self.slot.wait_for(timeout)
    }

    /// Wait for the result.
    ///
    /// While queued only `request_timeout` (from submission) applies; once
    /// running the command's own deadline applies as well.
    pub fn wait(self, request_timeout: Duration) -> CommandResult {
        let kind = self.slot.kind();
        let op_timeout = self.shared.config.timeouts.get(kind);
        let deadline = self.slot.submitted() + request_timeout;
        let result = self.slot.wait(deadline, op_timeout);
        if let Err(err @ CommandError::Timeout { .. }) = &result {
            self.on_timeout(err);
        }
        result
    }

    fn on_timeout(&self, err: &CommandError) {
        let kind = self.slot.kind();
        if !tracked(kind) {
            return;
        }
        warn!(id = self.slot.id(), command = %kind, "{err}");
        self.shared.stats.lock().timed_out += 1;
        self.shared.session.record_fault(err.to_fault());
        if self.shared.config.timeout_policy != TimeoutPolicy::Kill {
            return;
        }
        let in_flight = self
            .shared
            .queue
            .lock()
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &self.slot));
        if in_flight && self.shared.host.kill() {
            warn!(command = %kind, "killed automation host after timeout");
        }
    }
}

fn next_command(shared: &Shared) -> Option<Queued> {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            return None;
        }
        if let Some(next) = queue.pending.pop_front() {
            queue.current = Some(next.slot.clone());
            queue.current_started = Some(Instant::now());
            return Some(next);
        }
        shared.wake.wait(&mut queue);
    }
}

fn run_worker(shared: &Shared, mut facade: Box<dyn AutomationFacade>) {
    while let Some(Queued { slot, request }) = next_command(shared) {
        let kind = request.kind();
        if slot.mark_running() {
            run_command(shared, facade.as_mut(), &slot, request);
        } else {
            debug!(id = slot.id(), command = %kind, "skipping abandoned command");
        }
        let mut queue = shared.queue.lock();
        queue.current = None;
        queue.current_started = None;
    }
    debug!("dispatcher worker stopped");
}

fn run_command(
    shared: &Shared,
    facade: &mut dyn AutomationFacade,
    slot: &ResultSlot,
    request: CommandRequest,
) {
    let kind = request.kind();
    let started = Instant::now();
    let (result, accepted) = match shared.session.begin(kind) {
        Ok(admission) => {
            debug!(id = slot.id(), command = %kind, epoch = admission.epoch, "executing");
            let mut result = execute(facade, &shared.config, admission, request);
            if shared.session.finish(admission, &mut result) {
                (result, true)
            } else {
                let lost = CommandError::Unreachable(
                    format!("automation host crashed during {kind}").into(),
                );
                (Err(lost), false)
            }
        }
        Err(err) => (Err(err), true),
    };
    let elapsed = started.elapsed();
    let ok = result.is_ok();
    if let Err(err) = &result {
        debug!(id = slot.id(), command = %kind, "failed: {err}");
    }
    let delivered = slot.complete(result);
    if !tracked(kind) {
        return;
    }
    let mut stats = shared.stats.lock();
    if delivered {
        stats.record_execution(kind, elapsed, ok);
    } else {
        stats.discarded += 1;
        debug!(id = slot.id(), command = %kind, accepted, "result discarded");
    }
    drop(stats);
    info!(
        id = slot.id(),
        command = %kind,
        ok,
        elapsed_ms = elapsed.as_millis() as u64,
        "command finished"
    );
}

fn execute(
    facade: &mut dyn AutomationFacade,
    config: &DispatcherConfig,
    admission: Admission,
    request: CommandRequest,
) -> CommandResult {
    match request {
        CommandRequest::Connect { mode } => {
            if admission.from == SessionState::Crashed {
                facade.release();
            }
            let launched = if facade.attach()? {
                false
            } else {
                facade.launch(mode.unwrap_or(config.launch_mode))?;
                true
            };
            Ok(CommandOutput::Connected {
                state: SessionState::Attached,
                handle_epoch: admission.epoch,
                launched,
            })
        }
        CommandRequest::OpenProject { path } => {
            let path = resolve_project_path(config.project_dir.as_deref(), &path);
            facade.open_project(&path)?;
            Ok(CommandOutput::ProjectOpened { path })
        }
        CommandRequest::ListBlocks => {
            let mut blocks = facade.list_blocks()?;
            order_blocks(&mut blocks);
            Ok(CommandOutput::Blocks(blocks))
        }
        CommandRequest::ImportSource { block, source } => {
            facade.import_source(&block, &source)?;
            Ok(CommandOutput::Imported { block })
        }
        CommandRequest::ExportSource { block } => {
            let source = facade.export_source(&block)?;
            Ok(CommandOutput::Exported { block, source })
        }
        CommandRequest::Compile { block } => Ok(CommandOutput::Compiled(facade.compile(&block)?)),
        CommandRequest::ProjectInfo => Ok(CommandOutput::ProjectInfo(facade.project_info()?)),
        CommandRequest::CloseProject => {
            facade.close_project()?;
            Ok(CommandOutput::ProjectClosed)
        }
        CommandRequest::Disconnect => {
            if let Err(err) = facade.disconnect() {
                warn!("disconnect completed with fault: {err}");
            }
            Ok(CommandOutput::Disconnected)
        }
        CommandRequest::Probe => {
            facade.probe()?;
            Ok(CommandOutput::Probed)
        }
    }
}

fn resolve_project_path(project_dir: Option<&Path>, path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    match project_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path,
    }
}
