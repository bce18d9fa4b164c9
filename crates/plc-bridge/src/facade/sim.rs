//! In-memory engineering tool used for `--simulate` and tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smol_str::SmolStr;

use super::{
    AutomationFacade, BlockInfo, CompileReport, DeviceInfo, Diagnostic, HostWatch, LaunchMode,
    ProjectInfo, Severity,
};
use crate::command::CommandKind;
use crate::fault::{AutomationFault, FaultCategory};

/// One facade call observed by the simulator.
#[derive(Debug, Clone)]
pub struct SimCall {
    pub kind: CommandKind,
    pub started: Instant,
    pub finished: Option<Instant>,
}

#[derive(Debug, Clone)]
struct SimBlock {
    number: u32,
    kind: SmolStr,
    language: SmolStr,
    source: String,
}

#[derive(Debug, Default)]
struct SimState {
    running: bool,
    projects: BTreeMap<PathBuf, BTreeMap<SmolStr, SimBlock>>,
    open: Option<PathBuf>,
    delays: HashMap<CommandKind, Duration>,
    failures: HashMap<CommandKind, VecDeque<AutomationFault>>,
    in_call: bool,
    overlaps: u32,
    calls: Vec<SimCall>,
}

/// Shared control surface of a simulated engineering tool.
///
/// Clones observe and steer the same instance, so a test can keep one while
/// the dispatcher owns the facade.
#[derive(Debug, Clone)]
pub struct SimulatedHost {
    state: Arc<Mutex<SimState>>,
    alive: Arc<AtomicBool>,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHost {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pretend an instance is already running so `attach` succeeds.
    #[must_use]
    pub fn running(self) -> Self {
        self.state.lock().running = true;
        self.alive.store(true, Ordering::SeqCst);
        self
    }

    /// Seed a project with `(name, source)` blocks.
    #[must_use]
    pub fn with_project(self, path: impl Into<PathBuf>, blocks: &[(&str, &str)]) -> Self {
        {
            let mut state = self.state.lock();
            let project = state.projects.entry(path.into()).or_default();
            for (name, source) in blocks {
                insert_block(project, name, source);
            }
        }
        self
    }

    /// Make every call of `kind` take `delay`.
    pub fn set_delay(&self, kind: CommandKind, delay: Duration) {
        self.state.lock().delays.insert(kind, delay);
    }

    /// Fail the next call of `kind` with `fault`.
    pub fn inject_fault(&self, kind: CommandKind, fault: AutomationFault) {
        self.state
            .lock()
            .failures
            .entry(kind)
            .or_default()
            .push_back(fault);
    }

    /// Simulate the engineering tool dying.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.running = false;
        state.open = None;
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    #[must_use]
    pub fn call_kinds(&self) -> Vec<CommandKind> {
        self.state.lock().calls.iter().map(|call| call.kind).collect()
    }

    /// Number of calls that started while another call was still running.
    #[must_use]
    pub fn overlaps(&self) -> u32 {
        self.state.lock().overlaps
    }

    #[must_use]
    pub fn block_source(&self, project: &Path, block: &str) -> Option<String> {
        self.state
            .lock()
            .projects
            .get(project)
            .and_then(|blocks| blocks.get(block))
            .map(|block| block.source.clone())
    }

    fn enter(&self, kind: CommandKind) -> Result<CallGuard<'_>, AutomationFault> {
        let (delay, injected, index) = {
            let mut state = self.state.lock();
            if state.in_call {
                state.overlaps += 1;
            }
            state.in_call = true;
            state.calls.push(SimCall {
                kind,
                started: Instant::now(),
                finished: None,
            });
            let index = state.calls.len() - 1;
            let delay = state.delays.get(&kind).copied();
            let injected = state.failures.get_mut(&kind).and_then(VecDeque::pop_front);
            (delay, injected, index)
        };
        let guard = CallGuard { host: self, index };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let needs_host = !matches!(kind, CommandKind::Connect);
        if needs_host && !self.is_alive() {
            return Err(AutomationFault::unreachable(
                "engineering tool process is not running",
            ));
        }
        if let Some(fault) = injected {
            return Err(fault);
        }
        Ok(guard)
    }
}

struct CallGuard<'a> {
    host: &'a SimulatedHost,
    index: usize,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.host.state.lock();
        state.in_call = false;
        if let Some(call) = state.calls.get_mut(self.index) {
            call.finished = Some(Instant::now());
        }
    }
}

/// Facade over a [`SimulatedHost`].
#[derive(Debug, Clone)]
pub struct SimulatedFacade {
    host: SimulatedHost,
    watch: HostWatch,
    attached: bool,
}

impl SimulatedFacade {
    #[must_use]
    pub fn new(host: SimulatedHost, watch: HostWatch) -> Self {
        Self {
            host,
            watch,
            attached: false,
        }
    }

    fn require_attached(&self) -> Result<(), AutomationFault> {
        if self.attached {
            Ok(())
        } else {
            Err(AutomationFault::unreachable("no engineering tool handle"))
        }
    }

    fn with_open_project<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<SmolStr, SimBlock>) -> Result<T, AutomationFault>,
    ) -> Result<T, AutomationFault> {
        self.require_attached()?;
        let mut state = self.host.state.lock();
        let Some(open) = state.open.clone() else {
            return Err(AutomationFault::new(
                FaultCategory::InvalidState,
                "No project open",
            ));
        };
        let blocks = state.projects.entry(open).or_default();
        f(blocks)
    }
}

impl AutomationFacade for SimulatedFacade {
    fn launch(&mut self, _mode: LaunchMode) -> Result<(), AutomationFault> {
        let _guard = self.host.enter(CommandKind::Connect)?;
        self.host.alive.store(true, Ordering::SeqCst);
        self.host.state.lock().running = true;
        self.watch.bind_simulated(self.host.alive.clone());
        self.attached = true;
        Ok(())
    }

    fn attach(&mut self) -> Result<bool, AutomationFault> {
        let _guard = self.host.enter(CommandKind::Connect)?;
        let running = self.host.state.lock().running && self.host.is_alive();
        if running {
            self.watch.bind_simulated(self.host.alive.clone());
            self.attached = true;
        }
        Ok(running)
    }

    fn open_project(&mut self, path: &Path) -> Result<(), AutomationFault> {
        let _guard = self.host.enter(CommandKind::OpenProject)?;
        self.require_attached()?;
        let mut state = self.host.state.lock();
        state.projects.entry(path.to_path_buf()).or_default();
        state.open = Some(path.to_path_buf());
        Ok(())
    }

    fn close_project(&mut self) -> Result<(), AutomationFault> {
        let _guard = self.host.enter(CommandKind::CloseProject)?;
        self.require_attached()?;
        self.host.state.lock().open = None;
        Ok(())
    }

    fn list_blocks(&mut self) -> Result<Vec<BlockInfo>, AutomationFault> {
        let _guard = self.host.enter(CommandKind::ListBlocks)?;
        self.with_open_project(|blocks| {
            Ok(blocks
                .iter()
                .map(|(name, block)| BlockInfo {
                    name: name.clone(),
                    number: Some(block.number),
                    kind: block.kind.clone(),
                    group_path: SmolStr::new(""),
                    language: block.language.clone(),
                })
                .collect())
        })
    }

    fn import_source(&mut self, block: &str, source: &str) -> Result<(), AutomationFault> {
        let _guard = self.host.enter(CommandKind::ImportSource)?;
        self.with_open_project(|blocks| {
            insert_block(blocks, block, source);
            Ok(())
        })
    }

    fn export_source(&mut self, block: &str) -> Result<String, AutomationFault> {
        let _guard = self.host.enter(CommandKind::ExportSource)?;
        self.with_open_project(|blocks| {
            blocks
                .get(block)
                .map(|found| found.source.clone())
                .ok_or_else(|| AutomationFault::rejected(format!("Block '{block}' not found")))
        })
    }

    fn compile(&mut self, block: &str) -> Result<CompileReport, AutomationFault> {
        let _guard = self.host.enter(CommandKind::Compile)?;
        self.with_open_project(|blocks| {
            let found = blocks
                .get(block)
                .ok_or_else(|| AutomationFault::rejected(format!("Block '{block}' not found")))?;
            Ok(CompileReport::from_diagnostics(check_source(
                block,
                &found.source,
            )))
        })
    }

    fn disconnect(&mut self) -> Result<(), AutomationFault> {
        let _guard = self.host.enter(CommandKind::Disconnect)?;
        self.attached = false;
        let mut state = self.host.state.lock();
        state.open = None;
        state.running = false;
        drop(state);
        self.host.alive.store(false, Ordering::SeqCst);
        self.watch.clear();
        Ok(())
    }

    fn project_info(&mut self) -> Result<ProjectInfo, AutomationFault> {
        let _guard = self.host.enter(CommandKind::ProjectInfo)?;
        self.require_attached()?;
        let state = self.host.state.lock();
        let Some(open) = state.open.as_ref() else {
            return Err(AutomationFault::new(
                FaultCategory::InvalidState,
                "No project open",
            ));
        };
        let name = open
            .file_stem()
            .map_or_else(|| open.display().to_string(), |stem| stem.to_string_lossy().into_owned());
        Ok(ProjectInfo {
            name: SmolStr::new(name),
            path: open.display().to_string(),
            devices: vec![DeviceInfo {
                name: SmolStr::new("PLC_1"),
                type_identifier: SmolStr::new("OrderNumber:6ES7 214-1AG40-0XB0/V4.5"),
            }],
            block_count: state.projects.get(open).map_or(0, BTreeMap::len),
        })
    }

    fn release(&mut self) {
        self.attached = false;
        self.watch.clear();
    }

    fn probe(&mut self) -> Result<(), AutomationFault> {
        let _guard = self.host.enter(CommandKind::Probe)?;
        self.require_attached()
    }
}

const BLOCK_HEADERS: [(&str, &str, &str); 4] = [
    ("FUNCTION_BLOCK", "END_FUNCTION_BLOCK", "FB"),
    ("ORGANIZATION_BLOCK", "END_ORGANIZATION_BLOCK", "OB"),
    ("DATA_BLOCK", "END_DATA_BLOCK", "DB"),
    ("FUNCTION", "END_FUNCTION", "FC"),
];

fn block_header(source: &str) -> Option<(&'static str, &'static str, &'static str)> {
    let first = source
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("//"))?;
    let keyword = first.split_whitespace().next()?.to_ascii_uppercase();
    BLOCK_HEADERS
        .iter()
        .copied()
        .find(|(header, _, _)| *header == keyword)
}

fn insert_block(blocks: &mut BTreeMap<SmolStr, SimBlock>, name: &str, source: &str) {
    let kind = block_header(source).map_or("FC", |(_, _, kind)| kind);
    let number = blocks.get(name).map_or_else(
        || blocks.values().map(|block| block.number).max().unwrap_or(0) + 1,
        |existing| existing.number,
    );
    blocks.insert(
        SmolStr::new(name),
        SimBlock {
            number,
            kind: SmolStr::new(kind),
            language: SmolStr::new("SCL"),
            source: source.to_string(),
        },
    );
}

fn check_source(block: &str, source: &str) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let mut push = |severity, message: String| {
        diagnostics.push(Diagnostic {
            severity,
            message,
            block: Some(SmolStr::new(block)),
        });
    };
    let upper = source.to_ascii_uppercase();
    match block_header(source) {
        None => push(Severity::Error, "missing block declaration".to_string()),
        Some((header, end, kind)) => {
            if !upper.contains(end) {
                push(Severity::Error, format!("{header} is not terminated by {end}"));
            }
            if kind != "DB" && !upper.contains("BEGIN") {
                push(Severity::Warning, "block has no BEGIN section".to_string());
            }
        }
    }
    let opened = source.matches('(').count();
    let closed = source.matches(')').count();
    if opened != closed {
        push(
            Severity::Error,
            format!("unbalanced parentheses ({opened} opened, {closed} closed)"),
        );
    }
    diagnostics
}
