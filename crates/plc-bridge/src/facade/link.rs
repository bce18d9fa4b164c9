//! Facade backed by an automation host helper speaking line-delimited JSON.
//!
//! The helper runs next to the engineering tool and owns the vendor
//! automation library. The bridge either attaches to a helper already
//! listening at the discovery address (TCP) or launches one and talks to it
//! over stdio. Each request is one JSON line `{"id", "op", ...}`; each reply
//! is one JSON line `{"id", "ok", "result" | "error": {"kind", "message"}}`.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use smol_str::SmolStr;
use tracing::{debug, info, warn};

use super::{AutomationFacade, BlockInfo, CompileReport, HostWatch, LaunchMode, ProjectInfo};
use crate::fault::{AutomationFault, FaultCategory};

const ATTACH_TIMEOUT: Duration = Duration::from_secs(2);
/// Reply deadline for `disconnect` on an attached link.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct HostLinkConfig {
    /// Discovery address of an already running automation host (`host:port`).
    pub address: Option<SmolStr>,
    /// Helper executable launched when nothing is attachable.
    pub command: Option<PathBuf>,
    pub args: Vec<String>,
}

struct Link {
    reader: Box<dyn BufRead + Send>,
    writer: Box<dyn Write + Send>,
    /// Set for TCP links; stdio links cannot carry a read timeout.
    socket: Option<TcpStream>,
}

pub struct HostLinkFacade {
    config: HostLinkConfig,
    host: HostWatch,
    link: Option<Link>,
    next_id: u64,
}

#[derive(Debug, Deserialize)]
struct HostReply {
    id: Option<u64>,
    ok: bool,
    #[serde(default)]
    result: Value,
    error: Option<HostErrorBody>,
}

#[derive(Debug, Deserialize)]
struct HostErrorBody {
    kind: Option<String>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BlockListReply {
    Wrapped { blocks: Vec<BlockInfo> },
    Bare(Vec<BlockInfo>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SourceReply {
    Wrapped { source: String },
    Bare(String),
}

impl HostLinkFacade {
    #[must_use]
    pub fn new(config: HostLinkConfig, host: HostWatch) -> Self {
        Self {
            config,
            host,
            link: None,
            next_id: 0,
        }
    }

    fn resolve_address(&self) -> Result<Option<SocketAddr>, AutomationFault> {
        let Some(address) = self.config.address.as_deref() else {
            return Ok(None);
        };
        let mut addrs = address.to_socket_addrs().map_err(|err| {
            AutomationFault::new(
                FaultCategory::ProcessUnreachable,
                format!("resolve automation host '{address}': {err}"),
            )
        })?;
        Ok(addrs.next())
    }

    fn call(&mut self, op: &str, params: Value) -> Result<Value, AutomationFault> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| AutomationFault::unreachable("no automation host linked"))?;
        self.next_id += 1;
        let id = self.next_id;
        let mut request = json!({ "id": id, "op": op });
        if let (Some(target), Value::Object(extra)) = (request.as_object_mut(), params) {
            target.extend(extra);
        }
        let line = request.to_string();
        writeln!(link.writer, "{line}")
            .and_then(|()| link.writer.flush())
            .map_err(|err| AutomationFault::from_io_error(&err, &format!("send {op}")))?;

        loop {
            let mut response = String::new();
            let read = link
                .reader
                .read_line(&mut response)
                .map_err(|err| AutomationFault::from_io_error(&err, &format!("read {op}")))?;
            if read == 0 {
                return Err(AutomationFault::unreachable(format!(
                    "automation host closed the link during {op}"
                )));
            }
            let trimmed = response.trim();
            if trimmed.is_empty() {
                continue;
            }
            let reply: HostReply = serde_json::from_str(trimmed).map_err(|err| {
                AutomationFault::new(
                    FaultCategory::Unknown,
                    format!("malformed reply to {op}: {err}"),
                )
            })?;
            if reply.id.is_some_and(|reply_id| reply_id != id) {
                debug!(op, expected = id, got = ?reply.id, "skipping stale host reply");
                continue;
            }
            if reply.ok {
                return Ok(reply.result);
            }
            return Err(match reply.error {
                Some(error) => AutomationFault::from_host_error(error.kind.as_deref(), &error.message),
                None => AutomationFault::new(
                    FaultCategory::Unknown,
                    format!("automation host rejected {op} without detail"),
                ),
            });
        }
    }

    fn call_as<T: DeserializeOwned>(&mut self, op: &str, params: Value) -> Result<T, AutomationFault> {
        let value = self.call(op, params)?;
        serde_json::from_value(value).map_err(|err| {
            AutomationFault::new(
                FaultCategory::Unknown,
                format!("unexpected reply to {op}: {err}"),
            )
        })
    }
}

impl AutomationFacade for HostLinkFacade {
    fn launch(&mut self, mode: LaunchMode) -> Result<(), AutomationFault> {
        let command = self.config.command.clone().ok_or_else(|| {
            AutomationFault::new(
                FaultCategory::DependencyMissing,
                "no automation host command configured",
            )
        })?;
        let mut process = Command::new(&command);
        process
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if mode == LaunchMode::Headless {
            process.arg("--headless");
        }
        let mut child = process.spawn().map_err(|err| {
            AutomationFault::from_io_error(&err, &format!("launch {}", command.display()))
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(AutomationFault::unreachable(
                "automation host stdio unavailable",
            ));
        };
        info!(command = %command.display(), mode = mode.as_str(), "launched automation host");
        self.host.bind_child(child);
        self.link = Some(Link {
            reader: Box::new(BufReader::new(stdout)),
            writer: Box::new(stdin),
            socket: None,
        });
        let result = self.call("launch", json!({ "mode": mode.as_str() }));
        if result.is_err() {
            self.link = None;
            self.host.clear();
        }
        result.map(|_| ())
    }

    fn attach(&mut self) -> Result<bool, AutomationFault> {
        let Some(addr) = self.resolve_address()? else {
            return Ok(false);
        };
        let stream = match TcpStream::connect_timeout(&addr, ATTACH_TIMEOUT) {
            Ok(stream) => stream,
            Err(err) => {
                debug!(%addr, "no automation host to attach: {err}");
                return Ok(false);
            }
        };
        let clone = || {
            stream
                .try_clone()
                .map_err(|err| AutomationFault::from_io_error(&err, "clone host stream"))
        };
        let (reader, socket, watched) = (clone()?, clone()?, clone()?);
        self.host.bind_remote(watched);
        self.link = Some(Link {
            reader: Box::new(BufReader::new(reader)),
            writer: Box::new(stream),
            socket: Some(socket),
        });
        match self.call("attach", json!({})) {
            Ok(_) => {
                info!(%addr, "attached to running automation host");
                Ok(true)
            }
            Err(err) => {
                self.link = None;
                self.host.clear();
                Err(err)
            }
        }
    }

    fn open_project(&mut self, path: &Path) -> Result<(), AutomationFault> {
        self.call(
            "open_project",
            json!({ "path": path.to_string_lossy() }),
        )
        .map(|_| ())
    }

    fn close_project(&mut self) -> Result<(), AutomationFault> {
        self.call("close_project", json!({})).map(|_| ())
    }

    fn list_blocks(&mut self) -> Result<Vec<BlockInfo>, AutomationFault> {
        let reply: BlockListReply = self.call_as("list_blocks", json!({}))?;
        Ok(match reply {
            BlockListReply::Wrapped { blocks } | BlockListReply::Bare(blocks) => blocks,
        })
    }

    fn import_source(&mut self, block: &str, source: &str) -> Result<(), AutomationFault> {
        self.call(
            "import_source",
            json!({ "block": block, "source": source }),
        )
        .map(|_| ())
    }

    fn export_source(&mut self, block: &str) -> Result<String, AutomationFault> {
        let reply: SourceReply = self.call_as("export_source", json!({ "block": block }))?;
        Ok(match reply {
            SourceReply::Wrapped { source } | SourceReply::Bare(source) => source,
        })
    }

    fn compile(&mut self, block: &str) -> Result<CompileReport, AutomationFault> {
        self.call_as("compile", json!({ "block": block }))
    }

    fn project_info(&mut self) -> Result<ProjectInfo, AutomationFault> {
        self.call_as("project_info", json!({}))
    }

    fn disconnect(&mut self) -> Result<(), AutomationFault> {
        let result = match self.link.as_ref() {
            Some(link) => {
                if let Some(socket) = &link.socket {
                    if let Err(err) = socket.set_read_timeout(Some(DISCONNECT_TIMEOUT)) {
                        debug!("cannot bound disconnect reply: {err}");
                    }
                }
                self.call("disconnect", json!({})).map(|_| ())
            }
            None => Ok(()),
        };
        if let Err(err) = &result {
            warn!("automation host disconnect failed: {err}");
        }
        self.link = None;
        self.host.clear();
        result
    }

    fn release(&mut self) {
        if self.link.take().is_some() {
            debug!("dropped automation host link without notifying the host");
        }
        self.host.clear();
    }

    fn probe(&mut self) -> Result<(), AutomationFault> {
        self.call("ping", json!({})).map(|_| ())
    }
}
