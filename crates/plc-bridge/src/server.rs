//! HTTP boundary.
//!
//! Each request is handled on its own thread so a caller blocked on a long
//! command never delays `/status`, which reads cached state only.

#![allow(missing_docs)]

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use smol_str::SmolStr;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, info, warn};

use crate::command::{CommandOutput, CommandRequest};
use crate::dispatcher::DispatcherHandle;
use crate::error::{BridgeError, CommandError};
use crate::facade::{CompileReport, LaunchMode};
use crate::session::SessionState;

/// Per-request deadline override, capped at the configured request timeout.
pub const TIMEOUT_HEADER: &str = "X-Bridge-Timeout-Ms";
/// Largest request body accepted; longer bodies are rejected unread.
pub const MAX_BODY_BYTES: u64 = 1024 * 1024;
const DEFAULT_EVENT_LIMIT: usize = 50;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConnectBody {
    with_ui: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OpenBody {
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ImportBody {
    #[serde(alias = "scl_code")]
    source: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Status,
    Events { limit: usize },
    Command(CommandRequest),
}

pub struct BridgeServer {
    server: Arc<Server>,
    handle: Option<thread::JoinHandle<()>>,
    pub listen: SocketAddr,
}

impl BridgeServer {
    /// Stop accepting requests and wait for the accept loop to exit.
    pub fn shutdown(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("http accept loop panicked");
            }
        }
    }

    /// Block until the accept loop exits.
    pub fn wait(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn start_bridge_server(
    listen: &str,
    dispatcher: DispatcherHandle,
    request_timeout: Duration,
) -> Result<BridgeServer, BridgeError> {
    let server = Server::http(listen)
        .map_err(|err| BridgeError::Server(format!("bind {listen}: {err}").into()))?;
    let bound = server
        .server_addr()
        .to_ip()
        .ok_or_else(|| BridgeError::Server(format!("{listen} is not an ip listener").into()))?;
    let server = Arc::new(server);
    let accept = server.clone();
    let handle = thread::Builder::new()
        .name("plc-bridge-http".into())
        .spawn(move || {
            for request in accept.incoming_requests() {
                let dispatcher = dispatcher.clone();
                let spawned = thread::Builder::new()
                    .name("plc-bridge-request".into())
                    .spawn(move || handle_request(request, &dispatcher, request_timeout));
                if let Err(err) = spawned {
                    warn!("dropping request, thread spawn failed: {err}");
                }
            }
            debug!("http accept loop stopped");
        })
        .map_err(|err| BridgeError::ThreadSpawn(err.to_string().into()))?;
    info!(listen = %bound, "bridge listening");
    Ok(BridgeServer {
        server,
        handle: Some(handle),
        listen: bound,
    })
}

fn handle_request(mut request: Request, dispatcher: &DispatcherHandle, default_timeout: Duration) {
    let method = request.method().clone();
    let url = request.url().to_string();
    let timeout = request_timeout(&request, default_timeout);
    let (status, payload) = match read_body(request.as_reader(), MAX_BODY_BYTES) {
        Err(err) => malformed(&err.to_string()),
        Ok(body) => match resolve(&method, &url, &body) {
            Ok(Some(Route::Status)) => (200, status_json(dispatcher)),
            Ok(Some(Route::Events { limit })) => (
                200,
                json!({ "events": dispatcher.session().events(limit) }),
            ),
            Ok(Some(Route::Command(command))) => {
                let kind = command.kind();
                let result = dispatcher.execute(command, timeout);
                debug!(%method, %url, command = %kind, ok = result.is_ok(), "request finished");
                command_response(result)
            }
            Ok(None) => (
                404,
                error_body("NotFound", "Unknown", &format!("no route for {method} {url}"), false),
            ),
            Err(err) => malformed(&err.to_string()),
        },
    };
    let mut response = Response::from_string(payload.to_string()).with_status_code(StatusCode(status));
    if let Ok(header) = Header::from_bytes("Content-Type", "application/json") {
        response = response.with_header(header);
    }
    let _ = request.respond(response);
}

fn request_timeout(request: &Request, default_timeout: Duration) -> Duration {
    request
        .headers()
        .iter()
        .find(|header| header.field.equiv(TIMEOUT_HEADER))
        .and_then(|header| header.value.as_str().trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map_or(default_timeout, |ms| {
            default_timeout.min(Duration::from_millis(ms))
        })
}

fn read_body(reader: impl Read, limit: u64) -> Result<String, BridgeError> {
    let mut bytes = Vec::new();
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut bytes)
        .map_err(|err| BridgeError::MalformedRequest(format!("unreadable body: {err}").into()))?;
    if bytes.len() as u64 > limit {
        return Err(BridgeError::MalformedRequest(
            format!("request body exceeds {limit} bytes").into(),
        ));
    }
    String::from_utf8(bytes)
        .map_err(|_| BridgeError::MalformedRequest("request body is not valid UTF-8".into()))
}

fn resolve(method: &Method, url: &str, body: &str) -> Result<Option<Route>, BridgeError> {
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    };
    let path = match path.strip_prefix("/api") {
        Some(rest) if rest.starts_with('/') => rest,
        _ => path,
    };
    let path = path.trim_end_matches('/');
    let segments: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();

    let route = match (method, segments.as_slice()) {
        (Method::Get, ["status"]) => Route::Status,
        (Method::Get, ["events"]) => Route::Events {
            limit: query_limit(query)?,
        },
        (Method::Post, ["connect"]) => {
            let body: ConnectBody = parse_body(body)?;
            let mode = body.with_ui.map(|with_ui| {
                if with_ui {
                    LaunchMode::WithUi
                } else {
                    LaunchMode::Headless
                }
            });
            Route::Command(CommandRequest::Connect { mode })
        }
        (Method::Post, ["project", "open"]) => {
            let body: OpenBody = parse_body(body)?;
            let path = body
                .path
                .map(|path| path.trim().to_string())
                .filter(|path| !path.is_empty())
                .ok_or_else(|| BridgeError::MalformedRequest("missing project path".into()))?;
            Route::Command(CommandRequest::OpenProject { path: path.into() })
        }
        (Method::Get, ["project"]) => Route::Command(CommandRequest::ProjectInfo),
        (Method::Get, ["project", "blocks"]) => Route::Command(CommandRequest::ListBlocks),
        (Method::Post, ["project", "blocks", id, "import"]) => {
            let block = block_id(id)?;
            let body: ImportBody = parse_body(body)?;
            let source = body
                .source
                .filter(|source| !source.trim().is_empty())
                .ok_or_else(|| BridgeError::MalformedRequest("missing block source".into()))?;
            Route::Command(CommandRequest::ImportSource { block, source })
        }
        (Method::Get, ["project", "blocks", id, "export"]) => {
            Route::Command(CommandRequest::ExportSource { block: block_id(id)? })
        }
        (Method::Post, ["project", "blocks", id, "compile"]) => {
            Route::Command(CommandRequest::Compile { block: block_id(id)? })
        }
        (Method::Post, ["project", "close"]) => Route::Command(CommandRequest::CloseProject),
        (Method::Post, ["disconnect"]) => Route::Command(CommandRequest::Disconnect),
        _ => return Ok(None),
    };
    Ok(Some(route))
}

fn parse_body<T: DeserializeOwned + Default>(body: &str) -> Result<T, BridgeError> {
    if body.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(body)
        .map_err(|err| BridgeError::MalformedRequest(format!("invalid json: {err}").into()))
}

fn block_id(raw: &str) -> Result<SmolStr, BridgeError> {
    let decoded = urlencoding::decode(raw)
        .map_err(|err| BridgeError::MalformedRequest(format!("invalid block id: {err}").into()))?;
    let trimmed = decoded.trim();
    if trimmed.is_empty() {
        return Err(BridgeError::MalformedRequest("empty block id".into()));
    }
    Ok(SmolStr::new(trimmed))
}

fn query_limit(query: Option<&str>) -> Result<usize, BridgeError> {
    let Some(value) = query
        .into_iter()
        .flat_map(|query| query.split('&'))
        .filter_map(|pair| pair.split_once('='))
        .find_map(|(key, value)| (key == "limit").then_some(value))
    else {
        return Ok(DEFAULT_EVENT_LIMIT);
    };
    value
        .parse::<usize>()
        .map_err(|_| BridgeError::MalformedRequest(format!("invalid limit '{value}'").into()))
}

fn status_json(dispatcher: &DispatcherHandle) -> Value {
    serde_json::to_value(dispatcher.status()).unwrap_or_else(|_| json!({ "bridge": "online" }))
}

fn malformed(message: &str) -> (u16, Value) {
    (400, error_body("MalformedRequest", "Unknown", message, false))
}

fn error_body(kind: &str, category: &str, message: &str, recoverable: bool) -> Value {
    json!({
        "ok": false,
        "error": {
            "kind": kind,
            "category": category,
            "message": message,
            "recoverable": recoverable,
        }
    })
}

fn command_response(result: Result<CommandOutput, CommandError>) -> (u16, Value) {
    match result {
        Ok(output) => (200, json!({ "ok": true, "result": output_json(output) })),
        Err(err) => (
            err.http_status(),
            error_body(
                err.kind(),
                err.category().as_str(),
                &err.to_string(),
                err.recoverable(),
            ),
        ),
    }
}

fn output_json(output: CommandOutput) -> Value {
    match output {
        CommandOutput::Connected {
            state,
            handle_epoch,
            launched,
        } => json!({
            "sessionState": state,
            "handleEpoch": handle_epoch,
            "launched": launched,
        }),
        CommandOutput::ProjectOpened { path } => json!({
            "sessionState": SessionState::ProjectOpen,
            "activeProjectPath": path.display().to_string(),
        }),
        CommandOutput::Blocks(blocks) => json!({ "blocks": blocks }),
        CommandOutput::Imported { block } => json!({ "block": block, "imported": true }),
        CommandOutput::Exported { block, source } => json!({ "block": block, "source": source }),
        CommandOutput::Compiled(report) => compile_json(&report),
        CommandOutput::ProjectInfo(info) => json!({
            "projectName": info.name,
            "projectPath": info.path,
            "deviceCount": info.devices.len(),
            "devices": info.devices,
            "blockCount": info.block_count,
        }),
        CommandOutput::ProjectClosed => json!({ "sessionState": SessionState::Attached }),
        CommandOutput::Disconnected => json!({ "sessionState": SessionState::Disconnected }),
        CommandOutput::Probed => json!({}),
    }
}

fn compile_json(report: &CompileReport) -> Value {
    json!({
        "success": report.success,
        "diagnostics": report.diagnostics,
        "error_count": report.error_count(),
        "warning_count": report.warning_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(method: Method, url: &str, body: &str) -> Result<Option<Route>, BridgeError> {
        resolve(&method, url, body)
    }

    #[test]
    fn api_prefix_is_optional() {
        assert_eq!(route(Method::Get, "/status", "").unwrap(), Some(Route::Status));
        assert_eq!(route(Method::Get, "/api/status", "").unwrap(), Some(Route::Status));
        assert_eq!(route(Method::Get, "/apistatus", "").unwrap(), None);
    }

    #[test]
    fn block_ids_are_percent_decoded() {
        let resolved = route(Method::Get, "/project/blocks/Motor%20Control/export", "").unwrap();
        assert_eq!(
            resolved,
            Some(Route::Command(CommandRequest::ExportSource {
                block: "Motor Control".into()
            }))
        );
    }

    #[test]
    fn import_accepts_legacy_field_name() {
        let resolved = route(
            Method::Post,
            "/api/project/blocks/Main/import",
            r#"{"scl_code":"FUNCTION \"Main\" : Void\nEND_FUNCTION"}"#,
        )
        .unwrap();
        assert!(matches!(
            resolved,
            Some(Route::Command(CommandRequest::ImportSource { .. }))
        ));
    }

    #[test]
    fn malformed_bodies_are_rejected() {
        assert!(route(Method::Post, "/project/open", "{}").is_err());
        assert!(route(Method::Post, "/project/open", "{not json").is_err());
        assert!(route(Method::Post, "/project/blocks/Main/import", r#"{"source":"  "}"#).is_err());
        assert!(route(Method::Post, "/project/blocks/%20/compile", "").is_err());
        assert!(route(Method::Get, "/events?limit=many", "").is_err());
    }

    #[test]
    fn oversized_bodies_are_rejected() {
        let limit = 16;
        assert_eq!(read_body(&b"{\"path\":\"a.ap\"}"[..], limit).unwrap().len(), 15);
        assert_eq!(read_body(&[b' '; 16][..], limit).unwrap().len(), 16);
        let err = read_body(&[b' '; 64][..], limit).unwrap_err();
        assert!(err.to_string().contains("exceeds 16 bytes"), "{err}");
        assert!(read_body(&[0xff, 0xfe][..], limit).is_err());
    }

    #[test]
    fn project_info_is_a_read_only_route() {
        assert_eq!(
            route(Method::Get, "/api/project", "").unwrap(),
            Some(Route::Command(CommandRequest::ProjectInfo))
        );
        assert_eq!(route(Method::Post, "/project", "").unwrap(), None);
    }

    #[test]
    fn connect_mode_follows_with_ui() {
        assert_eq!(
            route(Method::Post, "/connect", r#"{"with_ui":false}"#).unwrap(),
            Some(Route::Command(CommandRequest::Connect {
                mode: Some(LaunchMode::Headless)
            }))
        );
        assert_eq!(
            route(Method::Post, "/connect", "").unwrap(),
            Some(Route::Command(CommandRequest::Connect { mode: None }))
        );
    }

    #[test]
    fn unknown_routes_and_methods_are_not_found() {
        assert_eq!(route(Method::Get, "/connect", "").unwrap(), None);
        assert_eq!(route(Method::Post, "/project/blocks/Main/flash", "").unwrap(), None);
        assert_eq!(
            route(Method::Get, "/events?limit=5", "").unwrap(),
            Some(Route::Events { limit: 5 })
        );
    }
}
