//! HTTP client for a running bridge.

use std::path::Path;

use anyhow::Context;
use plc_bridge::server::TIMEOUT_HEADER;
use serde_json::{json, Value};

use crate::cli::CtlAction;

pub fn run_ctl(url: &str, timeout_ms: Option<u64>, action: CtlAction) -> anyhow::Result<()> {
    let base = url.trim_end_matches('/');
    let (method, path, body) = build_request(&action)?;
    let mut request = ureq::request(method, &format!("{base}{path}"));
    if let Some(ms) = timeout_ms {
        request = request.set(TIMEOUT_HEADER, &ms.to_string());
    }
    let response = match body {
        Some(body) => request
            .set("Content-Type", "application/json")
            .send_string(&body.to_string()),
        None => request.call(),
    };
    let (status, text) = match response {
        Ok(resp) => (resp.status(), resp.into_string()?),
        Err(ureq::Error::Status(code, resp)) => (code, resp.into_string()?),
        Err(err) => return Err(err).with_context(|| format!("request to {base} failed")),
    };
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("bridge returned non-json body ({status})"))?;
    if status >= 400 {
        let error = &value["error"];
        anyhow::bail!(
            "{} ({}): {}",
            error["kind"].as_str().unwrap_or("Error"),
            status,
            error["message"].as_str().unwrap_or("")
        );
    }
    print_response(&action, &value)
}

fn build_request(action: &CtlAction) -> anyhow::Result<(&'static str, String, Option<Value>)> {
    Ok(match action {
        CtlAction::Status => ("GET", "/status".into(), None),
        CtlAction::Connect { headless } => (
            "POST",
            "/connect".into(),
            Some(json!({ "with_ui": !headless })),
        ),
        CtlAction::Open { path } => ("POST", "/project/open".into(), Some(json!({ "path": path }))),
        CtlAction::Info => ("GET", "/project".into(), None),
        CtlAction::Blocks => ("GET", "/project/blocks".into(), None),
        CtlAction::Import { block, file } => {
            let source = std::fs::read_to_string(file)
                .with_context(|| format!("read {}", file.display()))?;
            (
                "POST",
                format!("/project/blocks/{}/import", urlencoding::encode(block)),
                Some(json!({ "source": source })),
            )
        }
        CtlAction::Export { block, .. } => (
            "GET",
            format!("/project/blocks/{}/export", urlencoding::encode(block)),
            None,
        ),
        CtlAction::Compile { block } => (
            "POST",
            format!("/project/blocks/{}/compile", urlencoding::encode(block)),
            None,
        ),
        CtlAction::Close => ("POST", "/project/close".into(), None),
        CtlAction::Disconnect => ("POST", "/disconnect".into(), None),
        CtlAction::Events { limit } => ("GET", format!("/events?limit={limit}"), None),
    })
}

fn print_response(action: &CtlAction, value: &Value) -> anyhow::Result<()> {
    match action {
        CtlAction::Status => {
            println!(
                "bridge={} state={} project={} host_alive={} queue={} epoch={}",
                value["bridge"].as_str().unwrap_or("?"),
                value["sessionState"].as_str().unwrap_or("?"),
                value["activeProjectPath"].as_str().unwrap_or("-"),
                value["hostProcessAlive"],
                value["queueDepth"],
                value["handleEpoch"],
            );
            if let Some(message) = value["lastError"]["message"].as_str() {
                println!("last_error={message}");
            }
        }
        CtlAction::Info => {
            let result = &value["result"];
            println!(
                "{} ({}) devices={} blocks={}",
                result["projectName"].as_str().unwrap_or("?"),
                result["projectPath"].as_str().unwrap_or("?"),
                result["deviceCount"],
                result["blockCount"],
            );
        }
        CtlAction::Blocks => {
            for block in value["result"]["blocks"].as_array().into_iter().flatten() {
                let group = block["groupPath"].as_str().unwrap_or("");
                let name = block["name"].as_str().unwrap_or("?");
                let kind = block["kind"].as_str().unwrap_or("");
                if group.is_empty() {
                    println!("{name}\t{kind}");
                } else {
                    println!("{group}/{name}\t{kind}");
                }
            }
        }
        CtlAction::Export { output, .. } => {
            let source = value["result"]["source"].as_str().unwrap_or_default();
            match output {
                Some(path) => write_output(path, source)?,
                None => println!("{source}"),
            }
        }
        CtlAction::Compile { block } => {
            let result = &value["result"];
            println!(
                "{block}: success={} errors={} warnings={}",
                result["success"], result["error_count"], result["warning_count"]
            );
            for diag in result["diagnostics"].as_array().into_iter().flatten() {
                println!(
                    "  {}: {}",
                    diag["severity"].as_str().unwrap_or("info"),
                    diag["message"].as_str().unwrap_or("")
                );
            }
        }
        CtlAction::Events { .. } => {
            for event in value["events"].as_array().into_iter().flatten() {
                println!(
                    "{} {} [{}] {}",
                    event["timestampMs"],
                    event["kind"].as_str().unwrap_or("?"),
                    event["state"].as_str().unwrap_or("?"),
                    event["message"].as_str().unwrap_or("")
                );
            }
        }
        _ => println!("{}", serde_json::to_string_pretty(&value["result"])?),
    }
    Ok(())
}

fn write_output(path: &Path, source: &str) -> anyhow::Result<()> {
    std::fs::write(path, source).with_context(|| format!("write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}
