//! `serve` and `check-config`.

use std::path::PathBuf;

use anyhow::Context;
use plc_bridge::config::BridgeConfig;
use plc_bridge::facade::{HostLinkFacade, HostWatch, SimulatedHost};
use plc_bridge::Bridge;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::ServeArgs;

pub fn run_serve(config_path: Option<PathBuf>, args: ServeArgs) -> anyhow::Result<()> {
    let mut config = BridgeConfig::resolve(config_path.as_deref())?;
    apply_overrides(&mut config, &args);
    config.validate()?;
    init_tracing(&config.log_level);

    let mut bridge = if args.simulate {
        info!("using simulated engineering tool");
        Bridge::start_simulated(&config, SimulatedHost::new())?
    } else {
        if config.host.address.is_none() && config.host.command.is_none() {
            anyhow::bail!("host.address or host.command required (or pass --simulate)");
        }
        let watch = HostWatch::new();
        let facade = HostLinkFacade::new(config.host.link_config(), watch.clone());
        Bridge::start(&config, Box::new(facade), watch)?
    };
    println!("plc-bridge listening on http://{}", bridge.listen());
    bridge.wait();
    Ok(())
}

pub fn run_check_config(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = BridgeConfig::resolve(config_path.as_deref()).context("config check failed")?;
    println!("listen={}", config.server.listen);
    println!(
        "request_timeout_ms={}",
        config.server.request_timeout.as_millis()
    );
    println!(
        "host.address={}",
        config.host.address.as_deref().unwrap_or("-")
    );
    println!(
        "host.command={}",
        config
            .host
            .command
            .as_ref()
            .map_or_else(|| "-".to_string(), |path| path.display().to_string())
    );
    println!("host.launch_mode={}", config.host.launch_mode.as_str());
    println!("host.timeout_policy={:?}", config.host.timeout_policy);
    println!("queue.max_pending={}", config.max_pending);
    println!(
        "health.interval_ms={} failure_threshold={} probe_timeout_ms={}",
        config.health.interval.as_millis(),
        config.health.failure_threshold,
        config.health.probe_timeout.as_millis()
    );
    for (kind, timeout) in config.timeouts.iter() {
        println!("timeouts.{}={}", kind.config_key(), timeout.as_millis());
    }
    println!("config ok");
    Ok(())
}

fn apply_overrides(config: &mut BridgeConfig, args: &ServeArgs) {
    if let Some(listen) = &args.listen {
        config.server.listen = listen.as_str().into();
    }
    if let Some(address) = &args.host_address {
        config.host.address = Some(address.as_str().into());
    }
    if let Some(command) = &args.host_command {
        config.host.command = Some(command.clone());
    }
    if let Some(dir) = &args.project_dir {
        config.host.project_dir = Some(dir.clone());
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
