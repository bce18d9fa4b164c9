//! Bridge assembly (dispatcher + health monitor + HTTP server).

use std::net::SocketAddr;

use tracing::info;

use crate::config::BridgeConfig;
use crate::dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle};
use crate::error::BridgeError;
use crate::facade::{AutomationFacade, HostWatch, SimulatedFacade, SimulatedHost};
use crate::health::{HealthHandle, HealthMonitor};
use crate::server::{start_bridge_server, BridgeServer};
use crate::session::SessionMachine;

/// A running bridge.
pub struct Bridge {
    dispatcher: Dispatcher,
    health: HealthHandle,
    server: BridgeServer,
}

impl Bridge {
    /// Start the dispatcher worker, the health monitor and the HTTP listener.
    pub fn start(
        config: &BridgeConfig,
        facade: Box<dyn AutomationFacade>,
        host: HostWatch,
    ) -> Result<Self, BridgeError> {
        config.validate()?;
        let dispatcher = Dispatcher::spawn(
            facade,
            SessionMachine::new(),
            host,
            DispatcherConfig::from(config),
        )?;
        let health = HealthMonitor::new(dispatcher.handle(), config.health).spawn()?;
        let server = start_bridge_server(
            &config.server.listen,
            dispatcher.handle(),
            config.server.request_timeout,
        )?;
        info!(
            listen = %server.listen,
            max_pending = config.max_pending,
            "bridge started"
        );
        Ok(Self {
            dispatcher,
            health,
            server,
        })
    }

    /// Start against an in-memory engineering tool.
    pub fn start_simulated(config: &BridgeConfig, host: SimulatedHost) -> Result<Self, BridgeError> {
        let watch = HostWatch::new();
        let facade = SimulatedFacade::new(host, watch.clone());
        Self::start(config, Box::new(facade), watch)
    }

    /// Address the HTTP listener is bound to.
    #[must_use]
    pub fn listen(&self) -> SocketAddr {
        self.server.listen
    }

    /// Submission handle to the running dispatcher.
    #[must_use]
    pub fn handle(&self) -> DispatcherHandle {
        self.dispatcher.handle()
    }

    /// Block until the HTTP listener stops.
    pub fn wait(&mut self) {
        self.server.wait();
    }

    /// Stop accepting requests, stop the monitor and drain the dispatcher.
    pub fn shutdown(mut self) {
        self.server.shutdown();
        self.health.join();
        self.dispatcher.shutdown();
        info!("bridge stopped");
    }
}
