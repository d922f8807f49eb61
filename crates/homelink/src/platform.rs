//! Host lifecycle: wires the bridge, the upstream client and the automation
//! sandbox together on launch and tears them down on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::api::StatusSource;
use crate::bridge::DeviceBridge;
use crate::bridge::Instance;
use crate::metrics::Metrics;
use crate::protocol::ClientMessage;
use crate::sandbox::Launcher;
use crate::sandbox::Sandbox;
use crate::sandbox::SandboxHandle;
use crate::sandbox::SandboxOptions;
use crate::timer::Timer;
use crate::upstream::Backoff;
use crate::upstream::ClientOptions;
use crate::upstream::Connector;
use crate::upstream::UpstreamClient;
use crate::upstream::UpstreamHandle;

#[derive(Debug, Clone)]
pub struct PlatformOptions {
    pub client: ClientOptions,
    /// Quiet period after the last discovered instance
    pub settle_delay: Duration,
}

/// A user script to run alongside the client.
pub struct Automation {
    pub source: String,
    pub launcher: Arc<dyn Launcher>,
    pub options: SandboxOptions,
}

/// Running homelink instance
pub struct Platform {
    metrics: Metrics,
    client: UpstreamHandle,
    sandbox: Option<SandboxHandle>,
    shutdown_tx: watch::Sender<bool>,
    client_task: JoinHandle<()>,
    discovery_task: JoinHandle<()>,
}

impl Platform {
    /// Start everything once the host has launched.
    ///
    /// Connects upstream right away. The first `deviceList` is sent once no
    /// new instance has been discovered for `settle_delay`, after which
    /// characteristic changes are forwarded as they are reported.
    pub fn launched(
        options: PlatformOptions,
        bridge: Arc<dyn DeviceBridge>,
        connector: Arc<dyn Connector>,
        automation: Option<Automation>,
    ) -> Self {
        info!("[platform] Launching");
        let metrics = Metrics::new();
        let (mut client, handle) =
            UpstreamClient::new(options.client, connector, bridge.clone(), metrics.clone());

        let sandbox = automation.map(|automation| {
            let (sandbox, sandbox_handle) = Sandbox::new(
                automation.source,
                automation.launcher,
                Arc::new(handle.clone()),
                metrics.clone(),
                automation.options,
            );
            client.observe(Arc::new(sandbox_handle.clone()));
            sandbox.spawn();
            sandbox_handle
        });

        let client_task = client.spawn();
        handle.connect();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let discovery_task = tokio::spawn(discover_and_monitor(
            bridge,
            handle.clone(),
            options.settle_delay,
            shutdown_rx,
        ));

        Self {
            metrics,
            client: handle,
            sandbox,
            shutdown_tx,
            client_task,
            discovery_task,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn client(&self) -> &UpstreamHandle {
        &self.client
    }

    pub fn sandbox(&self) -> Option<&SandboxHandle> {
        self.sandbox.as_ref()
    }

    pub fn status_source(&self) -> StatusSource {
        StatusSource {
            client: self.client.clone(),
            sandbox: self.sandbox.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Stop monitoring, dispose the sandbox and close the connection.
    pub async fn shutdown(self) {
        info!("[platform] Shutting down");
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.discovery_task.await {
            warn!("[platform] Discovery task failed: {}", e);
        }

        if let Some(sandbox) = &self.sandbox {
            sandbox.dispose().await;
        }

        self.client.shutdown().await;
        if let Err(e) = self.client_task.await {
            warn!("[platform] Client task failed: {}", e);
        }
        info!("[platform] Shutdown complete");
    }
}

/// Wait until no instance has been discovered for `delay`.
async fn wait_for_settle(mut instances: mpsc::Receiver<Instance>, delay: Duration) -> usize {
    let mut settle = Timer::default();
    settle.schedule(delay);
    let mut found = 0;
    let mut discovering = true;

    loop {
        tokio::select! {
            instance = instances.recv(), if discovering => match instance {
                Some(instance) => {
                    info!(
                        "[platform] Discovered {} at {}:{}",
                        instance.name, instance.host, instance.port
                    );
                    found += 1;
                    settle.schedule(delay);
                }
                None => discovering = false,
            },
            _ = settle.fired() => return found,
        }
    }
}

/// Sleep for `delay`. False if shutdown was requested meanwhile.
async fn pause(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}

async fn discover_and_monitor(
    bridge: Arc<dyn DeviceBridge>,
    client: UpstreamHandle,
    settle_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let instances = bridge.discover_instances();
    let found = tokio::select! {
        found = wait_for_settle(instances, settle_delay) => found,
        _ = shutdown.changed() => return,
    };
    debug!("[platform] Discovery settled with {} instances", found);

    let mut backoff = Backoff::default();
    loop {
        match bridge.get_all_services().await {
            Ok(services) => {
                info!("[platform] Sending {} services", services.len());
                client.send(ClientMessage::DeviceList(services));
                break;
            }
            Err(e) => {
                let delay = backoff.next_delay();
                error!(
                    "[platform] Failed to fetch services, retrying in {:?}: {}",
                    delay, e
                );
                if !pause(&mut shutdown, delay).await {
                    return;
                }
            }
        }
    }

    backoff.reset();
    loop {
        let mut monitor = match bridge.monitor_characteristics().await {
            Ok(monitor) => {
                backoff.reset();
                monitor
            }
            Err(e) => {
                let delay = backoff.next_delay();
                error!(
                    "[platform] Failed to monitor characteristics, retrying in {:?}: {}",
                    delay, e
                );
                if !pause(&mut shutdown, delay).await {
                    return;
                }
                continue;
            }
        };

        let stopping = loop {
            tokio::select! {
                batch = monitor.next() => match batch {
                    Some(services) => {
                        for service in services {
                            client.send(ClientMessage::DeviceStatusChange(service));
                        }
                    }
                    None => break false,
                },
                _ = shutdown.changed() => break true,
            }
        };
        monitor.finish();
        if stopping {
            break;
        }

        let delay = backoff.next_delay();
        warn!(
            "[platform] Characteristic monitor stopped, resubscribing in {:?}",
            delay
        );
        if !pause(&mut shutdown, delay).await {
            break;
        }
    }

    debug!("[platform] Monitoring finished");
}
