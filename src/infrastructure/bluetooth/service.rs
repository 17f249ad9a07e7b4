//! Connection Manager
//!
//! Owns the connection state machine and the session loop: connect, read
//! the initial positions, serve operator commands, and start over whenever
//! the link faults.
//!
//! ```text
//! Disconnected --connect--> Connecting --open--> Connected
//!      ^                        |                    |
//!      +------ attempt failed --+-- fault / cancel --+
//!
//! Connecting --adapter missing--> Failed (session ends)
//! ```

use crate::domain::demo::DemoSequencer;
use crate::domain::error::LinkError;
use crate::domain::models::{
    ActuatorAngles, AppEvent, ConnectionState, LinkCommand, MessageSeverity, StatusMessage,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::connection::{self, Adapter, LinkHandle};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::serializer::{CommandSerializer, LinkFault};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Link parameters resolved from settings.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub target_address: String,
    pub service_uuid: u128,
    pub settle_delay: Duration,
    pub demo_tick: Duration,
    pub reconnect_delay: Duration,
}

impl LinkConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let service_uuid = protocol::parse_uuid(&settings.service_uuid)
            .context("Invalid service_uuid in settings")?;
        Ok(Self {
            target_address: settings.target_address.clone(),
            service_uuid,
            settle_delay: Duration::from_millis(settings.settle_delay_ms),
            demo_tick: Duration::from_millis(settings.demo_tick_ms),
            reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
        })
    }
}

struct ActiveLink {
    serializer: CommandSerializer,
    demo: Option<DemoSequencer>,
}

enum Served {
    LinkLost,
    Cancelled,
}

pub struct ConnectionManager {
    adapter: Arc<dyn Adapter>,
    config: LinkConfig,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    state: watch::Sender<ConnectionState>,
    fault_tx: mpsc::UnboundedSender<LinkFault>,
    fault_rx: mpsc::UnboundedReceiver<LinkFault>,
    active: Option<ActiveLink>,
}

impl ConnectionManager {
    pub fn new(
        adapter: Arc<dyn Adapter>,
        config: LinkConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        Self {
            adapter,
            config,
            event_sender,
            state,
            fault_tx,
            fault_rx,
            active: None,
        }
    }

    /// Observe state changes without being able to make them.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// One connection attempt to `address`; never retried here.
    ///
    /// The blocking lookup and open run on the blocking pool.
    pub async fn connect(&self, address: &str) -> Result<LinkHandle, LinkError> {
        self.set_state(ConnectionState::Connecting);
        let _ = self.event_sender.send(AppEvent::ConnectStarted {
            address: address.to_string(),
        });
        info!("Connecting to {}", address);

        let adapter = self.adapter.clone();
        let target = address.to_string();
        let service = self.config.service_uuid;
        let result = tokio::task::spawn_blocking(move || {
            connection::open_link(adapter.as_ref(), &target, service)
        })
        .await
        .unwrap_or_else(|e| Err(LinkError::IoFailure(format!("connect task failed: {}", e))));

        match &result {
            Ok(_) => self.set_state(ConnectionState::Connected),
            Err(LinkError::AdapterUnavailable(_)) => self.set_state(ConnectionState::Failed),
            Err(_) => self.set_state(ConnectionState::Disconnected),
        }
        result
    }

    /// Close the current link: queued commands fail with `LinkClosed`,
    /// demo mode stops, state goes to `Disconnected`.
    pub async fn teardown(&mut self) {
        if let Some(active) = self.active.take() {
            if let Some(demo) = active.demo {
                self.stop_demo(demo).await;
            }
            let cancelled = active.serializer.close();
            info!(
                "Link {} torn down ({} queued command(s) cancelled)",
                active.serializer.link_id(),
                cancelled
            );
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Run the session until the operator cancels.
    ///
    /// Returns an error only when the adapter is unavailable.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    ) -> Result<(), LinkError> {
        loop {
            let Some(serializer) = self.establish(&mut commands).await? else {
                info!("Connection cancelled by operator");
                return Ok(());
            };

            match self.serve(serializer, &mut commands).await {
                Served::LinkLost => {
                    self.teardown().await;
                    self.send_log("Connection lost. Reconnecting...", MessageSeverity::Warning);
                }
                Served::Cancelled => {
                    self.teardown().await;
                    info!("Session closed by operator");
                    return Ok(());
                }
            }
        }
    }

    /// Connect, retrying until a link is up and its positions are known.
    /// `None` when the operator cancelled.
    async fn establish(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
    ) -> Result<Option<CommandSerializer>, LinkError> {
        let address = self.config.target_address.clone();

        loop {
            // Commands arriving mid-attempt must not restart it; only cancel
            // abandons the attempt.
            let attempt = {
                let connect = self.connect(&address);
                tokio::pin!(connect);
                loop {
                    tokio::select! {
                        biased;

                        cmd = commands.recv() => match cmd {
                            None | Some(LinkCommand::CancelConnection) => break None,
                            Some(other) => debug!("Connecting, dropping {:?}", other),
                        },

                        result = &mut connect => break Some(result),
                    }
                }
            };
            let Some(attempt) = attempt else {
                self.set_state(ConnectionState::Disconnected);
                return Ok(None);
            };

            let retry_after = match attempt {
                Ok(handle) => match self.initialize(handle).await {
                    Ok(serializer) => return Ok(Some(serializer)),
                    Err(e) => {
                        warn!("Link initialization failed: {}", e);
                        Some(self.config.reconnect_delay)
                    }
                },
                Err(LinkError::AdapterUnavailable(reason)) => {
                    error!("Bluetooth adapter unavailable: {}", reason);
                    self.finish_connect(None);
                    self.send_log(
                        "Bluetooth adapter unavailable. Closing.",
                        MessageSeverity::Error,
                    );
                    return Err(LinkError::AdapterUnavailable(reason));
                }
                Err(e @ LinkError::NotPaired(_)) => {
                    warn!("{}", e);
                    self.finish_connect(None);
                    self.send_log(&e.to_string(), MessageSeverity::Error);
                    self.send_log("Waiting for a reconnect request.", MessageSeverity::Info);
                    None
                }
                Err(e) => {
                    warn!("Connection attempt failed: {}", e);
                    self.finish_connect(None);
                    Some(self.config.reconnect_delay)
                }
            };

            if !Self::wait_before_retry(commands, retry_after).await {
                self.set_state(ConnectionState::Disconnected);
                return Ok(None);
            }
        }
    }

    /// Bind the link to a serializer and read the initial positions before
    /// anything else is allowed onto it.
    async fn initialize(&mut self, handle: LinkHandle) -> Result<CommandSerializer, LinkError> {
        let serializer = match CommandSerializer::spawn(
            handle,
            self.config.settle_delay,
            self.fault_tx.clone(),
        ) {
            Ok(serializer) => serializer,
            Err(e) => {
                self.finish_connect(None);
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        self.active = Some(ActiveLink {
            serializer: serializer.clone(),
            demo: None,
        });

        match serializer.submit_download().await {
            Ok(positions) => {
                info!("Link {} ready at {}", serializer.link_id(), positions);
                self.finish_connect(Some(positions));
                self.send_log("Connected", MessageSeverity::Success);
                Ok(serializer)
            }
            Err(e) => {
                self.finish_connect(None);
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// `delay: None` waits for an operator `Reconnect`. Returns false on cancel.
    async fn wait_before_retry(
        commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
        delay: Option<Duration>,
    ) -> bool {
        let timer = async {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => return true,
                cmd = commands.recv() => match cmd {
                    None | Some(LinkCommand::CancelConnection) => return false,
                    Some(LinkCommand::Reconnect) => return true,
                    Some(other) => debug!("Not connected, dropping {:?}", other),
                },
            }
        }
    }

    async fn serve(
        &mut self,
        serializer: CommandSerializer,
        commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
    ) -> Served {
        loop {
            tokio::select! {
                Some(fault) = self.fault_rx.recv() => {
                    if fault.link_id == serializer.link_id() {
                        warn!("Link {} faulted: {}", fault.link_id, fault.error);
                        return Served::LinkLost;
                    }
                    debug!("Ignoring fault from stale link {}", fault.link_id);
                }
                cmd = commands.recv() => match cmd {
                    None | Some(LinkCommand::CancelConnection) => return Served::Cancelled,
                    Some(cmd) => self.handle_command(cmd, &serializer).await,
                },
            }
        }
    }

    async fn handle_command(&mut self, cmd: LinkCommand, serializer: &CommandSerializer) {
        let demo_running = self
            .active
            .as_ref()
            .is_some_and(|active| active.demo.is_some());

        match cmd {
            LinkCommand::SetAngles(angles) => {
                if demo_running {
                    warn!("Demo mode active, ignoring manual position {}", angles);
                    return;
                }
                spawn_upload(&self.event_sender, serializer, angles);
            }
            LinkCommand::StartDemo => {
                if demo_running {
                    debug!("Demo mode already running");
                    return;
                }
                let events = self.event_sender.clone();
                let uploads = serializer.clone();
                let demo = DemoSequencer::spawn(self.config.demo_tick, move |angles| {
                    let _ = events.send(AppEvent::DemoTick(angles));
                    spawn_upload(&events, &uploads, angles);
                });
                if let Some(active) = self.active.as_mut() {
                    active.demo = Some(demo);
                }
            }
            LinkCommand::StopDemo => {
                if let Some(demo) = self.active.as_mut().and_then(|active| active.demo.take()) {
                    self.stop_demo(demo).await;
                }
            }
            LinkCommand::Refresh => {
                let completion = serializer.submit_download();
                let events = self.event_sender.clone();
                tokio::spawn(async move {
                    let positions = match completion.await {
                        Ok(positions) => Some(positions),
                        Err(e) => {
                            debug!("Refresh failed: {}", e);
                            None
                        }
                    };
                    let _ = events.send(AppEvent::DownloadFinished { positions });
                });
            }
            LinkCommand::Reconnect => debug!("Already connected"),
            LinkCommand::CancelConnection => {}
        }
    }

    /// `DemoStopped` goes out only after the last tick has been emitted.
    async fn stop_demo(&self, demo: DemoSequencer) {
        demo.shutdown().await;
        let _ = self.event_sender.send(AppEvent::DemoStopped);
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Connection state {:?} -> {:?}", previous, next);
            let _ = self.event_sender.send(AppEvent::ConnectionState(next));
        }
    }

    fn finish_connect(&self, positions: Option<ActuatorAngles>) {
        let _ = self.event_sender.send(AppEvent::ConnectFinished {
            success: positions.is_some(),
            positions,
        });
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

/// Queue an upload now and report its outcome when it completes.
fn spawn_upload(
    events: &mpsc::UnboundedSender<AppEvent>,
    serializer: &CommandSerializer,
    angles: ActuatorAngles,
) {
    let completion = serializer.submit_upload(angles);
    let events = events.clone();
    tokio::spawn(async move {
        let result = completion.await;
        if let Err(e) = &result {
            debug!("Upload {} failed: {}", angles, e);
        }
        let _ = events.send(AppEvent::UploadFinished {
            success: result.is_ok(),
        });
    });
}
