use crate::config::{ConnectionSettings, EndpointConfig};
use crate::connection::{Command, ConnectionManager, ConnectionState, ConnectionStatus};
use crate::subscription::GROUP_COUNT;
use serde_json::Value;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Ready,
    Change(Value),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    InvalidGroup(usize),
    Stopped,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidGroup(index) => write!(
                f,
                "change group index {index} out of range (0..{GROUP_COUNT})"
            ),
            Self::Stopped => write!(f, "client has been shut down"),
        }
    }
}

impl std::error::Error for ClientError {}

// Handle the host holds. Dropping it shuts the connection down gracefully.
pub struct QsysClient {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
    first_subscriber: Mutex<Option<broadcast::Receiver<ClientEvent>>>,
    status: watch::Receiver<ConnectionStatus>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl QsysClient {
    pub fn start(endpoint: EndpointConfig) -> Self {
        Self::start_with_settings(endpoint, ConnectionSettings::default())
    }

    pub fn start_with_settings(endpoint: EndpointConfig, settings: ConnectionSettings) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = broadcast::channel(EVENT_CAPACITY);
        let auth = if endpoint.auth_enabled() {
            "with credentials"
        } else {
            "without credentials"
        };
        tracing::info!(
            host = %endpoint.primary_host,
            port = endpoint.port,
            redundant_host = ?endpoint.redundant_host,
            redundancy = endpoint.failover_enabled(),
            auth,
            "starting core client"
        );
        let manager = ConnectionManager::new(endpoint, settings, cmd_rx, event_tx.clone());
        let status = manager.status_receiver();
        let task = tokio::spawn(manager.run());
        Self {
            commands: cmd_tx,
            events: event_tx,
            first_subscriber: Mutex::new(Some(event_rx)),
            status,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.first_subscriber
            .lock()
            .ok()
            .and_then(|mut first| first.take())
            .unwrap_or_else(|| self.events.subscribe())
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_writable()
    }

    // Best effort: written to the live socket, silently dropped otherwise.
    pub fn send_command(&self, message: Value) {
        let _ = self.commands.send(Command::Send(message));
    }

    pub fn enable_auto_poll(&self, index: usize) -> Result<(), ClientError> {
        if index >= GROUP_COUNT {
            return Err(ClientError::InvalidGroup(index));
        }
        self.commands
            .send(Command::EnableAutoPoll(index))
            .map_err(|_| ClientError::Stopped)
    }

    pub async fn shutdown(&self, forced: bool) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown {
                forced,
                done: done_tx,
            })
            .is_ok()
        {
            let _ = done_rx.await;
        }
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "connection task ended abnormally");
            }
        }
    }
}
