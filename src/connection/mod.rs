use crate::client::ClientEvent;
use crate::codec::{self, FrameDecoder};
use crate::config::{ConnectionSettings, EndpointConfig};
use crate::protocol::{logon_request, no_op_request, DispatchEvent, Dispatcher};
use crate::subscription::SubscriptionRegistry;
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::Instrument;

pub const WIRE_LOG_TARGET: &str = "qsys_core_link::wire";
const READ_BUFFER_SIZE: usize = 8 * 1024;

macro_rules! connection_event {
    ($enabled:expr, $($arg:tt)+) => {
        if $enabled {
            tracing::info!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingReady,
    Authenticating,
    Live,
    ReconnectScheduled,
    FailingOver,
}

impl ConnectionState {
    pub fn may_connect(self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::ReconnectScheduled | Self::FailingOver
        )
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Self::AwaitingReady | Self::Authenticating | Self::Live)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Primary,
    Redundant,
}

impl Target {
    fn toggled(self) -> Self {
        match self {
            Self::Primary => Self::Redundant,
            Self::Redundant => Self::Primary,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub target: Target,
    pub host: String,
    pub generation: u64,
    pub reconnect_attempts: u32,
    pub last_retry_delay: Option<Duration>,
    pub last_error: Option<String>,
    pub updated_ts_unix_ms: u64,
}

#[derive(Debug)]
pub enum Command {
    Send(Value),
    EnableAutoPoll(usize),
    Shutdown {
        forced: bool,
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    Closed,
    IdleTimeout,
    Transport,
    Standby,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Reconnect,
    FailOver { immediate: bool },
}

pub fn recovery_for(failover_enabled: bool, cause: FailureCause, reached_live: bool) -> Recovery {
    match cause {
        FailureCause::Standby | FailureCause::Transport if failover_enabled => Recovery::FailOver {
            immediate: reached_live,
        },
        _ => Recovery::Reconnect,
    }
}

pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(cap)
}

type ShutdownAck = Option<oneshot::Sender<()>>;

enum SessionEnd {
    Shutdown(ShutdownAck),
    Failed { cause: FailureCause, reason: String },
}

enum BackoffWait {
    Elapsed,
    Stop(ShutdownAck),
}

// Owns the socket and every timer tied to it. Runs as a single task, so
// the accumulator, counters and subscription flags need no locking.
pub struct ConnectionManager {
    endpoint: EndpointConfig,
    settings: ConnectionSettings,
    dispatcher: Dispatcher,
    registry: SubscriptionRegistry,
    decoder: FrameDecoder,
    target: Target,
    reconnect_attempts: u32,
    generation: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<ClientEvent>,
    status: watch::Sender<ConnectionStatus>,
}

impl ConnectionManager {
    pub fn new(
        endpoint: EndpointConfig,
        settings: ConnectionSettings,
        commands: mpsc::UnboundedReceiver<Command>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            target: Target::Primary,
            host: endpoint.primary_host.clone(),
            generation: 0,
            reconnect_attempts: 0,
            last_retry_delay: None,
            last_error: None,
            updated_ts_unix_ms: now_unix_ms(),
        });
        Self {
            dispatcher: Dispatcher::new(endpoint.failover_enabled()),
            registry: SubscriptionRegistry::new(endpoint.poll_rates),
            decoder: FrameDecoder::new(),
            target: Target::Primary,
            reconnect_attempts: 0,
            generation: 0,
            endpoint,
            settings,
            commands,
            events,
            status,
        }
    }

    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn active_host(&self) -> &str {
        match (self.target, self.endpoint.redundant_host.as_deref()) {
            (Target::Redundant, Some(host)) => host,
            _ => &self.endpoint.primary_host,
        }
    }

    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    fn set_state(&self, state: ConnectionState) {
        self.publish(state, |_| {});
    }

    fn publish<F>(&self, state: ConnectionState, extra: F)
    where
        F: FnOnce(&mut ConnectionStatus),
    {
        let host = self.active_host().to_string();
        let target = self.target;
        let generation = self.generation;
        let reconnect_attempts = self.reconnect_attempts;
        self.status.send_modify(|s| {
            s.state = state;
            s.target = target;
            s.host = host;
            s.generation = generation;
            s.reconnect_attempts = reconnect_attempts;
            s.updated_ts_unix_ms = now_unix_ms();
            extra(s);
        });
    }

    pub async fn run(mut self) {
        let mut pending_delay: Option<Duration> = None;
        loop {
            if let Some(delay) = pending_delay.take() {
                if let BackoffWait::Stop(ack) = self.wait_backoff(delay).await {
                    self.finish(ack);
                    return;
                }
            }

            let (cause, reached_live) = match self.run_session().await {
                (SessionEnd::Shutdown(ack), _) => {
                    self.finish(ack);
                    return;
                }
                (SessionEnd::Failed { cause, reason }, reached_live) => {
                    self.record_failure(cause, &reason);
                    (cause, reached_live)
                }
            };

            pending_delay = match recovery_for(self.endpoint.failover_enabled(), cause, reached_live) {
                Recovery::Reconnect => Some(self.schedule_reconnect()),
                Recovery::FailOver { immediate } => {
                    self.fail_over();
                    if immediate {
                        None
                    } else {
                        Some(self.schedule_reconnect())
                    }
                }
            };
        }
    }

    fn record_failure(&self, cause: FailureCause, reason: &str) {
        match cause {
            FailureCause::Transport => {
                if self.endpoint.log_connection_events {
                    tracing::warn!(host = %self.active_host(), error = %reason, "socket error");
                } else {
                    tracing::debug!(host = %self.active_host(), error = %reason, "socket error");
                }
            }
            FailureCause::IdleTimeout => {
                tracing::warn!(host = %self.active_host(), "socket timeout detected, destroying socket");
            }
            FailureCause::Closed | FailureCause::Standby => {
                connection_event!(
                    self.endpoint.log_connection_events,
                    host = %self.active_host(),
                    reason = %reason,
                    "socket closed"
                );
            }
        }
        let reason = reason.to_string();
        self.status.send_modify(|s| s.last_error = Some(reason));
    }

    fn schedule_reconnect(&mut self) -> Duration {
        let delay = backoff_delay(
            self.reconnect_attempts,
            self.settings.backoff_base,
            self.settings.backoff_cap,
        );
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        self.publish(ConnectionState::ReconnectScheduled, |s| {
            s.last_retry_delay = Some(delay)
        });
        connection_event!(
            self.endpoint.log_connection_events,
            host = %self.active_host(),
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        delay
    }

    fn fail_over(&mut self) {
        self.target = self.target.toggled();
        self.set_state(ConnectionState::FailingOver);
        tracing::info!(host = %self.active_host(), to = ?self.target, "switching to redundant host");
    }

    fn finish(&mut self, ack: ShutdownAck) {
        self.decoder.reset();
        self.set_state(ConnectionState::Disconnected);
        connection_event!(self.endpoint.log_connection_events, "client shut down");
        if let Some(done) = ack {
            let _ = done.send(());
        }
    }

    async fn wait_backoff(&mut self, delay: Duration) -> BackoffWait {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return BackoffWait::Elapsed,
                cmd = self.commands.recv() => match cmd {
                    None => return BackoffWait::Stop(None),
                    Some(Command::Shutdown { done, .. }) => return BackoffWait::Stop(Some(done)),
                    Some(other) => self.handle_offline_command(other),
                },
            }
        }
    }

    fn handle_offline_command(&mut self, command: Command) {
        match command {
            Command::Send(message) => {
                tracing::debug!(method = ?message.get("method"), "dropping command while disconnected");
            }
            Command::EnableAutoPoll(index) => {
                if self.registry.enable_auto_poll(index).is_some() {
                    tracing::debug!(group = index, "dropping auto poll request while disconnected");
                }
            }
            Command::Shutdown { .. } => {}
        }
    }

    // One socket from connect to teardown. The socket, its writer task and
    // both timers live in this future and are dropped with it.
    async fn run_session(&mut self) -> (SessionEnd, bool) {
        debug_assert!(self.state().may_connect());
        self.generation += 1;
        self.decoder.reset();
        let host = self.active_host().to_string();
        let span = tracing::info_span!("session", generation = self.generation, host = %host);
        self.session(host).instrument(span).await
    }

    async fn session(&mut self, host: String) -> (SessionEnd, bool) {
        self.set_state(ConnectionState::Connecting);
        if self.reconnect_attempts > 0 {
            connection_event!(
                self.endpoint.log_connection_events,
                attempt = self.reconnect_attempts,
                "attempting to reconnect"
            );
        }

        let connect = open_socket(host, self.endpoint.port, self.settings.tcp_keepalive);
        tokio::pin!(connect);
        let stream = loop {
            tokio::select! {
                res = &mut connect => match res {
                    Ok(stream) => break stream,
                    Err(err) => return (transport_failure(err), false),
                },
                cmd = self.commands.recv() => match cmd {
                    None => return (SessionEnd::Shutdown(None), false),
                    Some(Command::Shutdown { done, .. }) => return (SessionEnd::Shutdown(Some(done)), false),
                    Some(other) => self.handle_offline_command(other),
                },
            }
        };

        connection_event!(self.endpoint.log_connection_events, port = self.endpoint.port, "socket connected");
        let (mut reader, writer) = stream.into_split();
        let mut outbound = Outbound::spawn(writer);
        self.set_state(ConnectionState::AwaitingReady);
        let mut idle_deadline = Instant::now() + self.settings.idle_timeout;

        connection_event!(self.endpoint.log_connection_events, "socket ready");
        if let Some(creds) = &self.endpoint.credentials {
            let logon = logon_request(&creds.username, &creds.secret);
            self.set_state(ConnectionState::Authenticating);
            tracing::debug!(user = %creds.username, "sending logon");
            if let Err(err) = self.write_message(&outbound, &logon) {
                return (transport_failure(err), false);
            }
        }

        let period = self.settings.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.reconnect_attempts = 0;
        self.set_state(ConnectionState::Live);

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        connection_event!(self.endpoint.log_connection_events, "socket end");
                        return (failure(FailureCause::Closed, "peer closed the connection"), true);
                    }
                    Ok(n) => {
                        idle_deadline = Instant::now() + self.settings.idle_timeout;
                        if self.handle_inbound(&buf[..n]) {
                            return (failure(FailureCause::Standby, "engine reported standby"), true);
                        }
                    }
                    Err(err) => return (transport_failure(err), true),
                },
                written = outbound.finished() => {
                    return (transport_failure(written), true);
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    return (failure(FailureCause::IdleTimeout, "idle timeout"), true);
                }
                _ = keepalive.tick() => {
                    if let Err(err) = self.write_message(&outbound, &no_op_request()) {
                        return (transport_failure(err), true);
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    None => {
                        outbound.close(self.settings.idle_timeout).await;
                        return (SessionEnd::Shutdown(None), true);
                    }
                    Some(Command::Shutdown { forced, done }) => {
                        if !forced {
                            outbound.close(self.settings.idle_timeout).await;
                        }
                        return (SessionEnd::Shutdown(Some(done)), true);
                    }
                    Some(Command::Send(message)) => {
                        if let Err(err) = self.write_message(&outbound, &message) {
                            return (transport_failure(err), true);
                        }
                    }
                    Some(Command::EnableAutoPoll(index)) => {
                        if let Some(request) = self.registry.enable_auto_poll(index) {
                            tracing::debug!(group = %request.params.id, rate = request.params.rate, "enabling auto poll");
                            if let Err(err) = self.write_message(&outbound, &request) {
                                return (transport_failure(err), true);
                            }
                        }
                    }
                },
            }
        }
    }

    fn handle_inbound(&mut self, bytes: &[u8]) -> bool {
        if self.endpoint.log_wire_traffic {
            tracing::info!(target: WIRE_LOG_TARGET, "rx: {}", String::from_utf8_lossy(bytes));
        }
        for frame in self.decoder.feed(bytes) {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(error = %err, "dropping undecodable frame");
                    continue;
                }
            };
            let dispatched = match self.dispatcher.dispatch(frame) {
                Ok(events) => events,
                Err(err) => {
                    tracing::warn!(error = %err, "error processing data");
                    continue;
                }
            };
            for event in dispatched {
                match event {
                    DispatchEvent::Ready => {
                        tracing::debug!("engine active");
                        let _ = self.events.send(ClientEvent::Ready);
                    }
                    DispatchEvent::ChangeNotified(change) => {
                        let _ = self.events.send(ClientEvent::Change(change));
                    }
                    DispatchEvent::StandbyDetected => return true,
                }
            }
        }
        false
    }

    fn write_message<T: Serialize>(&self, outbound: &Outbound, message: &T) -> io::Result<()> {
        let bytes = match codec::encode(message) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = %err, "dropping unencodable message");
                return Ok(());
            }
        };
        if self.endpoint.log_wire_traffic {
            tracing::info!(
                target: WIRE_LOG_TARGET,
                "tx: {}",
                String::from_utf8_lossy(&bytes[..bytes.len() - 1])
            );
        }
        outbound.push(bytes)
    }
}

// Write side of one socket. Frames are written in order by a dedicated task
// so a peer that stops reading cannot stall the session loop. Dropping it
// aborts the task and with it the write half.
struct Outbound {
    frames: Option<mpsc::UnboundedSender<Vec<u8>>>,
    task: JoinHandle<io::Result<()>>,
}

impl Outbound {
    fn spawn(writer: OwnedWriteHalf) -> Self {
        let (frames, queue) = mpsc::unbounded_channel();
        Self {
            frames: Some(frames),
            task: tokio::spawn(write_frames(writer, queue)),
        }
    }

    fn push(&self, frame: Vec<u8>) -> io::Result<()> {
        self.frames
            .as_ref()
            .and_then(|frames| frames.send(frame).ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "writer stopped"))
    }

    // Resolves only when the writer stops on its own, which is always an error.
    async fn finished(&mut self) -> io::Error {
        match (&mut self.task).await {
            Ok(Err(err)) => err,
            Ok(Ok(())) => io::Error::new(io::ErrorKind::BrokenPipe, "writer stopped"),
            Err(err) => io::Error::new(io::ErrorKind::Other, err.to_string()),
        }
    }

    // Flushes queued frames and half-closes, giving up after `limit`.
    async fn close(mut self, limit: Duration) {
        self.frames = None;
        match tokio::time::timeout(limit, &mut self.task).await {
            Ok(Ok(Err(err))) => tracing::debug!(error = %err, "write failed during close"),
            Ok(_) => {}
            Err(_) => tracing::warn!("peer not draining writes, dropping socket"),
        }
    }
}

impl Drop for Outbound {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
) -> io::Result<()> {
    while let Some(frame) = queue.recv().await {
        writer.write_all(&frame).await?;
    }
    writer.shutdown().await
}

fn failure(cause: FailureCause, reason: &str) -> SessionEnd {
    SessionEnd::Failed {
        cause,
        reason: reason.to_string(),
    }
}

fn transport_failure(err: io::Error) -> SessionEnd {
    SessionEnd::Failed {
        cause: FailureCause::Transport,
        reason: err.to_string(),
    }
}

async fn open_socket(host: String, port: u16, tcp_keepalive: bool) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in lookup_host((host.as_str(), port)).await? {
        match connect_addr(addr, tcp_keepalive).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses resolved for {host}"),
        )
    }))
}

async fn connect_addr(addr: SocketAddr, tcp_keepalive: bool) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if tcp_keepalive {
        socket.set_keepalive(true)?;
    }
    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::{METHOD_LOGON, METHOD_NO_OP};
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    pub(crate) const WAIT: Duration = Duration::from_secs(5);

    pub(crate) fn fast_settings() -> ConnectionSettings {
        ConnectionSettings {
            idle_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(5),
            backoff_base: Duration::from_millis(20),
            backoff_cap: Duration::from_millis(200),
            tcp_keepalive: true,
        }
    }

    pub(crate) struct FakeEngine {
        stream: TcpStream,
        decoder: FrameDecoder,
        queue: VecDeque<Value>,
    }

    impl FakeEngine {
        pub(crate) async fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
            Self {
                stream,
                decoder: FrameDecoder::new(),
                queue: VecDeque::new(),
            }
        }

        pub(crate) async fn send(&mut self, message: Value) {
            let bytes = codec::encode(&message).unwrap();
            self.stream.write_all(&bytes).await.unwrap();
        }

        pub(crate) async fn next_frame(&mut self) -> Value {
            let mut buf = [0u8; 1024];
            loop {
                if let Some(frame) = self.queue.pop_front() {
                    return frame;
                }
                let n = timeout(WAIT, self.stream.read(&mut buf)).await.unwrap().unwrap();
                assert!(n > 0, "client closed before sending a frame");
                for frame in self.decoder.feed(&buf[..n]) {
                    self.queue.push_back(frame.unwrap());
                }
            }
        }

        pub(crate) async fn drain_until_closed(&mut self) -> Vec<Value> {
            let mut buf = [0u8; 1024];
            loop {
                let n = match timeout(WAIT, self.stream.read(&mut buf)).await.unwrap() {
                    Ok(n) => n,
                    Err(_) => 0,
                };
                if n == 0 {
                    return self.queue.drain(..).collect();
                }
                for frame in self.decoder.feed(&buf[..n]) {
                    self.queue.push_back(frame.unwrap());
                }
            }
        }
    }

    struct Harness {
        commands: mpsc::UnboundedSender<Command>,
        events: broadcast::Receiver<ClientEvent>,
        status: watch::Receiver<ConnectionStatus>,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn spawn(endpoint: EndpointConfig, settings: ConnectionSettings) -> Self {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = broadcast::channel(64);
            let manager = ConnectionManager::new(endpoint, settings, cmd_rx, event_tx);
            let status = manager.status_receiver();
            let task = tokio::spawn(manager.run());
            Self {
                commands: cmd_tx,
                events: event_rx,
                status,
                task,
            }
        }

        async fn wait_status<F>(&mut self, f: F) -> ConnectionStatus
        where
            F: FnMut(&ConnectionStatus) -> bool,
        {
            timeout(WAIT, self.status.wait_for(f))
                .await
                .unwrap()
                .unwrap()
                .clone()
        }

        async fn shutdown(self, forced: bool) {
            let (done_tx, done_rx) = oneshot::channel();
            self.commands
                .send(Command::Shutdown {
                    forced,
                    done: done_tx,
                })
                .unwrap();
            timeout(WAIT, done_rx).await.unwrap().unwrap();
            timeout(WAIT, self.task).await.unwrap().unwrap();
        }
    }

    async fn local_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn backoff_doubles_from_one_second_and_caps_at_thirty() {
        let settings = ConnectionSettings::default();
        let delays: Vec<u128> = (0..7)
            .map(|attempt| {
                backoff_delay(attempt, settings.backoff_base, settings.backoff_cap).as_millis()
            })
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(
            backoff_delay(u32::MAX, settings.backoff_base, settings.backoff_cap),
            settings.backoff_cap
        );
    }

    #[test]
    fn recovery_depends_on_cause_and_redundancy() {
        assert_eq!(
            recovery_for(false, FailureCause::Transport, true),
            Recovery::Reconnect
        );
        assert_eq!(
            recovery_for(true, FailureCause::Transport, true),
            Recovery::FailOver { immediate: true }
        );
        assert_eq!(
            recovery_for(true, FailureCause::Transport, false),
            Recovery::FailOver { immediate: false }
        );
        assert_eq!(
            recovery_for(true, FailureCause::Standby, true),
            Recovery::FailOver { immediate: true }
        );
        assert_eq!(
            recovery_for(true, FailureCause::Closed, true),
            Recovery::Reconnect
        );
        assert_eq!(
            recovery_for(true, FailureCause::IdleTimeout, true),
            Recovery::Reconnect
        );
    }

    #[test]
    fn connect_is_only_valid_from_idle_states() {
        assert!(ConnectionState::Disconnected.may_connect());
        assert!(ConnectionState::ReconnectScheduled.may_connect());
        assert!(ConnectionState::FailingOver.may_connect());
        assert!(!ConnectionState::Connecting.may_connect());
        assert!(!ConnectionState::Live.may_connect());
        assert!(!ConnectionState::Authenticating.may_connect());
    }

    #[test]
    fn active_host_follows_target() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(4);
        let endpoint = EndpointConfig::new("10.0.0.1", 1710).with_redundant_host("10.0.0.2");
        let mut manager = ConnectionManager::new(endpoint, fast_settings(), rx, events);
        assert_eq!(manager.active_host(), "10.0.0.1");
        manager.fail_over();
        assert_eq!(manager.active_host(), "10.0.0.2");
        assert_eq!(manager.state(), ConnectionState::FailingOver);
        manager.fail_over();
        assert_eq!(manager.active_host(), "10.0.0.1");
    }

    #[tokio::test]
    async fn logon_is_sent_before_anything_else_when_auth_enabled() {
        let (listener, port) = local_listener().await;
        let endpoint = EndpointConfig::new("127.0.0.1", port).with_credentials("operator", "s3cret");
        let mut harness = Harness::spawn(endpoint, fast_settings());

        let mut engine = FakeEngine::accept(&listener).await;
        let logon = engine.next_frame().await;
        assert_eq!(
            logon,
            json!({
                "jsonrpc": "2.0",
                "method": METHOD_LOGON,
                "params": {"User": "operator", "Password": "s3cret"}
            })
        );

        let status = harness
            .wait_status(|s| s.state == ConnectionState::Live)
            .await;
        assert_eq!(status.generation, 1);
        harness.shutdown(false).await;
    }

    #[tokio::test]
    async fn keepalive_sends_no_op_while_live() {
        let (listener, port) = local_listener().await;
        let settings = ConnectionSettings {
            keepalive_interval: Duration::from_millis(40),
            ..fast_settings()
        };
        let harness = Harness::spawn(EndpointConfig::new("127.0.0.1", port), settings);

        let mut engine = FakeEngine::accept(&listener).await;
        for _ in 0..3 {
            let frame = engine.next_frame().await;
            assert_eq!(frame, json!({"jsonrpc": "2.0", "method": METHOD_NO_OP, "params": {}}));
        }
        harness.shutdown(true).await;
    }

    #[tokio::test]
    async fn idle_socket_is_destroyed_and_reconnected() {
        let (listener, port) = local_listener().await;
        let settings = ConnectionSettings {
            idle_timeout: Duration::from_millis(150),
            ..fast_settings()
        };
        let mut harness = Harness::spawn(EndpointConfig::new("127.0.0.1", port), settings);

        let mut first = FakeEngine::accept(&listener).await;
        assert!(first.drain_until_closed().await.is_empty());

        let _second = FakeEngine::accept(&listener).await;
        let status = harness.wait_status(|s| s.generation >= 2).await;
        assert_eq!(status.last_error.as_deref(), Some("idle timeout"));
        assert_eq!(status.host, "127.0.0.1");
        harness.shutdown(true).await;
    }

    #[tokio::test]
    async fn inbound_traffic_resets_idle_timer() {
        let (listener, port) = local_listener().await;
        let settings = ConnectionSettings {
            idle_timeout: Duration::from_millis(300),
            ..fast_settings()
        };
        let harness = Harness::spawn(EndpointConfig::new("127.0.0.1", port), settings);

        let mut engine = FakeEngine::accept(&listener).await;
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            engine.send(json!({"jsonrpc": "2.0", "method": "Status"})).await;
        }
        assert_eq!(harness.status.borrow().generation, 1);
        assert_eq!(harness.status.borrow().state, ConnectionState::Live);
        harness.shutdown(true).await;
    }

    #[tokio::test]
    async fn counter_resets_after_reaching_live() {
        let (listener, port) = local_listener().await;
        let settings = fast_settings();
        let mut harness = Harness::spawn(EndpointConfig::new("127.0.0.1", port), settings);

        drop(FakeEngine::accept(&listener).await);
        let _second = FakeEngine::accept(&listener).await;
        let status = harness.wait_status(|s| s.generation == 2).await;
        assert_eq!(status.last_retry_delay, Some(settings.backoff_base));

        drop(_second);
        let _third = FakeEngine::accept(&listener).await;
        let status = harness.wait_status(|s| s.generation == 3).await;
        assert_eq!(status.last_retry_delay, Some(settings.backoff_base));
        harness.shutdown(true).await;
    }

    #[tokio::test]
    async fn refused_connections_back_off_exponentially() {
        let (listener, port) = local_listener().await;
        drop(listener);
        let settings = fast_settings();
        let mut harness = Harness::spawn(EndpointConfig::new("127.0.0.1", port), settings);

        let status = harness.wait_status(|s| s.reconnect_attempts >= 3).await;
        assert_eq!(
            status.last_retry_delay,
            Some(backoff_delay(
                status.reconnect_attempts - 1,
                settings.backoff_base,
                settings.backoff_cap
            ))
        );
        assert!(status.last_retry_delay.unwrap() >= settings.backoff_base * 4);
        harness.shutdown(true).await;
    }

    #[tokio::test]
    async fn standby_notification_fails_over_to_redundant_host() {
        let (listener, port) = local_listener().await;
        let endpoint = EndpointConfig::new("127.0.0.1", port).with_redundant_host("localhost");
        let mut harness = Harness::spawn(endpoint, fast_settings());

        let mut primary = FakeEngine::accept(&listener).await;
        primary
            .send(json!({"jsonrpc": "2.0", "method": "EngineStatus", "params": {"State": "Standby"}}))
            .await;
        primary.drain_until_closed().await;

        let _redundant = FakeEngine::accept(&listener).await;
        let status = harness
            .wait_status(|s| s.generation == 2 && s.state == ConnectionState::Live)
            .await;
        assert_eq!(status.target, Target::Redundant);
        assert_eq!(status.host, "localhost");
        assert_eq!(status.last_retry_delay, None);
        assert_eq!(status.last_error.as_deref(), Some("engine reported standby"));
        harness.shutdown(true).await;
    }

    #[tokio::test]
    async fn standby_without_redundancy_keeps_connection() {
        let (listener, port) = local_listener().await;
        let mut harness = Harness::spawn(EndpointConfig::new("127.0.0.1", port), fast_settings());

        let mut engine = FakeEngine::accept(&listener).await;
        engine
            .send(json!({"method": "EngineStatus", "params": {"State": "Standby"}}))
            .await;
        engine
            .send(json!({"method": "EngineStatus", "params": {"State": "Active"}}))
            .await;
        let event = timeout(WAIT, harness.events.recv()).await.unwrap().unwrap();
        assert_eq!(event, ClientEvent::Ready);
        assert_eq!(harness.status.borrow().generation, 1);
        harness.shutdown(true).await;
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_reconnect() {
        let (listener, port) = local_listener().await;
        let settings = ConnectionSettings {
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(2),
            ..fast_settings()
        };
        let mut harness = Harness::spawn(EndpointConfig::new("127.0.0.1", port), settings);

        drop(FakeEngine::accept(&listener).await);
        harness
            .wait_status(|s| s.state == ConnectionState::ReconnectScheduled)
            .await;

        let status = harness.status.clone();
        harness.shutdown(false).await;
        assert_eq!(status.borrow().state, ConnectionState::Disconnected);
        assert!(
            timeout(Duration::from_millis(2500), listener.accept())
                .await
                .is_err(),
            "no reconnect may follow a shutdown"
        );
    }

    #[tokio::test]
    async fn graceful_shutdown_half_closes_socket() {
        let (listener, port) = local_listener().await;
        let mut harness = Harness::spawn(EndpointConfig::new("127.0.0.1", port), fast_settings());

        let mut engine = FakeEngine::accept(&listener).await;
        harness
            .wait_status(|s| s.state == ConnectionState::Live)
            .await;
        harness.shutdown(false).await;
        assert!(engine.drain_until_closed().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_frame_does_not_reset_connection() {
        let (listener, port) = local_listener().await;
        let mut harness = Harness::spawn(EndpointConfig::new("127.0.0.1", port), fast_settings());

        let mut engine = FakeEngine::accept(&listener).await;
        engine.stream.write_all(b"{not json\0").await.unwrap();
        engine
            .send(json!({"method": "ChangeGroup.Poll", "params": {"Changes": [{"Name": "x"}]}}))
            .await;

        let event = timeout(WAIT, harness.events.recv()).await.unwrap().unwrap();
        assert_eq!(event, ClientEvent::Change(json!({"Name": "x"})));
        assert_eq!(harness.status.borrow().generation, 1);
        harness.shutdown(true).await;
    }

    fn bulk_command() -> Command {
        Command::Send(json!({
            "method": "Control.Set",
            "params": {"Name": "bulk", "Value": "x".repeat(4 * 1024 * 1024)}
        }))
    }

    #[tokio::test]
    async fn idle_timeout_fires_while_peer_stops_reading() {
        let (listener, port) = local_listener().await;
        let settings = ConnectionSettings {
            idle_timeout: Duration::from_millis(500),
            ..fast_settings()
        };
        let mut harness = Harness::spawn(EndpointConfig::new("127.0.0.1", port), settings);

        let _stalled = FakeEngine::accept(&listener).await;
        harness
            .wait_status(|s| s.state == ConnectionState::Live)
            .await;
        for _ in 0..8 {
            harness.commands.send(bulk_command()).unwrap();
        }

        let _second = FakeEngine::accept(&listener).await;
        let status = harness
            .wait_status(|s| s.generation == 2 && s.state == ConnectionState::Live)
            .await;
        assert_eq!(status.last_error.as_deref(), Some("idle timeout"));
        timeout(Duration::from_secs(2), harness.shutdown(true))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn forced_shutdown_completes_while_writes_are_blocked() {
        let (listener, port) = local_listener().await;
        let mut harness = Harness::spawn(EndpointConfig::new("127.0.0.1", port), fast_settings());

        let _stalled = FakeEngine::accept(&listener).await;
        harness
            .wait_status(|s| s.state == ConnectionState::Live)
            .await;
        for _ in 0..8 {
            harness.commands.send(bulk_command()).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(harness.status.borrow().generation, 1);

        let status = harness.status.clone();
        timeout(Duration::from_secs(2), harness.shutdown(true))
            .await
            .unwrap();
        assert_eq!(status.borrow().state, ConnectionState::Disconnected);
    }

    // 127.0.0.2 is on loopback but nothing listens there, so the connect is refused.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn refused_primary_fails_over_after_backoff() {
        let (listener, port) = local_listener().await;
        let settings = fast_settings();
        let endpoint = EndpointConfig::new("127.0.0.2", port).with_redundant_host("127.0.0.1");
        let mut harness = Harness::spawn(endpoint, settings);

        let _redundant = FakeEngine::accept(&listener).await;
        let status = harness
            .wait_status(|s| s.generation == 2 && s.state == ConnectionState::Live)
            .await;
        assert_eq!(status.target, Target::Redundant);
        assert_eq!(status.host, "127.0.0.1");
        assert_eq!(status.last_retry_delay, Some(settings.backoff_base));
        assert_eq!(status.reconnect_attempts, 0);
        assert!(status.last_error.is_some());
        harness.shutdown(true).await;
    }

    #[tokio::test]
    async fn reset_of_live_primary_fails_over_immediately() {
        let (listener, port) = local_listener().await;
        let endpoint = EndpointConfig::new("127.0.0.1", port).with_redundant_host("localhost");
        let mut harness = Harness::spawn(endpoint, fast_settings());

        let primary = FakeEngine::accept(&listener).await;
        harness
            .wait_status(|s| s.state == ConnectionState::Live)
            .await;
        primary.stream.set_linger(Some(Duration::ZERO)).unwrap();
        drop(primary);

        let _redundant = FakeEngine::accept(&listener).await;
        let status = harness
            .wait_status(|s| s.generation == 2 && s.state == ConnectionState::Live)
            .await;
        assert_eq!(status.target, Target::Redundant);
        assert_eq!(status.host, "localhost");
        assert_eq!(status.last_retry_delay, None);
        harness.shutdown(true).await;
    }

    #[test]
    fn frames_after_standby_in_same_chunk_are_not_dispatched() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let (events, mut received) = broadcast::channel(8);
        let endpoint = EndpointConfig::new("10.0.0.1", 1710).with_redundant_host("10.0.0.2");
        let mut manager = ConnectionManager::new(endpoint, fast_settings(), rx, events);

        let mut chunk = codec::encode(&json!({
            "method": "EngineStatus",
            "params": {"State": "Standby"}
        }))
        .unwrap();
        chunk.extend(codec::encode(&json!({"method": "EngineStatus", "params": {"State": "Active"}})).unwrap());
        chunk.extend(
            codec::encode(&json!({"method": "ChangeGroup.Poll", "params": {"Changes": [1]}})).unwrap(),
        );

        assert!(manager.handle_inbound(&chunk));
        assert!(received.try_recv().is_err());
    }
}
