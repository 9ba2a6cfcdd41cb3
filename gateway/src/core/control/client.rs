//! Long-lived AMI session.
//!
//! A single background task owns the TCP connection. It authenticates,
//! forwards classified events to the engine, multiplexes action responses back
//! to their callers by `ActionID`, and reconnects with backoff when the
//! connection drops. Reconnection never stops; after
//! `alarm_after_attempts` consecutive failures the outage is raised as an
//! alarm on the log stream and in [`SessionStatus`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{self, AmiCodec, AmiFrame, AmiMessage, DialTarget};
use super::{CallControl, EventKind, OriginateRequest, PeerEvent, ReconnectPolicy, SessionStatus};
use crate::core::model::CorrelationId;
use crate::errors::{CallError, CallResult};
use crate::utils::Secret;

type AmiStream = Framed<TcpStream, AmiCodec>;

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);
const LOGIN_ACTION_ID: &str = "login";
/// Longest a parked hangup waits for its channel to appear
const PENDING_HANGUP_TTL: Duration = Duration::from_secs(120);
/// Channel names older than this belong to calls that are long gone
const CHANNEL_NAME_TTL: Duration = Duration::from_secs(4 * 60 * 60);

/// Dial plan coordinates for originated calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialPlan {
    pub technology: String,
    pub trunk: String,
    pub context: String,
    pub exten: String,
    pub priority: u32,
}

impl Default for DialPlan {
    fn default() -> Self {
        Self {
            technology: "SIP".to_string(),
            trunk: "trunk_main".to_string(),
            context: "outbound-playback".to_string(),
            exten: "s".to_string(),
            priority: 1,
        }
    }
}

impl DialPlan {
    fn target(&self) -> DialTarget<'_> {
        DialTarget {
            technology: &self.technology,
            trunk: &self.trunk,
            context: &self.context,
            exten: &self.exten,
            priority: self.priority,
        }
    }
}

/// Connection settings for the manager interface.
#[derive(Clone)]
pub struct AmiClientConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: Secret,
    pub connect_timeout: Duration,
    /// How long to wait for the response to an action
    pub action_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub dial_plan: DialPlan,
}

impl std::fmt::Debug for AmiClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &self.secret)
            .field("action_timeout", &self.action_timeout)
            .finish()
    }
}

enum SessionCommand {
    Action {
        message: AmiMessage,
        reply: oneshot::Sender<CallResult<AmiMessage>>,
    },
    Hangup {
        correlation_id: CorrelationId,
    },
}

struct PendingAction {
    reply: oneshot::Sender<CallResult<AmiMessage>>,
    sent_at: Instant,
}

/// Channel names learned from `Newchannel`; survives reconnects so that calls
/// orphaned by a dropped session can still be hung up afterwards. Both maps
/// are bounded by age.
#[derive(Default)]
struct ChannelTable {
    names: HashMap<CorrelationId, (String, Instant)>,
    pending_hangups: HashMap<CorrelationId, Instant>,
}

impl ChannelTable {
    fn learn(&mut self, correlation_id: CorrelationId, channel: &str, now: Instant) {
        self.names.insert(correlation_id, (channel.to_string(), now));
    }

    fn channel(&self, correlation_id: &CorrelationId) -> Option<String> {
        self.names.get(correlation_id).map(|(name, _)| name.clone())
    }

    /// Keeps the time of the first request so retries do not extend the wait.
    fn park_hangup(&mut self, correlation_id: CorrelationId, now: Instant) {
        self.pending_hangups.entry(correlation_id).or_insert(now);
    }

    fn is_parked(&self, correlation_id: &CorrelationId) -> bool {
        self.pending_hangups.contains_key(correlation_id)
    }

    fn parked(&self) -> Vec<CorrelationId> {
        self.pending_hangups.keys().copied().collect()
    }

    /// The call ended, or will never get a channel.
    fn forget(&mut self, correlation_id: &CorrelationId) {
        self.names.remove(correlation_id);
        self.pending_hangups.remove(correlation_id);
    }

    /// Drop parked hangups and channel names past their age limit.
    fn prune(&mut self, now: Instant) -> usize {
        let before = self.names.len() + self.pending_hangups.len();
        self.names
            .retain(|_, (_, learned)| now.saturating_duration_since(*learned) < CHANNEL_NAME_TTL);
        self.pending_hangups
            .retain(|_, parked| now.saturating_duration_since(*parked) < PENDING_HANGUP_TTL);
        before - self.names.len() - self.pending_hangups.len()
    }
}

/// Handle to the session task.
pub struct AmiClient {
    commands: mpsc::Sender<SessionCommand>,
    status: Arc<RwLock<SessionStatus>>,
    dial_plan: DialPlan,
    action_timeout: Duration,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AmiClient {
    /// Start the session task. Events are delivered to `events` in arrival order.
    pub fn spawn(config: AmiClientConfig, events: mpsc::Sender<PeerEvent>) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let status = Arc::new(RwLock::new(SessionStatus::default()));
        let shutdown = CancellationToken::new();

        let dial_plan = config.dial_plan.clone();
        let action_timeout = config.action_timeout;

        let session = Session {
            config,
            commands: commands_rx,
            events,
            status: status.clone(),
            shutdown: shutdown.clone(),
            channels: ChannelTable::default(),
            next_action: AtomicU64::new(1),
        };
        let task = tokio::spawn(session.run());

        Self {
            commands: commands_tx,
            status,
            dial_plan,
            action_timeout,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Log off and stop reconnecting.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn send_action(&self, message: AmiMessage) -> CallResult<AmiMessage> {
        let description = message.get("Action").unwrap_or("action").to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Action {
                message,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CallError::NotConnected)?;

        match timeout(self.action_timeout + SWEEP_INTERVAL, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::ConnectionLost),
            Err(_) => Err(CallError::ActionTimeout(description)),
        }
    }
}

#[async_trait]
impl CallControl for AmiClient {
    async fn originate(&self, request: OriginateRequest) -> CallResult<CorrelationId> {
        if !self.status.read().connected {
            return Err(CallError::NotConnected);
        }
        let message = protocol::originate(&request, &self.dial_plan.target());
        let response = self.send_action(message).await?;

        if response.is_success() {
            Ok(request.correlation_id)
        } else {
            let reason = response.message().unwrap_or("originate refused").to_string();
            Err(CallError::OriginateRejected {
                reason,
                transient: false,
            })
        }
    }

    async fn hangup(&self, correlation_id: CorrelationId) -> CallResult<()> {
        self.commands
            .send(SessionCommand::Hangup { correlation_id })
            .await
            .map_err(|_| CallError::NotConnected)
    }

    fn status(&self) -> SessionStatus {
        *self.status.read()
    }
}

// =============================================================================
// Session task
// =============================================================================

async fn read_login_response(stream: &mut AmiStream) -> CallResult<AmiMessage> {
    while let Some(frame) = stream.next().await {
        match frame? {
            AmiFrame::Banner(banner) => debug!("Peer banner: {}", banner),
            AmiFrame::Message(msg) if msg.action_id() == Some(LOGIN_ACTION_ID) => return Ok(msg),
            AmiFrame::Message(_) => {}
        }
    }
    Err(CallError::ConnectionLost)
}

struct Session {
    config: AmiClientConfig,
    commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Sender<PeerEvent>,
    status: Arc<RwLock<SessionStatus>>,
    shutdown: CancellationToken,
    channels: ChannelTable,
    next_action: AtomicU64,
}

/// Why a connected session ended.
enum SessionEnd {
    Shutdown,
    Disconnected(String),
}

impl Session {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.connect().await {
                Ok(stream) => {
                    attempt = 0;
                    {
                        let mut status = self.status.write();
                        status.connected = true;
                        status.alarm = false;
                        status.reconnect_attempts = 0;
                    }
                    info!(
                        "Connected to call-control peer at {}:{}",
                        self.config.host, self.config.port
                    );
                    if self.events.send(PeerEvent::Connected).await.is_err() {
                        break;
                    }

                    let end = self.drive(stream).await;
                    self.status.write().connected = false;
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Disconnected(reason) => {
                            warn!("Call-control session lost: {}", reason);
                            if self.events.send(PeerEvent::ConnectionLost).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to connect to call-control peer: {}", e);
                }
            }

            attempt = attempt.saturating_add(1);
            let alarm = self.config.reconnect.should_alarm(attempt);
            {
                let mut status = self.status.write();
                status.reconnect_attempts = attempt;
                status.alarm = alarm;
            }
            if alarm {
                error!(
                    alarm = true,
                    attempts = attempt,
                    "Call-control peer unreachable after {} attempts, still retrying",
                    attempt
                );
            }

            let delay = self.config.reconnect.delay(attempt);
            debug!("Reconnecting in {:?} (attempt {})", delay, attempt);
            if !self.wait_disconnected(delay).await {
                break;
            }
        }

        info!("Call-control session stopped");
    }

    /// Sleep out the backoff while refusing commands. Returns false on shutdown.
    async fn wait_disconnected(&mut self, delay: Duration) -> bool {
        let deadline = sleep(delay);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = &mut deadline => return true,
                command = self.commands.recv() => match command {
                    None => return false,
                    Some(SessionCommand::Action { reply, .. }) => {
                        let _ = reply.send(Err(CallError::NotConnected));
                    }
                    Some(SessionCommand::Hangup { correlation_id }) => {
                        // Retried once the session is back
                        self.channels.park_hangup(correlation_id, Instant::now());
                    }
                },
            }
        }
    }

    async fn connect(&mut self) -> CallResult<AmiStream> {
        let address = format!("{}:{}", self.config.host, self.config.port);
        let tcp = timeout(self.config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| CallError::ActionTimeout(format!("connect to {address}")))??;
        let _ = tcp.set_nodelay(true);

        let mut stream = Framed::new(tcp, AmiCodec::new());
        let login = protocol::login(
            LOGIN_ACTION_ID,
            &self.config.username,
            self.config.secret.expose(),
        );
        stream.send(login).await?;

        let response = timeout(self.config.action_timeout, read_login_response(&mut stream))
            .await
            .map_err(|_| CallError::ActionTimeout("login".to_string()))??;

        if !response.is_success() {
            let reason = response.message().unwrap_or("rejected").to_string();
            return Err(CallError::AuthenticationFailed(reason));
        }
        Ok(stream)
    }

    fn next_action_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_action.fetch_add(1, Ordering::Relaxed))
    }

    async fn drive(&mut self, mut stream: AmiStream) -> SessionEnd {
        let mut pending: HashMap<String, PendingAction> = HashMap::new();
        let mut keepalive = interval(KEEPALIVE_INTERVAL);
        let mut sweep = interval(SWEEP_INTERVAL);

        // Hangups that could not be delivered while disconnected
        self.prune_channels();
        for correlation_id in self.channels.parked() {
            if let Err(e) = self.send_hangup(&mut stream, correlation_id).await {
                return SessionEnd::Disconnected(e.to_string());
            }
        }

        let end = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = stream.send(protocol::logoff("logoff")).await;
                    break SessionEnd::Shutdown;
                }

                command = self.commands.recv() => match command {
                    None => break SessionEnd::Shutdown,
                    Some(SessionCommand::Action { message, reply }) => {
                        let action_id = message.action_id().unwrap_or_default().to_string();
                        if let Err(e) = stream.send(message).await {
                            let _ = reply.send(Err(CallError::ConnectionLost));
                            break SessionEnd::Disconnected(e.to_string());
                        }
                        pending.insert(action_id, PendingAction { reply, sent_at: Instant::now() });
                    }
                    Some(SessionCommand::Hangup { correlation_id }) => {
                        if let Err(e) = self.send_hangup(&mut stream, correlation_id).await {
                            break SessionEnd::Disconnected(e.to_string());
                        }
                    }
                },

                frame = stream.next() => match frame {
                    None => break SessionEnd::Disconnected("peer closed the connection".to_string()),
                    Some(Err(e)) => break SessionEnd::Disconnected(e.to_string()),
                    Some(Ok(AmiFrame::Banner(_))) => {}
                    Some(Ok(AmiFrame::Message(message))) => {
                        if message.is_response() {
                            let action_id = message.action_id().unwrap_or_default().to_string();
                            if let Some(action) = pending.remove(&action_id) {
                                let _ = action.reply.send(Ok(message));
                            }
                            continue;
                        }
                        if let Err(e) = self.on_event(&mut stream, message).await {
                            break SessionEnd::Disconnected(e.to_string());
                        }
                    }
                },

                _ = keepalive.tick() => {
                    let ping = protocol::ping(&self.next_action_id("ping"));
                    if let Err(e) = stream.send(ping).await {
                        break SessionEnd::Disconnected(e.to_string());
                    }
                }

                _ = sweep.tick() => {
                    self.prune_channels();
                    let limit = self.config.action_timeout;
                    let expired: Vec<String> = pending
                        .iter()
                        .filter(|(_, action)| action.sent_at.elapsed() >= limit)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for action_id in expired {
                        if let Some(action) = pending.remove(&action_id) {
                            let _ = action
                                .reply
                                .send(Err(CallError::ActionTimeout(action_id.clone())));
                        }
                    }
                }
            }
        };

        for (_, action) in pending.drain() {
            let _ = action.reply.send(Err(CallError::ConnectionLost));
        }
        end
    }

    async fn on_event(&mut self, stream: &mut AmiStream, message: AmiMessage) -> CallResult<()> {
        let Some((correlation_id, kind)) = protocol::classify_event(&message) else {
            return Ok(());
        };

        match &kind {
            EventKind::Progressing => {
                if let Some(channel) = message.get("Channel") {
                    self.channels.learn(correlation_id, channel, Instant::now());
                }
                if self.channels.is_parked(&correlation_id) {
                    self.send_hangup(stream, correlation_id).await?;
                }
            }
            EventKind::Hangup { .. } | EventKind::OriginateFailed { .. } => {
                self.channels.forget(&correlation_id);
            }
            _ => {}
        }

        if self
            .events
            .send(PeerEvent::Call {
                correlation_id,
                kind,
            })
            .await
            .is_err()
        {
            debug!("Event receiver dropped, discarding event for {}", correlation_id);
        }
        Ok(())
    }

    fn prune_channels(&mut self) {
        let dropped = self.channels.prune(Instant::now());
        if dropped > 0 {
            debug!(dropped, "Dropped stale channel entries");
        }
    }

    /// Hang up by channel name, or park the request until the channel shows up.
    /// Once the hangup is on the wire the channel entry is no longer needed.
    async fn send_hangup(
        &mut self,
        stream: &mut AmiStream,
        correlation_id: CorrelationId,
    ) -> CallResult<()> {
        let Some(channel) = self.channels.channel(&correlation_id) else {
            debug!("Channel for {} not known yet, deferring hangup", correlation_id);
            self.channels.park_hangup(correlation_id, Instant::now());
            return Ok(());
        };

        debug!("Hanging up {} ({})", correlation_id, channel);
        let action_id = self.next_action_id("hangup");
        stream.send(protocol::hangup(&action_id, &channel)).await?;
        self.channels.forget(&correlation_id);
        Ok(())
    }
}
