//! Per-shard gateway session state machine.
//!
//! One background task owns one shard's connection lifecycle end to
//! end: connect, wait for hello, identify (paced) or resume, then
//! stream dispatches while heartbeating. The task reconnects on its own
//! after transient failures and only exits on cancellation or a fatal
//! error.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::close::{CloseAction, CloseCode, ClosePolicy};
use super::compression::{self, DecompressError, Inflater};
use super::error::SessionError;
use super::event::Event;
use super::intents::Intents;
use super::pacer::IdentifyPacer;
use super::payload::{self, Hello, ParsePayloadError, Payload, Ready};
use crate::backoff::Backoff;

pub(crate) type WebsocketClient =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// payloads a connection may send per rolling window
const SEND_LIMIT: u32 = 120;
const SEND_WINDOW: Duration = Duration::from_secs(60);

/// Connection lifecycle of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// no transport
    Disconnected,
    /// opening the websocket
    Connecting,
    /// waiting for the server hello
    AwaitingHello,
    /// waiting for an identify slot or for the ready dispatch
    Identifying,
    /// resume sent, waiting for the replay
    Resuming,
    /// live and heartbeating
    Ready,
    /// waiting out reconnect backoff
    Reconnecting,
    /// shutting down on request
    Closing,
}

/// Commands a running shard accepts while [`SessionState::Ready`].
#[derive(Debug)]
pub(crate) enum Command {
    UpdatePresence {
        status: String,
        activity: Option<(String, u8)>,
    },
    UpdateVoiceState {
        guild_id: u64,
        channel_id: Option<u64>,
        self_mute: bool,
        self_deaf: bool,
    },
    RequestGuildMembers {
        guild_id: u64,
        query: Option<String>,
        limit: u32,
        presences: bool,
        user_ids: Vec<u64>,
        nonce: Option<String>,
    },
    RequestSoundboardSounds {
        guild_ids: Vec<u64>,
    },
}

/// Settings shared by every shard of one client.
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub token: String,
    pub intents: Intents,
    pub large_threshold: Option<u32>,
    pub transport_compression: bool,
    pub payload_compression: bool,
    pub close_policy: ClosePolicy,
    pub hello_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

/// Channel ends wired up by the client facade.
#[derive(Debug)]
pub(crate) struct SessionChannels {
    pub events: mpsc::Sender<Result<Event, SessionError>>,
    pub state: watch::Sender<SessionState>,
    pub commands: mpsc::Receiver<Command>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
struct ResumeState {
    session_id: String,
    resume_url: Option<String>,
}

enum Flow {
    Reconnect,
    Fatal(SessionError),
    Shutdown,
}

#[derive(Debug)]
pub(crate) struct Session {
    config: Arc<SessionConfig>,
    shard: Option<(u32, u32)>,
    shard_id: u32,
    gateway_url: String,
    pacer: Arc<IdentifyPacer>,
    events: mpsc::Sender<Result<Event, SessionError>>,
    state_tx: watch::Sender<SessionState>,
    commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,

    state: SessionState,
    resume: Option<ResumeState>,
    sequence: Option<u64>,
    backoff: Backoff,
    send_window: SendWindow,
}

impl Session {
    pub fn new(
        config: Arc<SessionConfig>,
        shard: Option<(u32, u32)>,
        gateway_url: String,
        pacer: Arc<IdentifyPacer>,
        channels: SessionChannels,
    ) -> Self {
        let shard_id = shard.map_or(0, |(id, _)| id);
        let backoff = Backoff::new(config.backoff_base, config.backoff_max);

        Self {
            config,
            shard,
            shard_id,
            gateway_url,
            pacer,
            events: channels.events,
            state_tx: channels.state,
            commands: channels.commands,
            cancel: channels.cancel,
            state: SessionState::Disconnected,
            resume: None,
            sequence: None,
            backoff,
            send_window: SendWindow::new(),
        }
    }

    pub async fn run(mut self) {
        log::debug!("Shard {} session task start", self.shard_id);

        loop {
            match self.connect_and_stream().await {
                Flow::Shutdown => {
                    self.set_state(SessionState::Closing);
                    self.set_state(SessionState::Disconnected);
                    log::info!("Shard {} stopped", self.shard_id);
                    return;
                }
                Flow::Fatal(err) => {
                    self.clear_session();
                    self.set_state(SessionState::Disconnected);
                    log::warn!("Shard {} failed: {}", self.shard_id, err);
                    let _ = self.events.send(Err(err)).await;
                    return;
                }
                Flow::Reconnect => {
                    self.set_state(SessionState::Reconnecting);
                    let delay = self.backoff.next_delay();
                    log::info!(
                        "Shard {} reconnecting in {:?} (attempt {})",
                        self.shard_id,
                        delay,
                        self.backoff.attempt()
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.set_state(SessionState::Disconnected);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn connect_and_stream(&mut self) -> Flow {
        self.set_state(SessionState::Connecting);

        let url = match self.connect_url() {
            Ok(url) => url,
            Err(err) => return Flow::Fatal(err),
        };

        log::debug!("Shard {} connecting {}", self.shard_id, url);

        let ws = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => return Flow::Shutdown,

            result = tokio_tungstenite::connect_async(url.as_str()) => match result {
                Ok((ws, _)) => ws,
                Err(err) => {
                    log::warn!("Shard {} connect failed: {}", self.shard_id, err);
                    return Flow::Reconnect;
                }
            }
        };

        let mut conn = Connection::new(
            ws,
            self.config.transport_compression,
            self.config.payload_compression,
        );

        self.set_state(SessionState::AwaitingHello);
        let hello = match self.wait_hello(&mut conn).await {
            Ok(hello) => hello,
            Err(flow) => return flow,
        };

        let interval = Duration::from_millis(hello.heartbeat_interval);
        // the first heartbeat lands at a random fraction of the interval
        // so a fleet of shards does not beat in unison
        let fraction = rand::thread_rng().gen_range(0.0..1.0);
        let mut next_heartbeat = Instant::now() + interval.mul_f64(fraction);
        let mut inflight = false;

        match (self.resume.clone(), self.sequence) {
            (Some(resume), Some(seq)) => {
                self.set_state(SessionState::Resuming);
                log::debug!(
                    "Shard {} resuming session {} from seq {}",
                    self.shard_id,
                    resume.session_id,
                    seq
                );

                let payload = payload::resume(&self.config.token, &resume.session_id, seq);
                if let Err(err) = conn.send(payload).await {
                    log::warn!("Shard {} resume send failed: {}", self.shard_id, err);
                    return Flow::Reconnect;
                }
            }
            _ => {
                self.set_state(SessionState::Identifying);

                let granted = tokio::select! {
                    biased;

                    _ = self.cancel.cancelled() => {
                        conn.close().await;
                        return Flow::Shutdown;
                    }

                    result = self.pacer.acquire(self.shard_id) => result,
                };
                if let Err(source) = granted {
                    return Flow::Fatal(SessionError::IdentifyBudget { source });
                }

                let payload = payload::identify(&payload::IdentifyFields {
                    token: &self.config.token,
                    intents: self.config.intents,
                    shard: self.shard,
                    large_threshold: self.config.large_threshold,
                    compress: self.config.payload_compression,
                });
                if let Err(err) = conn.send(payload).await {
                    log::warn!("Shard {} identify send failed: {}", self.shard_id, err);
                    return Flow::Reconnect;
                }
            }
        }

        let mut outbox: VecDeque<String> = VecDeque::new();
        let mut commands_open = true;

        loop {
            // drain whatever the send window allows
            while !outbox.is_empty() && self.send_window.try_acquire(Instant::now()) {
                if let Some(queued) = outbox.pop_front() {
                    if let Err(err) = conn.send(queued).await {
                        log::warn!("Shard {} command send failed: {}", self.shard_id, err);
                        return Flow::Reconnect;
                    }
                }
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    conn.close().await;
                    return Flow::Shutdown;
                }

                _ = tokio::time::sleep_until(next_heartbeat) => {
                    if inflight {
                        // the previous heartbeat was never acknowledged
                        log::warn!(
                            "Shard {} heartbeat not acknowledged, closing zombie connection",
                            self.shard_id
                        );
                        conn.close().await;
                        return Flow::Reconnect;
                    }

                    log::trace!("Shard {} heartbeat seq {:?}", self.shard_id, self.sequence);
                    if let Err(err) = conn.send(payload::heartbeat(self.sequence)).await {
                        log::warn!("Shard {} heartbeat send failed: {}", self.shard_id, err);
                        return Flow::Reconnect;
                    }

                    inflight = true;
                    next_heartbeat += interval;
                }

                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => {
                        if self.state == SessionState::Ready {
                            outbox.push_back(command_payload(command));
                        } else {
                            log::warn!(
                                "Shard {} dropped a command while not ready",
                                self.shard_id
                            );
                        }
                    }
                    None => commands_open = false,
                },

                _ = tokio::time::sleep_until(self.send_window.window_end()),
                    if !outbox.is_empty() => {}

                frame = conn.next_payload() => match frame {
                    Ok(Some(Payload::Dispatch { name, seq, data })) => {
                        if let Some(seq) = seq {
                            // replayed or duplicated dispatches arrive with
                            // non-increasing sequence numbers; drop them
                            if self.sequence.is_some_and(|current| seq <= current) {
                                log::trace!(
                                    "Shard {} dropped duplicate dispatch {} (seq {})",
                                    self.shard_id,
                                    name,
                                    seq
                                );
                                continue;
                            }
                            self.sequence = Some(seq);
                        }

                        match name.as_str() {
                            "READY" => match serde_json::from_value::<Ready>(data.clone()) {
                                Ok(ready) => {
                                    log::info!(
                                        "Shard {} ready, session {}",
                                        self.shard_id,
                                        ready.session_id
                                    );
                                    self.resume = Some(ResumeState {
                                        session_id: ready.session_id,
                                        resume_url: ready.resume_gateway_url,
                                    });
                                    self.backoff.reset();
                                    self.set_state(SessionState::Ready);
                                }
                                Err(err) => {
                                    log::warn!(
                                        "Shard {} received malformed ready: {}",
                                        self.shard_id,
                                        err
                                    );
                                    conn.close().await;
                                    return Flow::Reconnect;
                                }
                            },
                            "RESUMED" => {
                                log::info!(
                                    "Shard {} resumed at seq {:?}",
                                    self.shard_id,
                                    self.sequence
                                );
                                self.backoff.reset();
                                self.set_state(SessionState::Ready);
                            }
                            _ => {}
                        }

                        let event = Event {
                            shard_id: self.shard_id,
                            name,
                            seq,
                            data,
                        };
                        if self.events.send(Ok(event)).await.is_err() {
                            log::debug!(
                                "Shard {} event receiver dropped, stop",
                                self.shard_id
                            );
                            conn.close().await;
                            return Flow::Shutdown;
                        }
                    }

                    Ok(Some(Payload::HeartbeatRequest)) => {
                        log::trace!("Shard {} heartbeat requested by server", self.shard_id);
                        if let Err(err) = conn.send(payload::heartbeat(self.sequence)).await {
                            log::warn!(
                                "Shard {} heartbeat send failed: {}",
                                self.shard_id,
                                err
                            );
                            return Flow::Reconnect;
                        }
                    }

                    Ok(Some(Payload::HeartbeatAck)) => {
                        inflight = false;
                    }

                    Ok(Some(Payload::Reconnect)) => {
                        log::info!(
                            "Shard {} asked to reconnect by the gateway",
                            self.shard_id
                        );
                        conn.close().await;
                        return Flow::Reconnect;
                    }

                    Ok(Some(Payload::InvalidSession { resumable })) => {
                        log::warn!(
                            "Shard {} session invalidated, resumable: {}",
                            self.shard_id,
                            resumable
                        );
                        if !resumable {
                            self.clear_session();
                        }

                        // the protocol wants a short randomized wait before
                        // the next identify/resume attempt
                        let delay =
                            Duration::from_millis(rand::thread_rng().gen_range(1000..=5000));
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                conn.close().await;
                                return Flow::Shutdown;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }

                        conn.close().await;
                        return Flow::Reconnect;
                    }

                    Ok(Some(Payload::Hello(_))) => {
                        log::warn!("Shard {} received hello mid-stream", self.shard_id);
                        conn.close().await;
                        return Flow::Reconnect;
                    }

                    Ok(Some(Payload::Unknown { op })) => {
                        log::trace!("Shard {} ignoring unknown opcode {}", self.shard_id, op);
                    }

                    Ok(None) => {
                        log::warn!(
                            "Shard {} stream ended without a close frame",
                            self.shard_id
                        );
                        return Flow::Reconnect;
                    }

                    Err(FrameError::Closed { code }) => {
                        return self.classify_close(CloseCode::from(code));
                    }

                    Err(err) => {
                        log::warn!("Shard {} stream broken: {}", self.shard_id, err);
                        return Flow::Reconnect;
                    }
                }
            }
        }
    }

    async fn wait_hello(&mut self, conn: &mut Connection) -> Result<Hello, Flow> {
        let deadline = Instant::now() + self.config.hello_timeout;

        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                conn.close().await;
                Err(Flow::Shutdown)
            }

            _ = tokio::time::sleep_until(deadline) => {
                log::warn!("Shard {} timed out waiting for hello", self.shard_id);
                conn.close().await;
                Err(Flow::Reconnect)
            }

            frame = conn.next_payload() => match frame {
                Ok(Some(Payload::Hello(hello))) => {
                    log::debug!(
                        "Shard {} received hello, heartbeat every {}ms",
                        self.shard_id,
                        hello.heartbeat_interval
                    );
                    Ok(hello)
                }
                Ok(Some(_)) => {
                    log::warn!("Shard {} first frame was not hello", self.shard_id);
                    conn.close().await;
                    Err(Flow::Reconnect)
                }
                Ok(None) => Err(Flow::Reconnect),
                Err(FrameError::Closed { code }) => {
                    Err(self.classify_close(CloseCode::from(code)))
                }
                Err(err) => {
                    log::warn!("Shard {} stream broken: {}", self.shard_id, err);
                    Err(Flow::Reconnect)
                }
            }
        }
    }

    fn connect_url(&self) -> Result<String, SessionError> {
        let base = match &self.resume {
            Some(resume) if self.sequence.is_some() => resume
                .resume_url
                .as_deref()
                .unwrap_or(self.gateway_url.as_str()),
            _ => self.gateway_url.as_str(),
        };

        let mut url =
            url::Url::parse(base).map_err(|err| SessionError::InvalidGatewayUrl {
                url: base.to_string(),
                reason: err.to_string(),
            })?;

        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(SessionError::InvalidGatewayUrl {
                    url: base.to_string(),
                    reason: format!("unsupported scheme {other}"),
                })
            }
        }

        let present: Vec<String> = url
            .query_pairs()
            .map(|(key, _)| key.into_owned())
            .collect();
        let missing = |key: &str| !present.iter().any(|existing| existing == key);

        {
            let mut query = url.query_pairs_mut();
            if missing("v") {
                query.append_pair("v", "10");
            }
            if missing("encoding") {
                query.append_pair("encoding", "json");
            }
            if self.config.transport_compression && missing("compress") {
                query.append_pair("compress", "zlib-stream");
            }
        }

        Ok(url.to_string())
    }

    fn classify_close(&mut self, code: CloseCode) -> Flow {
        match self.config.close_policy.action(code) {
            CloseAction::Resume => {
                log::warn!(
                    "Shard {} closed: {} ({}), will resume",
                    self.shard_id,
                    code.code(),
                    code.description()
                );
                Flow::Reconnect
            }
            CloseAction::Reidentify => {
                log::warn!(
                    "Shard {} closed: {} ({}), session discarded",
                    self.shard_id,
                    code.code(),
                    code.description()
                );
                self.clear_session();
                Flow::Reconnect
            }
            CloseAction::Fatal => Flow::Fatal(SessionError::FatalClose { code }),
        }
    }

    fn clear_session(&mut self) {
        self.resume = None;
        self.sequence = None;
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }

        log::debug!(
            "Shard {} state {:?} -> {:?}",
            self.shard_id,
            self.state,
            next
        );
        self.state = next;
        let _ = self.state_tx.send(next);
    }
}

fn command_payload(command: Command) -> String {
    match command {
        Command::UpdatePresence { status, activity } => payload::presence(
            &status,
            activity.as_ref().map(|(name, kind)| (name.as_str(), *kind)),
        ),
        Command::UpdateVoiceState {
            guild_id,
            channel_id,
            self_mute,
            self_deaf,
        } => payload::voice_state(guild_id, channel_id, self_mute, self_deaf),
        Command::RequestGuildMembers {
            guild_id,
            query,
            limit,
            presences,
            user_ids,
            nonce,
        } => payload::request_guild_members(&payload::GuildMembersFields {
            guild_id,
            query: query.as_deref(),
            limit,
            presences,
            user_ids: &user_ids,
            nonce: nonce.as_deref(),
        }),
        Command::RequestSoundboardSounds { guild_ids } => {
            payload::request_soundboard_sounds(&guild_ids)
        }
    }
}

/// Rolling budget for outbound gateway payloads.
#[derive(Debug)]
struct SendWindow {
    started: Instant,
    count: u32,
}

impl SendWindow {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            count: 0,
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        if now.duration_since(self.started) >= SEND_WINDOW {
            self.started = now;
            self.count = 0;
        }

        if self.count < SEND_LIMIT {
            self.count += 1;
            true
        } else {
            false
        }
    }

    fn window_end(&self) -> Instant {
        self.started + SEND_WINDOW
    }
}

#[derive(Debug)]
enum FrameError {
    Closed { code: u16 },
    Socket { source: Box<tokio_tungstenite::tungstenite::Error> },
    Decompress { source: DecompressError },
    Parse { source: ParsePayloadError },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed { code } => write!(f, "connection closed with code {code}"),
            Self::Socket { source } => write!(f, "websocket error: {source}"),
            Self::Decompress { source } => write!(f, "decompress failed: {source}"),
            Self::Parse { source } => write!(f, "parse failed: {source}"),
        }
    }
}

/// One websocket connection plus its negotiated decompression.
#[derive(Debug)]
struct Connection {
    ws: WebsocketClient,
    inflater: Option<Inflater>,
    payload_compression: bool,
}

impl Connection {
    fn new(ws: WebsocketClient, transport_compression: bool, payload_compression: bool) -> Self {
        Self {
            ws,
            inflater: transport_compression.then(Inflater::new),
            payload_compression,
        }
    }

    /// Read frames until one complete payload is available.
    ///
    /// `Ok(None)` means the stream ended without a close frame.
    async fn next_payload(&mut self) -> Result<Option<Payload>, FrameError> {
        loop {
            let frame = match self.ws.next().await {
                None => return Ok(None),
                Some(Ok(frame)) => frame,
                Some(Err(source)) => {
                    return Err(FrameError::Socket {
                        source: Box::new(source),
                    })
                }
            };

            let (bytes, binary) = match frame {
                WsMessage::Text(text) => (text.into_bytes(), false),
                WsMessage::Binary(data) => (data, true),
                WsMessage::Close(frame) => {
                    // 1005 stands in for a close without a status code
                    let code = frame.map_or(1005, |frame| u16::from(frame.code));
                    return Err(FrameError::Closed { code });
                }
                _ => continue,
            };

            let data = if let Some(ref mut inflater) = self.inflater {
                match inflater
                    .push(&bytes)
                    .map_err(|source| FrameError::Decompress { source })?
                {
                    Some(data) => data,
                    None => continue,
                }
            } else if binary && self.payload_compression {
                compression::inflate_payload(&bytes)
                    .map_err(|source| FrameError::Decompress { source })?
            } else {
                bytes
            };

            let payload =
                Payload::decode(&data).map_err(|source| FrameError::Parse { source })?;
            return Ok(Some(payload));
        }
    }

    async fn send(&mut self, payload: String) -> Result<(), FrameError> {
        self.ws
            .send(WsMessage::Text(payload))
            .await
            .map_err(|source| FrameError::Socket {
                source: Box::new(source),
            })
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_send_window_caps_then_rolls() {
        let mut window = SendWindow::new();

        for _ in 0..SEND_LIMIT {
            assert!(window.try_acquire(Instant::now()));
        }
        assert!(!window.try_acquire(Instant::now()));

        tokio::time::advance(SEND_WINDOW).await;

        assert!(window.try_acquire(Instant::now()));
    }

    #[test]
    fn test_command_payload_shapes() {
        let presence = command_payload(Command::UpdatePresence {
            status: "idle".to_string(),
            activity: Some(("rust".to_string(), 0)),
        });
        let value: serde_json::Value = serde_json::from_str(&presence).unwrap();
        assert_eq!(value["op"], 3);
        assert_eq!(value["d"]["status"], "idle");
        assert_eq!(value["d"]["activities"][0]["name"], "rust");

        let members = command_payload(Command::RequestGuildMembers {
            guild_id: 7,
            query: None,
            limit: 0,
            presences: false,
            user_ids: vec![1],
            nonce: None,
        });
        let value: serde_json::Value = serde_json::from_str(&members).unwrap();
        assert_eq!(value["op"], 8);
        assert_eq!(value["d"]["user_ids"][0], "1");
    }
}
