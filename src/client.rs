//! Bot client facade tying REST and gateway together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use snafu::prelude::*;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error;
use crate::gateway::session::{Command, Session, SessionChannels, SessionConfig};
use crate::gateway::{
    ClosePolicy, Event, IdentifyPacer, Intents, SessionError, SessionStartLimit, SessionState,
};
use crate::rest;
use crate::{Error, Result};

/// Callback-style consumer of gateway activity.
///
/// Alternative to polling the [`EventStream`] by hand; hand one to
/// [`Client::run`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// A dispatched event arrived.
    async fn on_event(&self, event: Event);

    /// A shard changed connection state.
    async fn on_state(&self, shard_id: u32, old: SessionState, new: SessionState) {
        let _ = (shard_id, old, new);
    }
}

/// Stream of gateway events from every shard of one client.
///
/// Yields `Err` exactly once per shard that fails fatally; everything
/// transient is absorbed by the sessions themselves.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<std::result::Result<Event, SessionError>>,
}

impl Stream for EventStream {
    type Item = std::result::Result<Event, SessionError>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Handle to one running shard.
#[derive(Debug, Clone)]
pub struct ShardHandle {
    shard_id: u32,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
}

impl ShardHandle {
    /// The shard this handle commands.
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    async fn send_command(&self, command: Command) -> Result<()> {
        ensure!(
            self.state() == SessionState::Ready,
            error::ShardNotReady {
                shard_id: self.shard_id,
            }
        );

        self.commands
            .send(command)
            .await
            .map_err(|_| Error::ShardStopped {
                shard_id: self.shard_id,
            })
    }

    /// Update the bot presence (gateway op 3).
    ///
    /// `status` is one of `online`, `idle`, `dnd` or `invisible`;
    /// `activity` is an optional name plus activity type.
    pub async fn update_presence(
        &self,
        status: &str,
        activity: Option<(&str, u8)>,
    ) -> Result<()> {
        self.send_command(Command::UpdatePresence {
            status: status.to_string(),
            activity: activity.map(|(name, kind)| (name.to_string(), kind)),
        })
        .await
    }

    /// Update the bot voice state (gateway op 4). `channel_id` of
    /// `None` disconnects.
    pub async fn update_voice_state(
        &self,
        guild_id: u64,
        channel_id: Option<u64>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()> {
        ensure!(
            guild_id != 0,
            error::InvalidArgument {
                reason: "guild_id must be non-zero",
            }
        );

        self.send_command(Command::UpdateVoiceState {
            guild_id,
            channel_id,
            self_mute,
            self_deaf,
        })
        .await
    }

    /// Request guild member chunks (gateway op 8).
    ///
    /// Exactly one of `query` (username prefix, `""` for all members)
    /// or `user_ids` must be supplied.
    pub async fn request_guild_members(
        &self,
        guild_id: u64,
        query: Option<&str>,
        limit: u32,
        presences: bool,
        user_ids: &[u64],
        nonce: Option<&str>,
    ) -> Result<()> {
        ensure!(
            guild_id != 0,
            error::InvalidArgument {
                reason: "guild_id must be non-zero",
            }
        );
        ensure!(
            query.is_some() != !user_ids.is_empty(),
            error::InvalidArgument {
                reason: "exactly one of query or user_ids is required",
            }
        );
        ensure!(
            user_ids.len() <= 100,
            error::InvalidArgument {
                reason: "at most 100 user ids may be requested",
            }
        );
        if let Some(nonce) = nonce {
            ensure!(
                nonce.len() <= 32,
                error::InvalidArgument {
                    reason: "nonce is limited to 32 bytes",
                }
            );
        }

        self.send_command(Command::RequestGuildMembers {
            guild_id,
            query: query.map(str::to_string),
            limit,
            presences,
            user_ids: user_ids.to_vec(),
            nonce: nonce.map(str::to_string),
        })
        .await
    }

    /// Request soundboard sounds for guilds (gateway op 31).
    pub async fn request_soundboard_sounds(&self, guild_ids: &[u64]) -> Result<()> {
        ensure!(
            !guild_ids.is_empty(),
            error::InvalidArgument {
                reason: "at least one guild id is required",
            }
        );

        self.send_command(Command::RequestSoundboardSounds {
            guild_ids: guild_ids.to_vec(),
        })
        .await
    }
}

/// Builder for [`Client`].
#[derive(Debug)]
pub struct ClientBuilder {
    token: String,
    intents: Intents,
    shard: Option<(u32, u32)>,
    shard_count: Option<u32>,
    large_threshold: Option<u32>,
    transport_compression: bool,
    payload_compression: bool,
    close_policy: ClosePolicy,
    hello_timeout: Duration,
    backoff: (Duration, Duration),
    event_buffer: usize,
}

impl ClientBuilder {
    /// Start building a client around a bot token.
    pub fn new<S: AsRef<str> + ?Sized>(token: &S) -> Self {
        Self {
            token: token.as_ref().to_string(),
            intents: Intents::empty(),
            shard: None,
            shard_count: None,
            large_threshold: None,
            transport_compression: false,
            payload_compression: false,
            close_policy: ClosePolicy::new(),
            hello_timeout: Duration::from_secs(6),
            backoff: (Duration::from_secs(1), Duration::from_secs(30)),
            event_buffer: 64,
        }
    }

    /// Gateway intents to subscribe to.
    pub fn intents(mut self, intents: Intents) -> Self {
        self.intents = intents;
        self
    }

    /// Run exactly one shard of a larger fleet.
    pub fn shard(mut self, shard_id: u32, shard_count: u32) -> Self {
        self.shard = Some((shard_id, shard_count));
        self
    }

    /// Run all shards of a fixed-size fleet in this process.
    ///
    /// Without this (or [`shard`](Self::shard)) the recommended count
    /// from `GET /gateway/bot` is used.
    pub fn shard_count(mut self, count: u32) -> Self {
        self.shard_count = Some(count);
        self
    }

    /// Member count threshold above which guilds arrive without
    /// offline members (50 to 250).
    pub fn large_threshold(mut self, threshold: u32) -> Self {
        self.large_threshold = Some(threshold);
        self
    }

    /// Negotiate `zlib-stream` transport compression.
    pub fn transport_compression(mut self, enable: bool) -> Self {
        self.transport_compression = enable;
        self
    }

    /// Ask for individually compressed payload frames instead.
    pub fn payload_compression(mut self, enable: bool) -> Self {
        self.payload_compression = enable;
        self
    }

    /// Replace the close code classification table.
    pub fn close_policy(mut self, policy: ClosePolicy) -> Self {
        self.close_policy = policy;
        self
    }

    /// How long to wait for the server hello before reconnecting.
    pub fn hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }

    /// Reconnect backoff bounds.
    pub fn reconnect_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = (base, max);
        self
    }

    /// Capacity of the event channel between sessions and the
    /// [`EventStream`].
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    /// Validate the configuration and create the client.
    pub fn build(self) -> Result<Client> {
        ensure!(
            !self.token.is_empty(),
            error::InvalidConfig {
                reason: "token is empty",
            }
        );
        if let Some((id, count)) = self.shard {
            ensure!(
                count > 0 && id < count,
                error::InvalidConfig {
                    reason: format!("shard {id} is out of range for {count} shards"),
                }
            );
            ensure!(
                self.shard_count.is_none(),
                error::InvalidConfig {
                    reason: "shard() and shard_count() are mutually exclusive",
                }
            );
        }
        if let Some(count) = self.shard_count {
            ensure!(
                count > 0,
                error::InvalidConfig {
                    reason: "shard_count must be non-zero",
                }
            );
        }
        if let Some(threshold) = self.large_threshold {
            ensure!(
                (50..=250).contains(&threshold),
                error::InvalidConfig {
                    reason: "large_threshold must be within 50..=250",
                }
            );
        }
        ensure!(
            !(self.transport_compression && self.payload_compression),
            error::InvalidConfig {
                reason: "transport and payload compression are mutually exclusive",
            }
        );
        ensure!(
            self.event_buffer > 0,
            error::InvalidConfig {
                reason: "event_buffer must be non-zero",
            }
        );

        let rest = rest::Client::new_from_bot_token(&self.token).context(error::CallApiFailed)?;

        let config = Arc::new(SessionConfig {
            token: self.token,
            intents: self.intents,
            large_threshold: self.large_threshold,
            transport_compression: self.transport_compression,
            payload_compression: self.payload_compression,
            close_policy: self.close_policy,
            hello_timeout: self.hello_timeout,
            backoff_base: self.backoff.0,
            backoff_max: self.backoff.1,
        });

        log::info!("Client created");

        Ok(Client {
            rest,
            config,
            shard: self.shard,
            shard_count: self.shard_count,
            event_buffer: self.event_buffer,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            shards: std::sync::Mutex::new(Vec::new()),
        })
    }
}

/// Discord bot client: one REST client plus one gateway session per
/// shard.
#[derive(Debug)]
pub struct Client {
    rest: rest::Client,
    config: Arc<SessionConfig>,
    shard: Option<(u32, u32)>,
    shard_count: Option<u32>,
    event_buffer: usize,
    cancel: CancellationToken,
    started: AtomicBool,
    shards: std::sync::Mutex<Vec<ShardHandle>>,
}

impl Client {
    /// Start building a client around a bot token.
    pub fn builder<S: AsRef<str> + ?Sized>(token: &S) -> ClientBuilder {
        ClientBuilder::new(token)
    }

    /// The REST client, also usable on its own.
    pub fn rest(&self) -> &rest::Client {
        &self.rest
    }

    /// Fetch the gateway url and session start budget over REST, then
    /// spawn the shard sessions.
    pub async fn start(&self) -> Result<EventStream> {
        self.claim_started()?;

        log::info!("Fetching gateway info");
        let info = match self.rest.gateway_bot().await.context(error::CallApiFailed) {
            Ok(info) => info,
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        log::info!(
            "Gateway url {}, {} recommended shards, {} session starts remaining",
            info.url,
            info.shards,
            info.session_start_limit.remaining
        );

        let limit = SessionStartLimit::from(info.session_start_limit);
        Ok(self.spawn_shards(info.url, limit, info.shards))
    }

    /// Spawn the shard sessions against an explicit gateway url,
    /// skipping the REST bootstrap (and its session start metadata).
    pub async fn start_with_gateway_url(&self, gateway_url: &str) -> Result<EventStream> {
        self.claim_started()?;

        Ok(self.spawn_shards(
            gateway_url.to_string(),
            SessionStartLimit::default(),
            1,
        ))
    }

    /// Stop every shard and cancel all in-flight waits.
    ///
    /// Sessions close their transports and exit without delivering
    /// further events.
    pub fn stop(&self) {
        log::info!("Stopping client");
        self.cancel.cancel();
    }

    /// Handles to every running shard.
    pub fn shards(&self) -> Vec<ShardHandle> {
        self.shards.lock().expect("shard list lock poisoned").clone()
    }

    /// Handle to one shard by id.
    pub fn shard(&self, shard_id: u32) -> Option<ShardHandle> {
        self.shards()
            .into_iter()
            .find(|shard| shard.shard_id == shard_id)
    }

    /// Start the client and drive an [`EventHandler`] until the client
    /// stops or a shard fails fatally.
    pub async fn run<H>(&self, handler: H) -> Result<()>
    where
        H: EventHandler + 'static,
    {
        let mut events = self.start().await?;
        let handler = Arc::new(handler);

        for shard in self.shards() {
            let handler = handler.clone();
            let mut state_rx = shard.state.clone();
            let shard_id = shard.shard_id;
            let cancel = self.cancel.clone();

            tokio::spawn(async move {
                let mut last = *state_rx.borrow();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            let next = *state_rx.borrow();
                            handler.on_state(shard_id, last, next).await;
                            last = next;
                        }
                    }
                }
            });
        }

        while let Some(item) = events.next().await {
            match item {
                Ok(event) => handler.on_event(event).await,
                Err(err) => {
                    self.stop();
                    return Err(Error::GatewayFailed { source: err });
                }
            }
        }

        Ok(())
    }

    fn claim_started(&self) -> Result<()> {
        ensure!(
            !self.started.swap(true, Ordering::SeqCst),
            error::AlreadyStarted
        );
        Ok(())
    }

    fn spawn_shards(
        &self,
        gateway_url: String,
        limit: SessionStartLimit,
        recommended: u32,
    ) -> EventStream {
        let pacer = Arc::new(IdentifyPacer::new(limit));
        let (event_tx, event_rx) = mpsc::channel(self.event_buffer);

        let assignments: Vec<Option<(u32, u32)>> = match (self.shard, self.shard_count) {
            (Some(shard), _) => vec![Some(shard)],
            (None, Some(count)) => (0..count).map(|id| Some((id, count))).collect(),
            (None, None) => {
                let count = recommended.max(1);
                if count == 1 {
                    vec![None]
                } else {
                    (0..count).map(|id| Some((id, count))).collect()
                }
            }
        };

        let mut handles = self.shards.lock().expect("shard list lock poisoned");
        for shard in assignments {
            let (command_tx, command_rx) = mpsc::channel(16);
            let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);

            let session = Session::new(
                self.config.clone(),
                shard,
                gateway_url.clone(),
                pacer.clone(),
                SessionChannels {
                    events: event_tx.clone(),
                    state: state_tx,
                    commands: command_rx,
                    cancel: self.cancel.clone(),
                },
            );
            tokio::spawn(session.run());

            handles.push(ShardHandle {
                shard_id: shard.map_or(0, |(id, _)| id),
                commands: command_tx,
                state: state_rx,
            });
        }

        log::info!("Spawned {} shard session(s)", handles.len());

        EventStream { rx: event_rx }
    }
}
