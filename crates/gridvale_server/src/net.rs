//! The session layer: accepting connections, the authentication handshake,
//! and the per-connection reader/writer tasks.
//!
//! A connection gets exactly one shot at `CMD_AUTHENTICATE`. After a
//! successful handshake the stream splits: a reader task decodes frames and
//! dispatches them under the player's lock, and a writer task drains the
//! session's bounded byte channel to the socket, which preserves
//! per-recipient ordering.

use std::io::ErrorKind;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use bytes::Bytes;
use gridvale_protocol::codec::encode_event;
use gridvale_protocol::messages::{
    ChatChannel, ClientConfig, CmdAuthenticate, EventChatMessage, EventPlayerJoined,
    EventPlayerLeft, EventStateUpdate, EventWelcome, PlayerPayload, RespError, RespSuccess,
    StateEntry, StatePayload, VisualState,
};
use gridvale_protocol::{
    ErrorCode, FrameDecoder, FrameEncoder, MessageFrame, MessageKind, PROTOCOL_VERSION,
};
use gridvale_store::state::{unix_now, PlayerPosition};
use gridvale_store::PlayerRecord;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::combat::Combatant;
use crate::handler;
use crate::registry::Session;
use crate::GameContext;

const READ_BUF_SIZE: usize = 4096;

/// Accepts new connections until shutdown.
pub async fn run_accept_loop(
    ctx: Arc<GameContext>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let connection_sema = Arc::new(Semaphore::new(ctx.config.max_connections));

    loop {
        let permit = tokio::select! {
            permit = connection_sema.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        };

        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    debug!(%remote_addr, "accepted connection");
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        handle_connection(ctx, stream).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("failed to accept incoming connection: {e}");
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn handle_connection(ctx: Arc<GameContext>, stream: TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        error!("failed to set TCP_NODELAY: {e}");
    }

    if let Err(e) = handle_handshake(ctx, stream).await {
        // EOF while joining is not erroneous; clients give up all the time.
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == ErrorKind::UnexpectedEof {
                return;
            }
        }
        warn!("connection ended with error: {e:#}");
    }
}

/// Frame-at-a-time I/O used during the handshake, before the stream splits.
struct MessageIo {
    stream: TcpStream,
    enc: FrameEncoder,
    dec: FrameDecoder,
}

impl MessageIo {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            enc: FrameEncoder::new(),
            dec: FrameDecoder::new(),
        }
    }

    async fn recv_frame(&mut self) -> anyhow::Result<MessageFrame> {
        loop {
            if let Some(frame) = self.dec.try_next_frame()? {
                return Ok(frame);
            }

            self.dec.reserve(READ_BUF_SIZE);
            let mut buf = self.dec.take_capacity();

            if self.stream.read_buf(&mut buf).await? == 0 {
                return Err(std::io::Error::from(ErrorKind::UnexpectedEof).into());
            }

            self.dec.queue_bytes(buf);
        }
    }

    async fn send_message<M>(&mut self, correlation: i32, msg: &M) -> anyhow::Result<()>
    where
        M: gridvale_protocol::Message + gridvale_protocol::Encode,
    {
        self.enc.append_message(correlation, msg)?;
        let bytes = self.enc.take();
        self.stream.write_all(&bytes).await?;
        Ok(())
    }
}

/// Refusals during the handshake. Reported to the client, then the transport
/// closes.
struct AuthRefusal {
    code: ErrorCode,
    message: String,
    retry_after_secs: Option<u32>,
}

impl AuthRefusal {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after_secs: None,
        }
    }
}

async fn handle_handshake(ctx: Arc<GameContext>, stream: TcpStream) -> anyhow::Result<()> {
    let mut io = MessageIo::new(stream);

    let frame = tokio::time::timeout(ctx.config.handshake_timeout, io.recv_frame())
        .await
        .context("handshake timed out")??;

    let correlation = frame.correlation;
    match authenticate(&ctx, &frame).await {
        Ok(record) => {
            io.send_message(correlation, &RespSuccess {
                message: "authenticated".to_owned(),
            })
            .await?;
            run_session(ctx, io, record).await
        }
        Err(refusal) => {
            info!(code = refusal.code.name(), "refused connection: {}", refusal.message);
            let mut details = vec![];
            if let Some(secs) = refusal.retry_after_secs {
                details.push(("retry_after_secs".to_owned(), secs.to_string()));
            }
            io.send_message(correlation, &RespError {
                code: refusal.code,
                category: refusal.code.category(),
                message: refusal.message,
                details,
                suggested_action: None,
                cooldown_remaining_ms: None,
            })
            .await?;
            io.stream.shutdown().await.ok();
            Ok(())
        }
    }
}

async fn authenticate(
    ctx: &Arc<GameContext>,
    frame: &MessageFrame,
) -> Result<PlayerRecord, AuthRefusal> {
    if frame.message_kind() != Some(MessageKind::CmdAuthenticate) {
        return Err(AuthRefusal::new(
            ErrorCode::AuthInvalidToken,
            "expected CMD_AUTHENTICATE",
        ));
    }
    if frame.version != PROTOCOL_VERSION {
        return Err(AuthRefusal::new(
            ErrorCode::MsgMalformed,
            format!("unsupported protocol version {}", frame.version),
        ));
    }

    let msg: CmdAuthenticate = frame
        .decode()
        .map_err(|_| AuthRefusal::new(ErrorCode::MsgMalformed, "malformed authenticate payload"))?;

    let claims = ctx
        .tokens
        .verify(&msg.token)
        .map_err(|e| AuthRefusal::new(ErrorCode::AuthInvalidToken, e.to_string()))?;

    let record = ctx
        .store
        .player_record(claims.sub)
        .await
        .map_err(|_| AuthRefusal::new(ErrorCode::AuthInvalidToken, "unknown player"))?;

    if record.username != claims.username {
        return Err(AuthRefusal::new(
            ErrorCode::AuthInvalidToken,
            "token subject mismatch",
        ));
    }
    if record.is_banned {
        return Err(AuthRefusal::new(ErrorCode::AuthBanned, "account is banned"));
    }
    if record.is_timed_out(unix_now()) {
        return Err(AuthRefusal::new(
            ErrorCode::AuthTimedOut,
            "account is timed out",
        ));
    }

    // Capacity: privileged roles bypass the cap.
    if !record.role.is_privileged() && ctx.registry.session_count() >= ctx.config.max_players {
        let mut refusal = AuthRefusal::new(ErrorCode::AuthServerFull, "server is full");
        refusal.retry_after_secs = Some(30);
        return Err(refusal);
    }

    Ok(record)
}

/// Materializes runtime state, registers the session, emits the welcome
/// sequence, and runs the read loop until disconnect.
async fn run_session(
    ctx: Arc<GameContext>,
    io: MessageIo,
    record: PlayerRecord,
) -> anyhow::Result<()> {
    let player = record.id;
    let username = record.username.clone();

    // Load-or-default the live position, falling back to the configured
    // spawn when the persisted map no longer exists.
    ctx.store.register_online(player, &username);
    let mut position = ctx.store.position(player).await?;
    if ctx.maps.get(&position.map_id).is_none() {
        warn!(player_id = %player, map_id = %position.map_id, "persisted map is gone; respawning");
        position = PlayerPosition {
            map_id: ctx.config.spawn_map.clone(),
            pos: ctx.config.spawn_position,
            facing: position.facing,
            last_move_at: 0.0,
        };
        ctx.store.set_position(player, position.clone());
    }
    let hp = ctx.store.hp(player).await?;
    let appearance = ctx.store.appearance(player).await?;
    // Warm the rest so the first commands hit the cache.
    ctx.store.skills(player).await?;
    ctx.store.inventory(player).await?;
    ctx.store.equipment(player).await?;

    let (outgoing_tx, outgoing_rx) = flume::bounded::<Bytes>(ctx.config.session_queue_frames);
    let serial = ctx.next_session_serial();
    let session = Session::new(player, username.clone(), serial, outgoing_tx);

    // A fresh authenticated session supersedes any prior one.
    if let Some(old) = ctx.registry.register(session.clone(), position.map_id.clone()) {
        info!(player_id = %player, "replacing existing session");
        old.close();
    }

    let (read_half, write_half) = io.stream.into_split();
    let writer_task = tokio::spawn(run_writer(write_half, outgoing_rx));

    info!(player_id = %player, username, map_id = %position.map_id, "session open");

    send_welcome(&ctx, &session, &position, hp.current, hp.max, &appearance).await;

    // The read loop owns this task until the client goes away or the session
    // is closed from elsewhere (replacement, kick, shutdown).
    let result = run_reader(&ctx, &session, read_half, io.dec).await;

    disconnect(&ctx, &session).await;

    // Let the writer drain what is already queued so the final events go out
    // best-effort, then stop waiting on it.
    session.close();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer_task).await;

    result
}

async fn send_welcome(
    ctx: &Arc<GameContext>,
    session: &Session,
    position: &PlayerPosition,
    current_hp: u32,
    max_hp: u32,
    appearance: &gridvale_store::state::Appearance,
) {
    let player = session.player_id;

    let welcome = EventWelcome {
        player_id: player,
        username: session.username.clone(),
        map_id: position.map_id.clone(),
        position: position.pos,
        current_hp,
        max_hp,
        visual: VisualState {
            fields: appearance
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            visual_hash: appearance.visual_hash(),
        },
        motd: ctx.config.motd.clone(),
        config: ClientConfig {
            move_cooldown_ms: ctx.config.move_cooldown.as_millis() as u32,
            animation_duration_ms: ctx.config.animation_duration.as_millis() as u32,
            protocol_version: PROTOCOL_VERSION,
        },
    };
    if let Ok(bytes) = encode_event(&welcome) {
        session.try_send(bytes.freeze());
    }

    let greeting = EventChatMessage {
        channel: ChatChannel::System,
        sender: None,
        body: format!("Welcome back, {}.", session.username),
        position: None,
    };
    if let Ok(bytes) = encode_event(&greeting) {
        session.try_send(bytes.freeze());
    }

    // One-shot snapshot of players already in view, so the client can render
    // others before the first tick diff lands.
    let mut entries = Vec::new();
    for other in ctx.registry.players_on_map(&position.map_id) {
        if other == player {
            continue;
        }
        let Ok(other_pos) = ctx.store.position(other).await else {
            continue;
        };
        if position.pos.chebyshev_distance(other_pos.pos) > ctx.config.visibility_radius {
            continue;
        }
        let Ok(other_hp) = ctx.store.hp(other).await else {
            continue;
        };
        let Ok(other_appearance) = ctx.store.appearance(other).await else {
            continue;
        };
        let Some(other_name) = ctx.store.username_of(other) else {
            continue;
        };
        entries.push(StateEntry {
            id: format!("player:{other}"),
            payload: StatePayload::Player(PlayerPayload {
                player_id: other,
                username: other_name,
                position: other_pos.pos,
                current_hp: other_hp.current,
                max_hp: other_hp.max,
                facing: other_pos.facing,
                visual_hash: other_appearance.visual_hash(),
            }),
        });
    }
    if !entries.is_empty() {
        let snapshot = EventStateUpdate {
            map_id: position.map_id.clone(),
            entities: entries,
            removed: vec![],
        };
        if let Ok(bytes) = encode_event(&snapshot) {
            session.try_send(bytes.freeze());
        }
    }

    let joined = EventPlayerJoined {
        player_id: player,
        username: session.username.clone(),
        position: position.pos,
    };
    if let Ok(bytes) = encode_event(&joined) {
        ctx.registry
            .broadcast_to_map_except(&position.map_id, player, &bytes.freeze());
    }
}

async fn run_reader(
    ctx: &Arc<GameContext>,
    session: &Session,
    mut reader: OwnedReadHalf,
    mut dec: FrameDecoder,
) -> anyhow::Result<()> {
    loop {
        // Drain complete frames before reading more bytes.
        while let Some(frame) = dec.try_next_frame()? {
            handler::dispatch(ctx, session, frame).await;
        }

        dec.reserve(READ_BUF_SIZE);
        let mut buf = dec.take_capacity();

        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                match read {
                    Ok(0) => return Ok(()), // EOF
                    Ok(_) => dec.queue_bytes(buf),
                    Err(e) => {
                        debug!("error reading from stream: {e}");
                        return Ok(());
                    }
                }
            }
            _ = session.closed() => {
                bail!("session closed by server");
            }
        }
    }
}

async fn run_writer(mut writer: OwnedWriteHalf, outgoing: flume::Receiver<Bytes>) {
    loop {
        let bytes = match outgoing.recv_async().await {
            Ok(bytes) => bytes,
            Err(_) => break, // All senders dropped.
        };

        // An empty buffer is the hangup marker from `Session::close`.
        if bytes.is_empty() {
            break;
        }

        if let Err(e) = writer.write_all(&bytes).await {
            debug!("error writing to stream: {e}");
            break;
        }
    }
    writer.shutdown().await.ok();
}

/// Tears a session down: final flush, index removal, map notification, and
/// per-player resource cleanup.
async fn disconnect(ctx: &Arc<GameContext>, session: &Session) {
    let player = session.player_id;

    // Only the current session cleans up; a replaced session must not tear
    // down its successor's state.
    let was_current = ctx.registry.remove(player, Some(session.serial)).is_some();
    if !was_current {
        debug!(player_id = %player, "stale session exited");
        return;
    }

    let map_id = ctx.store.position(player).await.ok().map(|p| p.map_id);

    if let Err(e) = ctx.store.flush_player(player).await {
        error!(player_id = %player, error = %e, "final flush on disconnect failed");
    }

    ctx.store.unregister_online(player);
    ctx.store.clear_combat_state(player);
    ctx.store.clear_combat_against(Combatant::Player(player).into());
    ctx.store.cleanup_player(player);
    ctx.rate_limiter.cleanup_player(player);
    ctx.visibility.remove(player);
    ctx.locks.cleanup_player(player);

    // Entities chasing this player give up on their next tick; clear their
    // targets eagerly so they do not swing at a ghost.
    if let Some(map_id) = &map_id {
        for entity in ctx.store.entities_on_map(map_id) {
            if entity.aggro_target == Some(player) {
                let _ = ctx
                    .store
                    .update_entity(entity.id, |e| {
                        e.aggro_target = None;
                        if matches!(
                            e.state,
                            gridvale_protocol::EntityState::Aggro
                                | gridvale_protocol::EntityState::Attacking
                        ) {
                            e.state = gridvale_protocol::EntityState::Idle;
                        }
                    })
                    .await;
            }
        }

        let left = EventPlayerLeft {
            player_id: player,
            username: session.username.clone(),
        };
        if let Ok(bytes) = encode_event(&left) {
            ctx.registry.broadcast_to_map(map_id, &bytes.freeze());
        }
    }

    info!(player_id = %player, username = session.username, "session closed");
}
