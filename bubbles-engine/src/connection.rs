//! Connection manager: join handshake, the session I/O loop and reconnection.
//!
//! ```text
//!            ┌──────────── IoCommand::Resume ◄── Session::resume
//!            ▼
//!  ┌──────────────────┐  Position/PeerLeft   ┌────────────────┐
//!  │ pump (select!)   │ ───────────────────► │ PositionRoster │
//!  │  inbound frames  │                      └────────────────┘
//!  │  pointer notify  │ ◄─── LocalPointer (touch / autopilot)
//!  │  liveness tick   │
//!  │  lifecycle watch │
//!  └────────┬─────────┘
//!           │ transport lost while Running
//!           ▼
//!   recover: backoff + re-join, or Failed
//! ```

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use crate::compression::Compression;
use crate::error::EngineError;
use crate::lifecycle::LifecycleState;
use crate::protocol::{JoinRequest, MessageType, PositionReport, WireMessage};
use crate::session::{SessionEvent, Shared};
use crate::transport::{self, ClientTls, WsStream};

/// Where and how to join.
#[derive(Clone)]
pub(crate) struct Target {
    pub address: String,
    pub room: String,
    pub compression: Compression,
    pub tls: Option<ClientTls>,
}

/// Requests from the session facade to the I/O loop.
pub(crate) enum IoCommand {
    /// Re-arm after a pause and report once the link is known to be live.
    Resume(oneshot::Sender<Result<(), EngineError>>),
}

/// A joined connection.
pub(crate) struct Link {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    /// Color confirmed by the relay
    pub color: u32,
    /// Codec confirmed by the relay
    pub compression: Compression,
}

impl Link {
    async fn send(&mut self, msg: &WireMessage) -> Result<(), EngineError> {
        let encoded = msg.encode()?;
        self.sink.send(Message::Binary(encoded.into())).await?;
        Ok(())
    }

    pub(crate) async fn close(mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

/// Dial, then run the join handshake.
pub(crate) async fn establish(shared: &Shared, target: &Target) -> Result<Link, EngineError> {
    let ws = transport::dial(
        &target.address,
        target.tls.as_ref(),
        shared.config.connect_timeout,
    )
    .await?;
    let (mut sink, mut stream) = ws.split();

    let request = JoinRequest::new(
        target.room.clone(),
        target.compression,
        shared.local_color.load(Ordering::Relaxed),
    );
    let join = WireMessage::join(shared.peer_id, &request)?.encode()?;
    sink.send(Message::Binary(join.into()))
        .await
        .map_err(|e| EngineError::Connect(format!("sending join failed: {e}")))?;
    shared.joins_sent.fetch_add(1, Ordering::Relaxed);

    let reply = timeout(shared.config.handshake_timeout, next_wire_message(&mut stream))
        .await
        .map_err(|_| EngineError::Connect("timed out waiting for join reply".into()))??;

    match reply.msg_type {
        MessageType::JoinAccepted => {
            let accepted = reply.accepted()?;
            log::info!(
                "Joined room {:?} as {} (color {:06x}, compression {:?})",
                target.room,
                shared.peer_id,
                accepted.color,
                accepted.compression
            );
            Ok(Link {
                sink,
                stream,
                color: accepted.color,
                compression: accepted.compression,
            })
        }
        MessageType::JoinRejected => {
            let reason = reply.rejection()?;
            Err(EngineError::Handshake(reason.to_string()))
        }
        other => Err(EngineError::Handshake(format!(
            "unexpected {other:?} in reply to join"
        ))),
    }
}

/// Next binary frame, skipping WebSocket control frames.
///
/// Losing the socket here is a connect failure, not a refusal: only a
/// decoded reply can reject the join.
async fn next_wire_message(stream: &mut SplitStream<WsStream>) -> Result<WireMessage, EngineError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => return Ok(WireMessage::decode(&data)?),
            Some(Ok(Message::Close(_))) | None => {
                return Err(EngineError::Connect(
                    "relay closed the connection before answering the join".into(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(EngineError::Connect(format!("reading join reply failed: {e}")))
            }
        }
    }
}

enum Pump {
    Stopped,
    Lost(String),
}

type ResumeReply = oneshot::Sender<Result<(), EngineError>>;

/// The session I/O loop. Runs until the lifecycle reaches a terminal state.
pub(crate) async fn run(
    shared: Arc<Shared>,
    target: Target,
    link: Link,
    mut commands: mpsc::Receiver<IoCommand>,
) {
    let mut state_rx = shared.lifecycle.subscribe();
    let mut link = link;
    let mut pending: Option<ResumeReply> = None;

    loop {
        match pump(&shared, &mut link, &mut state_rx, &mut commands, &mut pending).await {
            Pump::Stopped => {
                link.close().await;
                break;
            }
            Pump::Lost(reason) => {
                log::warn!("Transport lost: {reason}");
                match recover(&shared, &target, &mut state_rx, &mut commands, &mut pending).await {
                    Some(next) => link = next,
                    None => break,
                }
            }
        }
    }

    if let Some(reply) = pending.take() {
        let _ = reply.send(Err(EngineError::state("resume", shared.lifecycle.state())));
    }
    shared.roster.clear();
    log::debug!("I/O loop for {} exited", shared.peer_id);
}

async fn pump(
    shared: &Shared,
    link: &mut Link,
    state_rx: &mut watch::Receiver<LifecycleState>,
    commands: &mut mpsc::Receiver<IoCommand>,
    pending: &mut Option<ResumeReply>,
) -> Pump {
    let mut liveness = tokio::time::interval(shared.config.liveness_interval);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let state = *state_rx.borrow_and_update();
        if state.is_terminal() {
            return Pump::Stopped;
        }
        let running = state == LifecycleState::Running;

        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return Pump::Stopped;
                }
            }

            cmd = commands.recv() => match cmd {
                Some(IoCommand::Resume(reply)) => {
                    // A pong proves the relay still has us; a dead link
                    // surfaces as a read or write error and triggers a re-join.
                    *pending = Some(reply);
                    if let Err(e) = link.send(&WireMessage::ping(shared.peer_id)).await {
                        return Pump::Lost(e.to_string());
                    }
                }
                None => return Pump::Stopped,
            },

            frame = link.stream.next(), if running => match frame {
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = handle_frame(shared, link, &data, pending).await {
                        return Pump::Lost(e.to_string());
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Pump::Lost("closed by relay".into());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Pump::Lost(e.to_string()),
            },

            _ = shared.pointer.changed(), if running => {
                if let Err(e) = send_position(shared, link, false).await {
                    return Pump::Lost(e.to_string());
                }
            }

            _ = liveness.tick(), if running => {
                if let Err(e) = send_position(shared, link, true).await {
                    return Pump::Lost(e.to_string());
                }
            }
        }
    }
}

async fn handle_frame(
    shared: &Shared,
    link: &mut Link,
    data: &[u8],
    pending: &mut Option<ResumeReply>,
) -> Result<(), EngineError> {
    let msg = match WireMessage::decode(data) {
        Ok(msg) => msg,
        Err(e) => {
            shared.malformed_frames.fetch_add(1, Ordering::Relaxed);
            log::warn!("Dropping malformed frame: {e}");
            return Ok(());
        }
    };

    match msg.msg_type {
        MessageType::Position => {
            if msg.peer_id == shared.peer_id {
                return Ok(());
            }
            match msg.position_report(link.compression) {
                Ok(report) => {
                    // A stop may have landed while this frame was in flight.
                    if shared.lifecycle.state() != LifecycleState::Running {
                        return Ok(());
                    }
                    if shared.roster.upsert(msg.peer_id, report.x, report.y, report.color) {
                        log::debug!("Participant {} appeared", msg.peer_id);
                    }
                    log::trace!("Position {} ({}, {}) seq {}", msg.peer_id, report.x, report.y, msg.seq);
                    shared.events.emit(SessionEvent::Redraw);
                }
                Err(e) => {
                    shared.malformed_frames.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Dropping malformed position from {}: {e}", msg.peer_id);
                }
            }
        }
        MessageType::PeerLeft => {
            if shared.roster.remove(&msg.peer_id) {
                log::debug!("Participant {} left", msg.peer_id);
                shared.events.emit(SessionEvent::Redraw);
            }
        }
        MessageType::Pong => {
            if let Some(reply) = pending.take() {
                log::debug!("Link confirmed live after resume");
                let _ = reply.send(Ok(()));
            }
        }
        MessageType::Ping => {
            link.send(&WireMessage::pong(shared.peer_id)).await?;
        }
        other => {
            log::debug!("Ignoring unexpected {other:?} mid-session");
        }
    }
    Ok(())
}

/// Send the local position if it is dirty, or unconditionally on a liveness tick.
async fn send_position(shared: &Shared, link: &mut Link, liveness: bool) -> Result<(), EngineError> {
    let snap = shared.pointer.snapshot();
    if !snap.dirty && !liveness {
        return Ok(());
    }
    let report = PositionReport {
        x: snap.x,
        y: snap.y,
        color: shared.local_color.load(Ordering::Relaxed),
    };
    let seq = shared.next_seq.fetch_add(1, Ordering::Relaxed);
    let msg = WireMessage::position(shared.peer_id, seq, &report, link.compression)?;
    link.send(&msg).await?;
    shared.pointer.mark_sent(snap.version);
    log::trace!("Sent position ({}, {}) seq {seq}", snap.x, snap.y);
    Ok(())
}

/// Re-join after a transport loss, following the reconnect policy.
///
/// Returns `None` if the session ended, either by a stop or because the
/// policy ran out (in which case the session is moved to Failed).
async fn recover(
    shared: &Shared,
    target: &Target,
    state_rx: &mut watch::Receiver<LifecycleState>,
    commands: &mut mpsc::Receiver<IoCommand>,
    pending: &mut Option<ResumeReply>,
) -> Option<Link> {
    let policy = shared.config.reconnect;
    let mut attempt = 0u32;
    let mut last_error = String::from("transport lost");

    loop {
        let state = *state_rx.borrow_and_update();
        match state {
            LifecycleState::Running => {}
            LifecycleState::Paused => {
                // No I/O while paused; wait for resume or stop.
                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                    Some(IoCommand::Resume(reply)) = commands.recv() => {
                        *pending = Some(reply);
                    }
                }
                continue;
            }
            _ => return None,
        }

        let Some(delay) = policy.backoff(attempt) else {
            let reason = format!(
                "reconnect failed after {} attempts: {last_error}",
                policy.max_attempts
            );
            fail(shared, pending, EngineError::Transport(reason));
            return None;
        };
        attempt += 1;

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = state_rx.wait_for(|s| s.is_terminal()) => return None,
        }

        log::info!("Re-joining {} (attempt {attempt})", target.address);
        let result = tokio::select! {
            r = establish(shared, target) => r,
            _ = state_rx.wait_for(|s| s.is_terminal()) => return None,
        };

        match result {
            Ok(link) => {
                shared.local_color.store(link.color, Ordering::Relaxed);
                // Peers that left while we were away never sent us PeerLeft.
                shared.roster.clear();
                shared.pointer.mark_dirty();
                shared.events.emit(SessionEvent::Reconnected);
                shared.events.emit(SessionEvent::Redraw);
                if let Some(reply) = pending.take() {
                    let _ = reply.send(Ok(()));
                }
                return Some(link);
            }
            // The relay answered and said no; retrying will not change that.
            Err(e @ EngineError::Handshake(_)) => {
                fail(shared, pending, e);
                return None;
            }
            Err(e) => {
                log::warn!("Re-join attempt {attempt} failed: {e}");
                last_error = e.to_string();
            }
        }
    }
}

fn fail(shared: &Shared, pending: &mut Option<ResumeReply>, error: EngineError) {
    log::error!("Session failed: {error}");
    shared.record_error(error.clone());
    if shared.lifecycle.fail() {
        shared.events.emit_reliable(SessionEvent::Failed {
            reason: error.to_string(),
        });
    }
    if let Some(reply) = pending.take() {
        let _ = reply.send(Err(error));
    }
}
