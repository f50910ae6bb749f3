//! Per-session inbound loop.
//!
//! Each accepted connection gets one router task. It reads one command frame
//! at a time and dispatches it against the [`SessionRegistry`]:
//!
//! - **Unjoined**: only `/isNameTaken`, `/setName` and `/exit` are accepted.
//! - **Joined**: directed messages, `/list`, `/isNameTaken` and `/exit`.
//!
//! Every command except `/exit` is answered by exactly one Reply or Error
//! frame, so a client can pair answers with the commands it sent.
//! - **Terminal**: on `/exit`, EOF, a read/write error, or the session being
//!   closed from outside (kick, shutdown), the session is removed from the
//!   registry (a no-op if already gone) and the connection is closed. A
//!   framing error is reported with a final Error frame first.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use crate::catalog::Catalog;
use crate::protocol::{Command, Frame, FrameCodec, FrameType, REPLY_FALSE, REPLY_OK, REPLY_TRUE};
use crate::session::{Session, SessionRegistry};

/// Shared, read-only inputs of every router task.
#[derive(Clone)]
pub struct RouterContext {
    pub registry: SessionRegistry,
    pub catalog: Arc<Catalog>,
    pub max_payload: u32,
    /// Close connections that have not joined within this long.
    pub join_timeout: Option<Duration>,
}

impl RouterContext {
    pub fn new(registry: SessionRegistry, catalog: Arc<Catalog>) -> Self {
        Self {
            registry,
            catalog,
            max_payload: crate::protocol::MAX_PAYLOAD_SIZE,
            join_timeout: None,
        }
    }
}

/// Between the sender name and the text of a relayed message.
const RELAY_SEPARATOR: &str = ": ";

/// Why a router loop ended.
#[derive(Debug)]
enum Exit {
    Requested,
    Closed,
    Eof,
    JoinTimeout,
    Io(io::Error),
}

enum Flow {
    Continue,
    Exit,
}

async fn join_deadline(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Run the inbound loop for `session` until it reaches the terminal state.
pub async fn run_session<R>(reader: R, session: Session, ctx: RouterContext)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, FrameCodec::new(ctx.max_payload));
    let deadline = join_deadline(ctx.join_timeout);
    tokio::pin!(deadline);

    tracing::debug!(peer = %session.peer, "session router started");

    let exit = loop {
        let frame = tokio::select! {
            _ = session.cancelled.cancelled() => break Exit::Closed,
            _ = &mut deadline, if !session.is_joined() => break Exit::JoinTimeout,
            next = frames.next() => match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    if e.kind() == io::ErrorKind::InvalidData {
                        // Framing is lost; tell the peer why before hanging up.
                        if let Err(send_err) = reply(&session, FrameType::Error, e.to_string()).await {
                            tracing::debug!(peer = %session.peer, ?send_err, "could not report framing error");
                        }
                    }
                    break Exit::Io(e);
                }
                None => break Exit::Eof,
            },
        };

        match handle_frame(&session, &frame, &ctx).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Exit) => break Exit::Requested,
            Err(e) => break Exit::Io(e),
        }
    };

    let removed = ctx.registry.remove_by_session(&session);
    session.close().await;

    match exit {
        Exit::Io(e) => {
            tracing::info!(session = %session.name(), peer = %session.peer, ?e, removed, "client connection failed")
        }
        other => {
            tracing::info!(session = %session.name(), peer = %session.peer, reason = ?other, removed, "client disconnected")
        }
    }
}

async fn reply(session: &Session, frame_type: FrameType, text: impl Into<String>) -> io::Result<()> {
    session.send(&Frame::text(frame_type, text)).await
}

async fn handle_frame(session: &Session, frame: &Frame, ctx: &RouterContext) -> io::Result<Flow> {
    if frame.frame_type != FrameType::Command {
        reply(session, FrameType::Error, format!("expected a command, got a {:?} frame", frame.frame_type)).await?;
        return Ok(Flow::Continue);
    }

    let command = match frame.as_text().and_then(Command::parse) {
        Ok(command) => command,
        Err(e) => {
            tracing::debug!(session = %session.name(), %e, "protocol error");
            reply(session, FrameType::Error, e.to_string()).await?;
            return Ok(Flow::Continue);
        }
    };

    if session.is_joined() {
        dispatch_joined(session, command, ctx).await
    } else {
        dispatch_unjoined(session, command, ctx).await
    }
}

async fn dispatch_unjoined(session: &Session, command: Command, ctx: &RouterContext) -> io::Result<Flow> {
    match command {
        Command::IsNameTaken(name) => answer_name_check(session, &name, ctx).await?,
        Command::SetName(name) => {
            session.set_name(&name);
            match ctx.registry.add(session.clone()) {
                Ok(position) => {
                    tracing::info!(session = %name, peer = %session.peer, position, "client joined");
                    reply(session, FrameType::Reply, REPLY_OK).await?;
                }
                Err(e) => {
                    session.clear_name();
                    tracing::debug!(peer = %session.peer, %e, "join rejected");
                    reply(session, FrameType::Error, e.to_string()).await?;
                }
            }
        }
        Command::Exit => return Ok(Flow::Exit),
        Command::SendTo { .. } | Command::List => {
            reply(session, FrameType::Error, ctx.catalog.join_first.clone()).await?;
        }
    }
    Ok(Flow::Continue)
}

async fn dispatch_joined(session: &Session, command: Command, ctx: &RouterContext) -> io::Result<Flow> {
    match command {
        Command::IsNameTaken(name) => answer_name_check(session, &name, ctx).await?,
        Command::SetName(_) => {
            reply(session, FrameType::Error, ctx.catalog.already_joined(&session.name())).await?;
        }
        Command::SendTo { target, text } => route_direct(session, &target, &text, ctx).await?,
        Command::List => {
            let names: Vec<String> = ctx
                .registry
                .snapshot_names()
                .into_iter()
                .map(|m| m.name)
                .collect();
            reply(session, FrameType::Reply, names.join("\n")).await?;
        }
        Command::Exit => return Ok(Flow::Exit),
    }
    Ok(Flow::Continue)
}

async fn answer_name_check(session: &Session, name: &str, ctx: &RouterContext) -> io::Result<()> {
    let taken = ctx.registry.try_claim_name(name);
    reply(session, FrameType::Reply, if taken { REPLY_TRUE } else { REPLY_FALSE }).await
}

/// Deliver `"<sender>: <text>"` to `target` only, then acknowledge.
///
/// A self-target, or a relayed payload over `max_payload`, is refused with
/// an Error and nothing is written to any target. Routing misses are pushed
/// as a Notice ahead of the acknowledgement. The registry lock is released
/// before the write; a failed write means the target is gone, so it is
/// removed and closed and the sender is unaffected.
async fn route_direct(session: &Session, target: &str, text: &str, ctx: &RouterContext) -> io::Result<()> {
    let sender = session.name();
    let relayed_len = sender.len() + RELAY_SEPARATOR.len() + text.len();
    if relayed_len > ctx.max_payload as usize {
        tracing::debug!(from = %sender, to = %target, relayed_len, "directed message too long");
        return reply(session, FrameType::Error, ctx.catalog.message_too_long(ctx.max_payload)).await;
    }

    if target == sender {
        return reply(session, FrameType::Error, ctx.catalog.self_target.clone()).await;
    }

    if let Some(peer) = ctx.registry.find_by_name(target) {
        let frame = Frame::text(FrameType::Message, format!("{sender}{RELAY_SEPARATOR}{text}"));
        if let Err(e) = peer.send(&frame).await {
            tracing::warn!(session = %target, ?e, "delivery failed, dropping client");
            ctx.registry.remove_by_session(&peer);
            peer.close().await;
            reply(session, FrameType::Notice, ctx.catalog.not_connected(target)).await?;
        } else {
            tracing::debug!(from = %sender, to = %target, "directed message delivered");
        }
    } else {
        reply(session, FrameType::Notice, ctx.catalog.not_connected(target)).await?;
    }
    reply(session, FrameType::Reply, REPLY_OK).await
}
