//! TCP client for the relay server.
//!
//! Drives the join handshake (`/isNameTaken` then `/setName`), sends
//! directed messages and roster requests, and surfaces relayed messages and
//! server notices. Every command except `/exit` is answered by exactly one
//! Reply or Error frame, so [`Client`] keeps at most one request in flight
//! and pairs answers by order. Messages that arrive while a request is
//! waiting for its answer are queued and returned by [`Client::next_event`]
//! afterwards.

use std::collections::VecDeque;
use std::io;

use futures::StreamExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::FramedRead;

use crate::protocol::{Command, Frame, FrameCodec, FrameType, ProtocolError, REPLY_OK, REPLY_TRUE};
use crate::session::validate_name;

/// Something the server pushed without being asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Relayed chat text, `"<sender>: <text>"`.
    Message(String),
    /// Server notice: kicked, shutdown, routing miss.
    Notice(String),
    /// Error frame that answers no request, such as the reason given
    /// before the server drops a connection whose framing broke.
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("name already taken: {0}")]
    NameTaken(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("you can't send messages to yourself")]
    SelfTarget,
    #[error("message text must not be empty")]
    EmptyMessage,
    #[error("not joined yet")]
    NotJoined,
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error("server closed the connection")]
    Disconnected,
}

pub struct Client {
    frames: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: OwnedWriteHalf,
    name: Option<String>,
    pending: VecDeque<Inbound>,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            frames: FramedRead::new(reader, FrameCodec::default()),
            writer,
            name: None,
            pending: VecDeque::new(),
        })
    }

    /// The joined name, once [`join`](Self::join) has succeeded.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    async fn send_command(&mut self, command: &Command) -> Result<(), ClientError> {
        Frame::command(command).write_to(&mut self.writer).await?;
        Ok(())
    }

    /// Send a command and wait for its Reply, queueing pushed frames.
    async fn request(&mut self, command: &Command) -> Result<String, ClientError> {
        self.send_command(command).await?;
        loop {
            let frame = self.frames.next().await.ok_or(ClientError::Disconnected)??;
            match frame.frame_type {
                FrameType::Reply => return Ok(frame.as_text()?.to_string()),
                FrameType::Error => return Err(ClientError::Rejected(frame.as_text()?.to_string())),
                FrameType::Message => self.pending.push_back(Inbound::Message(frame.as_text()?.to_string())),
                FrameType::Notice => self.pending.push_back(Inbound::Notice(frame.as_text()?.to_string())),
                FrameType::Command => return Err(ProtocolError::UnexpectedFrame(frame.frame_type).into()),
            }
        }
    }

    pub async fn is_name_taken(&mut self, name: &str) -> Result<bool, ClientError> {
        validate_name(name).map_err(ClientError::InvalidName)?;
        let reply = self.request(&Command::IsNameTaken(name.to_string())).await?;
        Ok(reply == REPLY_TRUE)
    }

    /// Claim `name`: check it, then set it. The server re-checks on set, so
    /// a concurrent claim of the same name fails with `Rejected` here.
    pub async fn join(&mut self, name: &str) -> Result<(), ClientError> {
        validate_name(name).map_err(ClientError::InvalidName)?;
        if self.is_name_taken(name).await? {
            return Err(ClientError::NameTaken(name.to_string()));
        }
        let reply = self.request(&Command::SetName(name.to_string())).await?;
        if reply != REPLY_OK {
            return Err(ClientError::Rejected(reply));
        }
        self.name = Some(name.to_string());
        Ok(())
    }

    /// Send `text` to the peer called `target` and wait for the server to
    /// accept it. A missing target is reported as an [`Inbound::Notice`];
    /// a message the server refuses (too long) fails with `Rejected`.
    pub async fn send_to(&mut self, target: &str, text: &str) -> Result<(), ClientError> {
        let Some(own) = self.name.as_deref() else {
            return Err(ClientError::NotJoined);
        };
        if own == target {
            return Err(ClientError::SelfTarget);
        }
        validate_name(target).map_err(ClientError::InvalidName)?;
        if text.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let reply = self
            .request(&Command::SendTo {
                target: target.to_string(),
                text: text.to_string(),
            })
            .await?;
        if reply != REPLY_OK {
            return Err(ClientError::Rejected(reply));
        }
        Ok(())
    }

    /// Names of every joined client, in join order.
    pub async fn list(&mut self) -> Result<Vec<String>, ClientError> {
        let reply = self.request(&Command::List).await?;
        Ok(reply.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
    }

    /// Leave gracefully. The server closes the connection.
    pub async fn exit(mut self) -> Result<(), ClientError> {
        self.send_command(&Command::Exit).await?;
        // Drain until the server hangs up.
        while let Some(frame) = self.frames.next().await {
            if frame.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Next pushed message or notice. `None` once the server has closed the
    /// connection.
    ///
    /// Cancel-safe: a partially received frame stays buffered.
    pub async fn next_event(&mut self) -> Result<Option<Inbound>, ClientError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        loop {
            let Some(frame) = self.frames.next().await else {
                return Ok(None);
            };
            let frame = frame?;
            match frame.frame_type {
                FrameType::Message => return Ok(Some(Inbound::Message(frame.as_text()?.to_string()))),
                FrameType::Notice => return Ok(Some(Inbound::Notice(frame.as_text()?.to_string()))),
                FrameType::Error => return Ok(Some(Inbound::Error(frame.as_text()?.to_string()))),
                other => {
                    tracing::debug!(frame_type = ?other, "ignoring unsolicited frame");
                }
            }
        }
    }
}
