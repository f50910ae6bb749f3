use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::protocol::Frame;

/// Display name of a session that has not joined yet.
pub const UNNAMED: &str = "unnamed";

/// Longest accepted display name, in characters.
pub const MAX_NAME_LEN: usize = 32;

/// Upper bound on a single frame write to a peer. A peer that stops reading
/// for this long is treated as disconnected.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Validate a display name. Names must be 1-32 chars, contain no whitespace,
/// must not look like a command and must not be the unjoined sentinel.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name must not be empty".into());
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(format!("name too long ({} chars, max {MAX_NAME_LEN})", name.chars().count()));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(format!("name contains whitespace: {name:?}"));
    }
    if name.starts_with('/') {
        return Err(format!("name must not start with '/': {name}"));
    }
    if name == UNNAMED {
        return Err(format!("name is reserved: {name}"));
    }
    Ok(())
}

type SessionWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One connected peer.
///
/// The read half of the connection is owned by the session's router task;
/// the write half lives here behind an async mutex so that other sessions
/// and the operator can deliver frames to this peer. Clones share state.
#[derive(Clone)]
pub struct Session {
    /// Process-unique id, used for identity comparisons.
    pub id: u64,
    /// Remote endpoint of the connection.
    pub peer: SocketAddr,
    name: Arc<RwLock<Option<String>>>,
    writer: Arc<tokio::sync::Mutex<SessionWriter>>,
    /// Fires when the connection is closed. The router task selects on this
    /// so a kick or shutdown unblocks its pending read.
    pub cancelled: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Session {}

impl Session {
    /// Wrap the write half of a freshly accepted connection.
    ///
    /// `cancelled` is normally a child of the server's shutdown token.
    pub fn new<W>(peer: SocketAddr, writer: W, cancelled: CancellationToken) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            name: Arc::new(RwLock::new(None)),
            writer: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
            cancelled,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The joined name, or [`UNNAMED`] before the join completes.
    pub fn name(&self) -> String {
        self.name.read().clone().unwrap_or_else(|| UNNAMED.to_string())
    }

    pub fn is_joined(&self) -> bool {
        self.name.read().is_some()
    }

    fn joined_name(&self) -> Option<String> {
        self.name.read().clone()
    }

    /// Set the name the session will join with. Only the session's own
    /// router calls this, right before [`SessionRegistry::add`].
    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write() = Some(name.to_string());
    }

    pub(crate) fn clear_name(&self) {
        *self.name.write() = None;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write one frame to this peer.
    ///
    /// Writes from different tasks are serialized by the writer mutex, so
    /// frames never interleave on the wire.
    pub async fn send(&self, frame: &Frame) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "session is closed"));
        }
        let mut writer = self.writer.lock().await;
        tokio::time::timeout(WRITE_TIMEOUT, frame.write_to(&mut *writer))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write to peer timed out"))?
    }

    /// Close the connection. Only the first call has an effect; returns
    /// whether this call performed the close.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancelled.cancel();
        let mut writer = self.writer.lock().await;
        if let Ok(Err(e)) = tokio::time::timeout(WRITE_TIMEOUT, writer.shutdown()).await {
            tracing::debug!(session = %self.name(), ?e, "error shutting down connection");
        }
        true
    }

    /// Best-effort notice followed by [`close`](Self::close).
    pub async fn notify_and_close(&self, frame: &Frame) {
        if let Err(e) = self.send(frame).await {
            tracing::debug!(session = %self.name(), ?e, "could not deliver final notice");
        }
        self.close().await;
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("name already taken: {0}")]
    NameTaken(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("no client at index {index} ({len} connected)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("server is shutting down")]
    Closed,
}

/// One row of a roster snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    /// 1-based position, as shown to operators and accepted by kick.
    pub index: usize,
    pub name: String,
    pub peer: SocketAddr,
}

impl fmt::Display for MemberInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>3}. {} | {}", self.index, self.name, self.peer)
    }
}

struct RegistryInner {
    members: Vec<Session>,
    closed: bool,
}

/// The joined sessions, in join order.
///
/// Every operation takes the one registry lock for its whole duration and
/// never awaits while holding it. Network writes happen after the lock is
/// released, on member handles captured under it: a stalled peer delays
/// only the task writing to it, never the registry.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                members: Vec::new(),
                closed: false,
            })),
        }
    }

    /// **Advisory** check used to answer `/isNameTaken`.
    ///
    /// Another session may claim the name between this check and its own
    /// join; [`add`](Self::add) re-checks under the same lock acquisition
    /// that appends, and that is the check that upholds uniqueness.
    pub fn try_claim_name(&self, name: &str) -> bool {
        let inner = self.inner.lock();
        inner.members.iter().any(|s| s.joined_name().as_deref() == Some(name))
    }

    /// Append a joined session, returning its 1-based position.
    ///
    /// The session must already carry its name. Validation, the uniqueness
    /// check and the append form one critical section, so two concurrent
    /// joins with the same name cannot both succeed.
    pub fn add(&self, session: Session) -> Result<usize, RegistryError> {
        let name = session
            .joined_name()
            .ok_or_else(|| RegistryError::InvalidName(UNNAMED.to_string()))?;
        validate_name(&name).map_err(RegistryError::InvalidName)?;

        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(RegistryError::Closed);
        }
        if inner.members.iter().any(|s| s.joined_name().as_deref() == Some(name.as_str())) {
            return Err(RegistryError::NameTaken(name));
        }
        inner.members.push(session);
        Ok(inner.members.len())
    }

    /// Remove the member at a 1-based position. Survivors keep their
    /// relative order. The caller notifies and closes the returned session.
    pub fn remove_by_index(&self, index: usize) -> Result<Session, RegistryError> {
        let mut inner = self.inner.lock();
        let len = inner.members.len();
        if index == 0 || index > len {
            return Err(RegistryError::IndexOutOfRange { index, len });
        }
        Ok(inner.members.remove(index - 1))
    }

    /// Remove a session if it is still a member. Removing a session that is
    /// not present is a no-op, which covers a self-initiated exit racing an
    /// operator kick. Returns whether anything was removed.
    pub fn remove_by_session(&self, session: &Session) -> bool {
        let mut inner = self.inner.lock();
        match inner.members.iter().position(|s| s.id == session.id) {
            Some(pos) => {
                inner.members.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Look up a joined session by name.
    pub fn find_by_name(&self, name: &str) -> Option<Session> {
        let inner = self.inner.lock();
        inner
            .members
            .iter()
            .find(|s| s.joined_name().as_deref() == Some(name))
            .cloned()
    }

    /// Copy of the roster in join order.
    pub fn snapshot_names(&self) -> Vec<MemberInfo> {
        let inner = self.inner.lock();
        inner
            .members
            .iter()
            .enumerate()
            .map(|(i, s)| MemberInfo {
                index: i + 1,
                name: s.name(),
                peer: s.peer,
            })
            .collect()
    }

    /// Run `f` once per member while holding the lock. `f` must not block.
    pub fn for_each(&self, mut f: impl FnMut(&Session)) {
        let inner = self.inner.lock();
        for session in &inner.members {
            f(session);
        }
    }

    /// Deliver `frame` to every current member, returning how many
    /// deliveries succeeded.
    ///
    /// Members are captured under the lock and written to after it is
    /// released, concurrently. A member whose write fails is removed and
    /// closed; the others still receive the frame.
    pub async fn broadcast(&self, frame: &Frame) -> usize {
        let mut targets = Vec::new();
        self.for_each(|s| targets.push(s.clone()));

        let results = futures::future::join_all(targets.iter().map(|s| s.send(frame))).await;

        let mut delivered = 0;
        for (session, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(session = %session.name(), ?e, "broadcast delivery failed, dropping client");
                    self.remove_by_session(session);
                    session.close().await;
                }
            }
        }
        delivered
    }

    /// Mark the registry closed and take every member out of it.
    ///
    /// After this, [`add`](Self::add) fails with [`RegistryError::Closed`].
    pub fn drain(&self) -> Vec<Session> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        std::mem::take(&mut inner.members)
    }

    /// Drain the registry, then send `notice` to and close every former
    /// member. Returns how many sessions were closed.
    pub async fn close_all(&self, notice: &Frame) -> usize {
        let sessions = self.drain();
        futures::future::join_all(sessions.iter().map(|s| s.notify_and_close(notice))).await;
        sessions.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
