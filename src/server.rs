//! TCP accept loop.
//!
//! Each accepted connection becomes an unjoined [`Session`] whose router
//! task reads its commands. The loop runs until the `cancel` token fires,
//! then closes every remaining member and waits for all router tasks to
//! finish.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::catalog::Catalog;
use crate::config::ServerConfig;
use crate::protocol::{Frame, FrameType};
use crate::router::{self, RouterContext};
use crate::session::{Session, SessionRegistry};

/// Settings the accept loop needs beyond the listener itself.
#[derive(Clone)]
pub struct ServeOptions {
    pub catalog: Arc<Catalog>,
    pub accept_poll: Duration,
    pub max_payload: u32,
    pub join_timeout: Option<Duration>,
}

impl ServeOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            catalog: Arc::new(config.messages.clone()),
            accept_poll: config.accept_poll(),
            max_payload: config.max_payload,
            join_timeout: config.join_timeout(),
        }
    }
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Bind the listener. Failure here is fatal to the server.
pub async fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "relay server listening");
    Ok(listener)
}

/// Accept connections until `cancel` fires.
///
/// Accept errors other than shutdown are logged and the loop continues.
/// On shutdown, members still registered receive the shutdown notice and
/// are closed; unjoined connections are closed through their child tokens.
pub async fn serve(
    listener: TcpListener,
    registry: SessionRegistry,
    options: ServeOptions,
    cancel: CancellationToken,
) -> io::Result<()> {
    let ctx = RouterContext {
        registry: registry.clone(),
        catalog: options.catalog.clone(),
        max_payload: options.max_payload,
        join_timeout: options.join_timeout,
    };
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("accept loop received cancel signal");
                break;
            }
            result = tokio::time::timeout(options.accept_poll, listener.accept()) => {
                match result {
                    // Poll interval elapsed with no connection.
                    Err(_) => continue,
                    Ok(Ok((stream, peer))) => {
                        let session = start_session(stream, peer, &ctx, &tracker, &cancel);
                        tracing::info!(peer = %peer, id = session.id, "client connected");
                    }
                    Ok(Err(e)) => {
                        tracing::error!(?e, "failed to accept connection");
                        // Backoff to prevent tight loop under sustained accept errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    drop(listener);
    let notice = Frame::text(FrameType::Notice, options.catalog.shutdown.clone());
    let closed = registry.close_all(&notice).await;

    tracker.close();
    tracker.wait().await;
    tracing::info!(closed, "relay server stopped");
    Ok(())
}

fn start_session(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: &RouterContext,
    tracker: &TaskTracker,
    cancel: &CancellationToken,
) -> Session {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(?e, "failed to set TCP_NODELAY");
    }
    let (reader, writer) = stream.into_split();
    let session = Session::new(peer, writer, cancel.child_token());
    tracker.spawn(router::run_session(reader, session.clone(), ctx.clone()));
    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, FrameCodec, REPLY_OK};
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::FramedRead;

    async fn start() -> (SocketAddr, SessionRegistry, CancellationToken, tokio::task::JoinHandle<io::Result<()>>) {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = SessionRegistry::new();
        let cancel = CancellationToken::new();
        let options = ServeOptions {
            accept_poll: Duration::from_millis(50),
            ..ServeOptions::default()
        };
        let handle = tokio::spawn(serve(listener, registry.clone(), options, cancel.clone()));
        (addr, registry, cancel, handle)
    }

    #[tokio::test]
    async fn accepted_connection_can_join() {
        let (addr, registry, cancel, handle) = start().await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut frames = FramedRead::new(reader, FrameCodec::default());

        Frame::command(&Command::SetName("alice".to_string()))
            .write_to(&mut writer)
            .await
            .unwrap();
        let reply = frames.next().await.unwrap().unwrap();
        assert_eq!(reply.as_text().unwrap(), REPLY_OK);
        assert_eq!(registry.snapshot_names()[0].name, "alice");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_closes_unjoined_and_joined_connections() {
        let (addr, registry, cancel, handle) = start().await;

        let idle = TcpStream::connect(addr).await.unwrap();
        let (idle_reader, _idle_writer) = idle.into_split();
        let mut idle_frames = FramedRead::new(idle_reader, FrameCodec::default());

        let joined = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = joined.into_split();
        let mut frames = FramedRead::new(reader, FrameCodec::default());
        Frame::command(&Command::SetName("bob".to_string()))
            .write_to(&mut writer)
            .await
            .unwrap();
        assert_eq!(frames.next().await.unwrap().unwrap().as_text().unwrap(), REPLY_OK);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("serve should return after cancel")
            .unwrap()
            .unwrap();

        assert!(registry.is_empty());
        assert!(idle_frames.next().await.is_none());
        // The joined client may or may not see the notice depending on which
        // close won; either way its stream ends.
        while let Some(Ok(_)) = frames.next().await {}
        writer.shutdown().await.ok();
    }

    #[tokio::test]
    async fn client_hanging_up_before_join_leaves_no_trace() {
        let (addr, registry, cancel, handle) = start().await;

        let stream = TcpStream::connect(addr).await.unwrap();
        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.is_empty());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
