//! Operator actions on the running server.
//!
//! These run on their own task, concurrently with every session router, and
//! go through [`SessionRegistry`] like everything else.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::protocol::{Frame, FrameType};
use crate::session::{MemberInfo, RegistryError, SessionRegistry};

/// A parsed operator console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    List,
    Kick(usize),
    Broadcast(String),
    Help,
    Close,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdminError {
    #[error("unknown command: {0}; type /help to list the available commands")]
    UnknownCommand(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl AdminCommand {
    pub fn parse(line: &str) -> Result<Self, AdminError> {
        let line = line.trim();
        let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));
        match keyword {
            "/list" => Ok(Self::List),
            "/help" => Ok(Self::Help),
            "/close" => Ok(Self::Close),
            "/kick" => rest
                .trim()
                .parse::<usize>()
                .map(Self::Kick)
                .map_err(|_| AdminError::Usage("/kick <client index>")),
            "/msg" => {
                if rest.is_empty() {
                    Err(AdminError::Usage("/msg <message>"))
                } else {
                    Ok(Self::Broadcast(rest.to_string()))
                }
            }
            other => Err(AdminError::UnknownCommand(other.to_string())),
        }
    }
}

/// Operator handle on the server.
#[derive(Clone)]
pub struct Admin {
    registry: SessionRegistry,
    catalog: Arc<Catalog>,
    cancel: CancellationToken,
}

impl Admin {
    /// `cancel` is the token the accept loop was started with.
    pub fn new(registry: SessionRegistry, catalog: Arc<Catalog>, cancel: CancellationToken) -> Self {
        Self {
            registry,
            catalog,
            cancel,
        }
    }

    pub fn list(&self) -> Vec<MemberInfo> {
        self.registry.snapshot_names()
    }

    /// Roster as printed on the console: one line per member with its
    /// 1-based index and remote endpoint.
    pub fn render_list(&self) -> String {
        let members = self.list();
        if members.is_empty() {
            return self.catalog.no_clients.clone();
        }
        let mut out = self.catalog.roster_header.clone();
        for member in members {
            out.push('\n');
            out.push_str(&member.to_string());
        }
        out
    }

    /// Remove the member at a 1-based index, tell it, and close it.
    pub async fn kick(&self, index: usize) -> Result<MemberInfo, AdminError> {
        let session = self.registry.remove_by_index(index)?;
        let info = MemberInfo {
            index,
            name: session.name(),
            peer: session.peer,
        };
        session
            .notify_and_close(&Frame::text(FrameType::Notice, self.catalog.kicked.clone()))
            .await;
        tracing::info!(session = %info.name, peer = %info.peer, index, "client kicked");
        Ok(info)
    }

    /// Send a server-labelled message to every member. Returns the number
    /// of members reached.
    pub async fn broadcast(&self, text: &str) -> usize {
        let frame = Frame::text(FrameType::Message, self.catalog.server_message(text));
        let delivered = self.registry.broadcast(&frame).await;
        tracing::info!(delivered, "operator broadcast");
        delivered
    }

    /// Stop the server: no further joins, every member gets the shutdown
    /// notice and is closed, then the accept loop is cancelled.
    pub async fn shutdown(&self) -> usize {
        let notice = Frame::text(FrameType::Notice, self.catalog.shutdown.clone());
        let closed = self.registry.close_all(&notice).await;
        self.cancel.cancel();
        tracing::info!(closed, "server shutdown requested");
        closed
    }

    pub fn help(&self) -> &str {
        &self.catalog.help
    }

    /// Execute one command, returning the console output for it.
    pub async fn execute(&self, command: AdminCommand) -> String {
        match command {
            AdminCommand::List => self.render_list(),
            AdminCommand::Kick(index) => match self.kick(index).await {
                Ok(info) => self.catalog.kick_report(info.index, &info.name),
                Err(e) => format!("Error: {e}"),
            },
            AdminCommand::Broadcast(text) => {
                let delivered = self.broadcast(&text).await;
                self.catalog.broadcast_report(delivered)
            }
            AdminCommand::Help => self.help().to_string(),
            AdminCommand::Close => {
                let closed = self.shutdown().await;
                self.catalog.close_report(closed)
            }
        }
    }

    /// Operator console loop.
    ///
    /// Reads lines from `lines`, writes results to `out`. Bad input is
    /// reported and the loop continues. Ends after `/close`, when the input
    /// ends, or when the server is shut down by other means.
    pub async fn run_console<W>(&self, mut lines: mpsc::Receiver<String>, mut out: W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = lines.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
            };
            if line.trim().is_empty() {
                continue;
            }

            let (output, close) = match AdminCommand::parse(&line) {
                Ok(command) => {
                    let close = command == AdminCommand::Close;
                    (self.execute(command).await, close)
                }
                Err(e) => (e.to_string(), false),
            };
            out.write_all(output.as_bytes()).await?;
            out.write_all(b"\n").await?;
            out.flush().await?;
            if close {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::joined_session;
    use futures::StreamExt;

    fn admin() -> (Admin, SessionRegistry, CancellationToken) {
        let registry = SessionRegistry::new();
        let cancel = CancellationToken::new();
        let admin = Admin::new(registry.clone(), Arc::new(Catalog::default()), cancel.clone());
        (admin, registry, cancel)
    }

    #[test]
    fn parse_operator_commands() {
        assert_eq!(AdminCommand::parse("/list").unwrap(), AdminCommand::List);
        assert_eq!(AdminCommand::parse("/kick 3").unwrap(), AdminCommand::Kick(3));
        assert_eq!(
            AdminCommand::parse("/msg hello  everyone").unwrap(),
            AdminCommand::Broadcast("hello  everyone".to_string())
        );
        assert_eq!(AdminCommand::parse("/help").unwrap(), AdminCommand::Help);
        assert_eq!(AdminCommand::parse("/close").unwrap(), AdminCommand::Close);
    }

    #[test]
    fn parse_operator_errors() {
        assert_eq!(
            AdminCommand::parse("/kick two"),
            Err(AdminError::Usage("/kick <client index>"))
        );
        assert_eq!(AdminCommand::parse("/kick"), Err(AdminError::Usage("/kick <client index>")));
        assert_eq!(AdminCommand::parse("/msg"), Err(AdminError::Usage("/msg <message>")));
        assert_eq!(
            AdminCommand::parse("/reboot"),
            Err(AdminError::UnknownCommand("/reboot".to_string()))
        );
    }

    #[tokio::test]
    async fn render_list_shows_index_name_and_endpoint() {
        let (admin, registry, _cancel) = admin();
        assert_eq!(admin.render_list(), Catalog::default().no_clients);

        let _a = joined_session(&registry, "a", 8001);
        let _b = joined_session(&registry, "b", 8002);
        let listing = admin.render_list();
        assert!(listing.contains("  1. a | 127.0.0.1:8001"));
        assert!(listing.contains("  2. b | 127.0.0.1:8002"));
    }

    #[tokio::test]
    async fn kick_notifies_and_closes_the_indexed_member() {
        let (admin, registry, _cancel) = admin();
        let (_a, _ra) = joined_session(&registry, "a", 8003);
        let (b, mut rb) = joined_session(&registry, "b", 8004);
        let (_c, _rc) = joined_session(&registry, "c", 8005);

        let info = admin.kick(2).await.unwrap();
        assert_eq!(info.name, "b");

        let frame = rb.next().await.unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Notice);
        assert_eq!(frame.as_text().unwrap(), Catalog::default().kicked);
        assert!(rb.next().await.is_none());
        assert!(b.is_closed());

        let names: Vec<String> = admin.list().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn kick_out_of_range_changes_nothing() {
        let (admin, registry, _cancel) = admin();
        let _a = joined_session(&registry, "a", 8006);

        let err = admin.kick(5).await.unwrap_err();
        assert_eq!(
            err,
            AdminError::Registry(RegistryError::IndexOutOfRange { index: 5, len: 1 })
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn broadcast_is_server_labelled() {
        let (admin, registry, _cancel) = admin();
        let (_a, mut ra) = joined_session(&registry, "a", 8007);
        let (_b, mut rb) = joined_session(&registry, "b", 8008);

        assert_eq!(admin.broadcast("maintenance at noon").await, 2);
        for rx in [&mut ra, &mut rb] {
            let frame = rx.next().await.unwrap().unwrap();
            assert_eq!(frame.frame_type, FrameType::Message);
            assert_eq!(frame.as_text().unwrap(), "Server: maintenance at noon");
        }
    }

    #[tokio::test]
    async fn shutdown_closes_everyone_and_cancels() {
        let (admin, registry, cancel) = admin();
        let (a, mut ra) = joined_session(&registry, "a", 8009);

        assert_eq!(admin.shutdown().await, 1);
        let frame = ra.next().await.unwrap().unwrap();
        assert_eq!(frame.as_text().unwrap(), Catalog::default().shutdown);
        assert!(a.is_closed());
        assert!(registry.is_closed());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn console_reports_errors_and_stops_on_close() {
        let (admin, registry, cancel) = admin();
        let _a = joined_session(&registry, "a", 8010);

        let (tx, rx) = mpsc::channel(8);
        for line in ["/kick 9", "/bogus", "", "/list", "/close", "/list"] {
            tx.send(line.to_string()).await.unwrap();
        }

        let mut out = Vec::new();
        admin.run_console(rx, &mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.contains("Error: no client at index 9 (1 connected)"));
        assert!(out.contains("unknown command: /bogus"));
        assert!(out.contains("  1. a | 127.0.0.1:8010"));
        assert!(out.contains("Server is closing, 1 client(s) disconnected."));
        // The console stopped at /close: the trailing /list was not run.
        assert_eq!(out.matches("Clients connected").count(), 1);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn console_output_uses_catalog_text() {
        let registry = SessionRegistry::new();
        let cancel = CancellationToken::new();
        let catalog = Catalog {
            roster_header: "Clientes conectados:".to_string(),
            kick_report: "Cliente {index} ({name}) expulsado.".to_string(),
            broadcast_report: "Mensaje enviado a {count} cliente(s).".to_string(),
            ..Catalog::default()
        };
        let admin = Admin::new(registry.clone(), Arc::new(catalog), cancel);
        let (_a, _ra) = joined_session(&registry, "a", 8011);
        let (_b, _rb) = joined_session(&registry, "b", 8012);

        assert!(admin.render_list().starts_with("Clientes conectados:\n"));
        assert_eq!(
            admin.execute(AdminCommand::Broadcast("hola".to_string())).await,
            "Mensaje enviado a 2 cliente(s)."
        );
        assert_eq!(admin.execute(AdminCommand::Kick(2)).await, "Cliente 2 (b) expulsado.");
    }
}
