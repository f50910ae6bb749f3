//! User-facing text sent to clients and printed on the operator console.
//!
//! The defaults are English. Any field can be overridden from the
//! `[messages]` table of the server config, which is how a translated
//! deployment is produced without touching the routing code.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    /// Sender label on operator broadcasts (`"<label>: <text>"`).
    pub server_label: String,
    pub kicked: String,
    pub shutdown: String,
    /// Routing miss. `{target}` is replaced with the requested name.
    pub not_connected: String,
    pub self_target: String,
    pub join_first: String,
    /// `{name}` is replaced with the session's current name.
    pub already_joined: String,
    pub no_clients: String,
    /// Relayed text would not fit in one frame. `{limit}` is the payload
    /// limit in bytes.
    pub message_too_long: String,
    pub help: String,
    /// Console header printed above the roster.
    pub roster_header: String,
    /// `{index}` and `{name}` identify the kicked client.
    pub kick_report: String,
    /// `{count}` is the number of clients reached.
    pub broadcast_report: String,
    /// `{count}` is the number of clients disconnected.
    pub close_report: String,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            server_label: "Server".to_string(),
            kicked: "You have been kicked out of the server.".to_string(),
            shutdown: "Server has been closed, all clients have been disconnected.".to_string(),
            not_connected: "You are trying to send a message to {target}, who is not connected \
                            or doesn't exist. Type /list to see which clients are connected."
                .to_string(),
            self_target: "You can't send messages to yourself.".to_string(),
            join_first: "Choose a name with /setName before using other commands.".to_string(),
            already_joined: "You already joined as {name}; names can't be changed.".to_string(),
            no_clients: "There are no clients connected.".to_string(),
            message_too_long: "Message not sent: it is longer than the {limit} byte limit.".to_string(),
            help: "Available commands:\n\
                   /list - List connected clients.\n\
                   /kick <index> - Kick a client.\n\
                   /msg <message> - Send a message to all clients.\n\
                   /help - Show this help.\n\
                   /close - Close the server (disconnects all clients first)."
                .to_string(),
            roster_header: "Clients connected (index. name | endpoint):".to_string(),
            kick_report: "Client {index} ({name}) kicked.".to_string(),
            broadcast_report: "Message sent to {count} client(s).".to_string(),
            close_report: "Server is closing, {count} client(s) disconnected.".to_string(),
        }
    }
}

impl Catalog {
    pub fn not_connected(&self, target: &str) -> String {
        self.not_connected.replace("{target}", target)
    }

    pub fn already_joined(&self, name: &str) -> String {
        self.already_joined.replace("{name}", name)
    }

    pub fn message_too_long(&self, limit: u32) -> String {
        self.message_too_long.replace("{limit}", &limit.to_string())
    }

    pub fn kick_report(&self, index: usize, name: &str) -> String {
        self.kick_report
            .replace("{index}", &index.to_string())
            .replace("{name}", name)
    }

    pub fn broadcast_report(&self, count: usize) -> String {
        self.broadcast_report.replace("{count}", &count.to_string())
    }

    pub fn close_report(&self, count: usize) -> String {
        self.close_report.replace("{count}", &count.to_string())
    }

    /// Format an operator broadcast.
    pub fn server_message(&self, text: &str) -> String {
        format!("{}: {}", self.server_label, text)
    }
}
