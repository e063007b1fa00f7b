use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::coordination::{CoordinationService, Origin};
use crate::protocol::message::{Message, Reply};

/// Which token a session authenticated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Client,
    Peer,
}

impl Channel {
    /// Maps an `AUTH` token to a channel, or `None` when it matches neither.
    pub fn from_token(token: &str, client_token: &str, peer_token: &str) -> Option<Self> {
        if token == peer_token {
            Some(Channel::Peer)
        } else if token == client_token {
            Some(Channel::Client)
        } else {
            None
        }
    }

    /// Peer-only messages are refused on client channels.
    pub fn permits(self, message: &Message) -> bool {
        match self {
            Channel::Peer => true,
            Channel::Client => matches!(
                message,
                Message::Report(_) | Message::Outage(_) | Message::ConfirmResolved { .. }
            ),
        }
    }
}

async fn writer_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = outbound.recv().await {
        let mut framed = line.into_bytes();
        framed.push(b'\n');
        if let Err(e) = writer.write_all(&framed).await {
            tracing::debug!("Session write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Runs one session: authenticate, then read lines until the peer hangs up
/// or the server shuts down.
///
/// Replies and server pushes such as `SOLVED_CHECK` share one outbound queue,
/// so they are written in order by a single writer task.
pub async fn handle_connection(
    service: Arc<CoordinationService>,
    stream: TcpStream,
    remote: SocketAddr,
    shutdown: CancellationToken,
) {
    let (reader, writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(writer_loop(writer, rx));

    let first = tokio::select! {
        _ = shutdown.cancelled() => None,
        line = tokio::time::timeout(service.auth_timeout(), lines.next_line()) => {
            line.ok().and_then(|line| line.ok()).flatten()
        }
    };

    let (client_token, peer_token) = service.tokens();
    let channel = match first.as_deref().map(Message::parse) {
        Some(Ok(Message::Auth { token })) => Channel::from_token(&token, client_token, peer_token),
        _ => None,
    };

    let Some(channel) = channel else {
        tracing::warn!("Authentication failed for {}", remote);
        let _ = tx.send(Reply::AuthFailed.to_string());
        drop(tx);
        let _ = writer_task.await;
        return;
    };
    let _ = tx.send(Reply::AuthOk.to_string());
    tracing::debug!("{} authenticated as {:?}", remote, channel);

    let session_id = service.next_session_id();
    let mut bound: HashSet<String> = HashSet::new();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Read from {} failed: {}", remote, e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message = match Message::parse(line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Malformed line from {}: {}", remote, e);
                if !line.starts_with("SYNC|") {
                    let _ = tx.send(Reply::from(e).to_string());
                }
                continue;
            }
        };

        if !channel.permits(&message) {
            let _ = tx.send(Reply::Error(format!("{}|Unauthorized", message.kind())).to_string());
            continue;
        }

        if channel == Channel::Client
            && let Some(node_id) = message.node_id()
            && !bound.contains(node_id)
        {
            service.bind_session(node_id, session_id, tx.clone());
            bound.insert(node_id.to_string());
        }

        let silent = matches!(message, Message::Sync { .. });
        let origin = match channel {
            Channel::Client => Origin::Client,
            Channel::Peer => Origin::Peer {
                remote: Some(remote.ip()),
            },
        };

        let reply = service.dispatch(message, origin).await;
        if !silent {
            let _ = tx.send(reply.to_string());
        }
    }

    for node_id in &bound {
        service.unbind_session(node_id, session_id);
    }
    drop(tx);
    let _ = writer_task.await;
    tracing::debug!("Session with {} closed", remote);
}
