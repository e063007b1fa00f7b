use chrono::{DateTime, NaiveDateTime, Utc};
use std::fmt;
use thiserror::Error;

use crate::membership::types::ServerId;
use crate::store::types::{EventId, NodeReport, NodeStatus};

pub const ACK_REPORT: &str = "ACK_REPORT";
pub const ACK_OUTAGE: &str = "ACK_OUTAGE";
pub const STATUS_RESTORED: &str = "STATUS_RESTORED";
pub const JOINED: &str = "JOINED";

/// Pushed to a field node's open session when HQ wants it to re-check a fault.
pub const SOLVED_CHECK: &str = "SOLVED_CHECK";

/// An `OUTAGE` event as carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OutageNotice {
    pub event_id: EventId,
    pub node_id: String,
    pub event_type: String,
    /// `None` when the sender's timestamp could not be parsed.
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: String,
}

impl OutageNotice {
    pub fn is_start(&self) -> bool {
        self.event_type.eq_ignore_ascii_case("OUTAGE_START")
    }

    pub fn is_end(&self) -> bool {
        self.event_type.eq_ignore_ascii_case("OUTAGE_END")
    }
}

/// One line of the session protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Auth {
        token: String,
    },
    Report(NodeReport),
    Outage(OutageNotice),
    ConfirmResolved {
        node_id: String,
    },
    Join {
        server_id: ServerId,
        host: String,
        port: u16,
    },
    Status {
        node_id: String,
        status: NodeStatus,
    },
    VerifyRelay {
        node_id: String,
    },
    /// Peer-channel wrapper around a replicated message.
    Sync {
        clock: Option<i64>,
        inner: Box<Message>,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("{kind}: expected {expected} fields, found {found}")]
    MissingFields {
        kind: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{kind}: invalid {field} '{value}'")]
    InvalidField {
        kind: &'static str,
        field: &'static str,
        value: String,
    },
}

impl ProtocolError {
    /// Code sent back in `ERR|<code>`.
    pub fn reply_code(&self) -> String {
        match self {
            ProtocolError::Empty => "Empty".to_string(),
            ProtocolError::UnknownType(_) => "UnknownType".to_string(),
            ProtocolError::MissingFields { kind, .. } | ProtocolError::InvalidField { kind, .. } => {
                format!("{}|BadFormat", kind)
            }
        }
    }
}

fn require(kind: &'static str, parts: &[&str], expected: usize) -> Result<(), ProtocolError> {
    if parts.len() < expected {
        return Err(ProtocolError::MissingFields {
            kind,
            expected,
            found: parts.len(),
        });
    }
    Ok(())
}

fn field<T: std::str::FromStr>(
    kind: &'static str,
    name: &'static str,
    raw: &str,
) -> Result<T, ProtocolError> {
    raw.trim().parse().map_err(|_| ProtocolError::InvalidField {
        kind,
        field: name,
        value: raw.to_string(),
    })
}

/// Accepts RFC 3339 or a zone-less ISO date-time (read as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

impl Message {
    pub fn parse(line: &str) -> Result<Message, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let (kind, rest) = match line.split_once('|') {
            Some((kind, rest)) => (kind, Some(rest)),
            None => (line, None),
        };

        match kind.trim().to_uppercase().as_str() {
            "AUTH" => Ok(Message::Auth {
                token: rest.unwrap_or_default().trim().to_string(),
            }),
            "REPORT" => {
                let parts: Vec<&str> = line.split('|').collect();
                require("REPORT", &parts, 4)?;

                let region = parts
                    .get(4)
                    .map(|r| r.trim())
                    .filter(|r| !r.is_empty())
                    .unwrap_or("Unknown");

                Ok(Message::Report(NodeReport {
                    node_id: parts[1].trim().to_string(),
                    voltage: field("REPORT", "voltage", parts[2])?,
                    power_state: field("REPORT", "powerState", parts[3])?,
                    region: region.to_string(),
                }))
            }
            "OUTAGE" => {
                let parts: Vec<&str> = line.splitn(6, '|').collect();
                require("OUTAGE", &parts, 6)?;

                Ok(Message::Outage(OutageNotice {
                    event_id: EventId(parts[1].trim().to_string()),
                    node_id: parts[2].trim().to_string(),
                    event_type: parts[3].trim().to_string(),
                    timestamp: parse_timestamp(parts[4]),
                    metadata: parts[5].to_string(),
                }))
            }
            "CONFIRM_RESOLVED" => {
                let parts: Vec<&str> = line.split('|').collect();
                require("CONFIRM_RESOLVED", &parts, 2)?;
                Ok(Message::ConfirmResolved {
                    node_id: parts[1].trim().to_string(),
                })
            }
            "JOIN" => {
                let parts: Vec<&str> = line.split('|').collect();
                require("JOIN", &parts, 4)?;
                Ok(Message::Join {
                    server_id: ServerId(field("JOIN", "serverId", parts[1])?),
                    host: parts[2].trim().to_string(),
                    port: field("JOIN", "port", parts[3])?,
                })
            }
            "STATUS" => {
                let parts: Vec<&str> = line.split('|').collect();
                require("STATUS", &parts, 3)?;
                Ok(Message::Status {
                    node_id: parts[1].trim().to_string(),
                    status: field("STATUS", "status", parts[2])?,
                })
            }
            "VERIFY_RELAY" => {
                let parts: Vec<&str> = line.split('|').collect();
                require("VERIFY_RELAY", &parts, 2)?;
                Ok(Message::VerifyRelay {
                    node_id: parts[1].trim().to_string(),
                })
            }
            "SYNC" => {
                let rest = rest.ok_or(ProtocolError::MissingFields {
                    kind: "SYNC",
                    expected: 2,
                    found: 1,
                })?;

                let (clock, inner_line) = match rest.split_once('|') {
                    Some((stamp, inner)) => match stamp.trim().parse::<i64>() {
                        Ok(clock) => (Some(clock), inner),
                        Err(_) => (None, rest),
                    },
                    None => (None, rest),
                };

                let inner = Message::parse(inner_line)?;
                if matches!(inner, Message::Sync { .. } | Message::Auth { .. }) {
                    return Err(ProtocolError::InvalidField {
                        kind: "SYNC",
                        field: "payload",
                        value: inner_line.to_string(),
                    });
                }

                Ok(Message::Sync {
                    clock,
                    inner: Box::new(inner),
                })
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "AUTH",
            Message::Report(_) => "REPORT",
            Message::Outage(_) => "OUTAGE",
            Message::ConfirmResolved { .. } => "CONFIRM_RESOLVED",
            Message::Join { .. } => "JOIN",
            Message::Status { .. } => "STATUS",
            Message::VerifyRelay { .. } => "VERIFY_RELAY",
            Message::Sync { .. } => "SYNC",
        }
    }

    /// Node the message is about, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Message::Report(report) => Some(&report.node_id),
            Message::Outage(notice) => Some(&notice.node_id),
            Message::ConfirmResolved { node_id }
            | Message::Status { node_id, .. }
            | Message::VerifyRelay { node_id } => Some(node_id),
            Message::Sync { inner, .. } => inner.node_id(),
            Message::Auth { .. } | Message::Join { .. } => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Auth { token } => write!(f, "AUTH|{}", token),
            Message::Report(report) => write!(
                f,
                "REPORT|{}|{}|{}|{}",
                report.node_id, report.voltage, report.power_state, report.region
            ),
            Message::Outage(notice) => write!(
                f,
                "OUTAGE|{}|{}|{}|{}|{}",
                notice.event_id,
                notice.node_id,
                notice.event_type,
                notice
                    .timestamp
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_default(),
                notice.metadata
            ),
            Message::ConfirmResolved { node_id } => write!(f, "CONFIRM_RESOLVED|{}", node_id),
            Message::Join {
                server_id,
                host,
                port,
            } => write!(f, "JOIN|{}|{}|{}", server_id, host, port),
            Message::Status { node_id, status } => write!(f, "STATUS|{}|{}", node_id, status),
            Message::VerifyRelay { node_id } => write!(f, "VERIFY_RELAY|{}", node_id),
            Message::Sync {
                clock: Some(clock),
                inner,
            } => write!(f, "SYNC|{}|{}", clock, inner),
            Message::Sync { clock: None, inner } => write!(f, "SYNC|{}", inner),
        }
    }
}

/// Server reply to one request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    AuthOk,
    AuthFailed,
    Ok,
    Ack(&'static str),
    /// Accepted but the store could not persist it.
    AckNotPersisted(&'static str),
    Error(String),
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        !matches!(self, Reply::AuthFailed | Reply::Error(_))
    }
}

impl From<ProtocolError> for Reply {
    fn from(error: ProtocolError) -> Self {
        Reply::Error(error.reply_code())
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::AuthOk => write!(f, "AUTH_OK"),
            Reply::AuthFailed => write!(f, "ERR|AUTH_FAILED"),
            Reply::Ok => write!(f, "OK"),
            Reply::Ack(what) => write!(f, "OK|{}", what),
            Reply::AckNotPersisted(what) => write!(f, "OK|{}|NOT_PERSISTED", what),
            Reply::Error(code) => write!(f, "ERR|{}", code),
        }
    }
}
