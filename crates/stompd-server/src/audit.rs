//! Audit trail of account and publish activity.
//!
//! The protocol driver reports events through the [`AuditLog`] trait and never
//! waits for, or learns about, the outcome. [`SqlAuditLog`] ships each event
//! to an external SQL service as one NUL-terminated statement over a fresh TCP
//! connection, from a dedicated background thread.

use std::{
    io::{self, BufRead, BufReader, Write},
    net::{SocketAddr, TcpStream},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::Sender;
use stompd_proto::FRAME_TERMINATOR;

use crate::error::ServerError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// One auditable event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    /// First login for a username created the account
    AccountCreated {
        /// Account name
        username: String,
        /// Password the account was created with
        password: String,
    },
    /// Successful login
    Login {
        /// Account name
        username: String,
    },
    /// Graceful `DISCONNECT`
    Logout {
        /// Account name
        username: String,
    },
    /// A body was published to a destination
    Published {
        /// Publisher
        username: String,
        /// Destination published to
        destination: String,
    },
}

impl AuditEvent {
    /// The SQL statement recording this event.
    pub fn to_sql(&self) -> String {
        match self {
            Self::AccountCreated { username, password } => format!(
                "INSERT INTO users (username, password) VALUES ('{}', '{}')",
                escape(username),
                escape(password)
            ),
            Self::Login { username } => {
                format!("INSERT INTO logins (username) VALUES ('{}')", escape(username))
            },
            Self::Logout { username } => format!(
                "UPDATE logins SET logout_ts=datetime('now') WHERE username='{}' AND logout_ts IS \
                 NULL ORDER BY login_ts DESC LIMIT 1",
                escape(username)
            ),
            Self::Published { username, destination } => format!(
                "INSERT INTO reported_files (username, filename, channel) VALUES ('{}', \
                 'unknown-file', '{}')",
                escape(username),
                escape(destination)
            ),
        }
    }
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

/// Sink for audit events. Recording must not block on the sink.
pub trait AuditLog: Send + Sync {
    /// Record one event. Failures are the sink's problem.
    fn record(&self, event: AuditEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAudit;

impl AuditLog for NoopAudit {
    fn record(&self, _event: AuditEvent) {}
}

/// Fire-and-forget SQL audit sink.
///
/// Dropping the sink stops accepting events, lets queued events go out and
/// joins the background thread.
#[derive(Debug)]
pub struct SqlAuditLog {
    tx: Option<Sender<AuditEvent>>,
    worker: Option<JoinHandle<()>>,
}

impl SqlAuditLog {
    /// Start the background sender for the SQL service at `addr`.
    pub fn spawn(addr: SocketAddr) -> Result<Self, ServerError> {
        let (tx, rx) = crossbeam_channel::unbounded::<AuditEvent>();

        let worker = thread::Builder::new().name("stompd-audit".to_string()).spawn(move || {
            for event in rx {
                match execute(addr, &event.to_sql()) {
                    Ok(reply) if reply.starts_with("error") => {
                        tracing::warn!(%addr, ?event, %reply, "audit statement rejected");
                    },
                    Ok(_) => tracing::trace!(?event, "audit event recorded"),
                    Err(err) => tracing::warn!(%addr, ?event, error = %err, "audit sink unreachable"),
                }
            }
        })?;

        Ok(Self { tx: Some(tx), worker: Some(worker) })
    }
}

impl AuditLog for SqlAuditLog {
    fn record(&self, event: AuditEvent) {
        if let Some(tx) = &self.tx
            && tx.send(event).is_err()
        {
            tracing::warn!("audit thread gone, event dropped");
        }
    }
}

impl Drop for SqlAuditLog {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!("audit thread panicked");
        }
    }
}

/// Send one statement and read the NUL-terminated reply.
fn execute(addr: SocketAddr, sql: &str) -> io::Result<String> {
    let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(REPLY_TIMEOUT))?;

    stream.write_all(sql.as_bytes())?;
    stream.write_all(&[FRAME_TERMINATOR])?;
    stream.flush()?;

    let mut reply = Vec::new();
    BufReader::new(stream).read_until(FRAME_TERMINATOR, &mut reply)?;
    if reply.last() == Some(&FRAME_TERMINATOR) {
        reply.pop();
    }

    Ok(String::from_utf8_lossy(&reply).into_owned())
}
