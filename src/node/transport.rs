//! Direct calls to individual store members.
//!
//! [`RespTransport`] speaks RESP2 over TCP. [`ExecTransport`] runs the CLI
//! inside the member's container, which is how TLS-enabled members are
//! reached. [`RoutingTransport`] picks between the two per target.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::error::{Error, Result};
use crate::platform::Platform;

/// Decoded reply of a direct call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Integer(i64),
    Bulk(String),
    Array(Vec<Reply>),
    Nil,
}

impl Reply {
    /// Text payload of a status or bulk reply.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Reply::Status(s) | Reply::Bulk(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            Reply::Bulk(s) | Reply::Status(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Text payload, or a protocol error naming the command.
    pub fn into_text(self, command: &str) -> Result<String> {
        match self {
            Reply::Status(s) | Reply::Bulk(s) => Ok(s),
            other => Err(Error::Protocol(format!(
                "unexpected reply to {command}: {other:?}"
            ))),
        }
    }
}

/// Where and how to reach one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    /// Pod IP, or a resolvable hostname.
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// CA bundle path inside the container when TLS is enabled.
    pub tls_ca: Option<String>,
}

impl NodeTarget {
    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Issue one command against one member.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn call(&self, target: &NodeTarget, argv: &[String]) -> Result<Reply>;
}

/// Command name for logs and errors; never includes arguments.
fn command_name(argv: &[String]) -> String {
    argv.iter()
        .take(2)
        .map(|s| s.to_ascii_uppercase())
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// RESP over TCP
// ============================================================================

/// RESP2 client opening one connection per call.
#[derive(Debug, Clone, Default)]
pub struct RespTransport;

impl RespTransport {
    pub fn new() -> Self {
        Self
    }

    async fn roundtrip(framed: &mut Framed<TcpStream, Resp2>, argv: &[String]) -> Result<Reply> {
        let command = command_name(argv);
        framed
            .send(make_command(argv))
            .await
            .map_err(|e| Error::Protocol(format!("{command}: {e}")))?;

        match framed.next().await {
            Some(Ok(frame)) => frame_to_reply(frame).map_err(|reason| Error::Command { command, reason }),
            Some(Err(e)) => Err(Error::Protocol(format!("{command}: {e}"))),
            None => Err(Error::Protocol(format!("{command}: connection closed"))),
        }
    }
}

#[async_trait]
impl NodeTransport for RespTransport {
    async fn call(&self, target: &NodeTarget, argv: &[String]) -> Result<Reply> {
        let socket = TcpStream::connect(target.address()).await?;
        socket.set_nodelay(true).ok();
        let mut framed = Framed::new(socket, Resp2::default());

        if let Some(password) = &target.password {
            Self::roundtrip(&mut framed, &["AUTH".to_string(), password.clone()]).await?;
        }

        tracing::trace!(pod = %target.pod, command = %command_name(argv), "Direct call");
        Self::roundtrip(&mut framed, argv).await
    }
}

/// Build a RESP command frame.
fn make_command(argv: &[String]) -> BytesFrame {
    BytesFrame::Array(
        argv.iter()
            .map(|arg| BytesFrame::BulkString(Bytes::from(arg.clone().into_bytes())))
            .collect(),
    )
}

/// Convert a RESP frame; error frames become `Err` with the server message.
fn frame_to_reply(frame: BytesFrame) -> std::result::Result<Reply, String> {
    Ok(match frame {
        BytesFrame::SimpleString(s) => Reply::Status(String::from_utf8_lossy(&s).into_owned()),
        BytesFrame::BulkString(s) => Reply::Bulk(String::from_utf8_lossy(&s).into_owned()),
        BytesFrame::Integer(n) => Reply::Integer(n),
        BytesFrame::Null => Reply::Nil,
        BytesFrame::Error(e) => return Err(e.to_string()),
        BytesFrame::Array(items) => Reply::Array(
            items
                .into_iter()
                .map(frame_to_reply)
                .collect::<std::result::Result<_, _>>()?,
        ),
    })
}

// ============================================================================
// CLI over exec
// ============================================================================

/// Runs the store CLI inside the target container. Replies come back as
/// [`Reply::Bulk`] text; structured replies are not reconstructed.
pub struct ExecTransport {
    platform: Arc<dyn Platform>,
    binary: String,
}

impl ExecTransport {
    pub fn new(platform: Arc<dyn Platform>, binary: impl Into<String>) -> Self {
        Self {
            platform,
            binary: binary.into(),
        }
    }

    /// Full command line: connection flags, then auth/TLS, then `argv`.
    pub fn command_line(&self, target: &NodeTarget, argv: &[String]) -> Vec<String> {
        let mut cmd = vec![
            self.binary.clone(),
            "-h".to_string(),
            target.host.clone(),
            "-p".to_string(),
            target.port.to_string(),
        ];
        if let Some(password) = &target.password {
            cmd.push("-a".to_string());
            cmd.push(password.clone());
        }
        if let Some(ca) = &target.tls_ca {
            cmd.extend(["--tls".to_string(), "--cacert".to_string(), ca.clone(), "--insecure".to_string()]);
        }
        cmd.extend(argv.iter().cloned());
        cmd
    }
}

#[async_trait]
impl NodeTransport for ExecTransport {
    async fn call(&self, target: &NodeTarget, argv: &[String]) -> Result<Reply> {
        let command = command_name(argv);
        let output = self
            .platform
            .exec(
                &target.namespace,
                &target.pod,
                &target.container,
                &self.command_line(target, argv),
            )
            .await?;

        let text = output.stdout.trim_end().to_string();
        if text.starts_with("ERR") || text.starts_with("(error)") {
            return Err(Error::Command {
                command,
                reason: text,
            });
        }
        Ok(Reply::Bulk(text))
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Sends TLS targets through one transport and everything else through the
/// other.
pub struct RoutingTransport {
    plain: Arc<dyn NodeTransport>,
    tls: Arc<dyn NodeTransport>,
}

impl RoutingTransport {
    pub fn new(plain: Arc<dyn NodeTransport>, tls: Arc<dyn NodeTransport>) -> Self {
        Self { plain, tls }
    }
}

#[async_trait]
impl NodeTransport for RoutingTransport {
    async fn call(&self, target: &NodeTarget, argv: &[String]) -> Result<Reply> {
        if target.tls_ca.is_some() {
            self.tls.call(target, argv).await
        } else {
            self.plain.call(target, argv).await
        }
    }
}
