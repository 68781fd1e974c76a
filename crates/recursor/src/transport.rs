//! The injected "ask one server" primitive.
//!
//! The engine never touches a socket. Each upstream exchange — build the
//! query, send it, wait with a timeout, parse the reply — is delegated to an
//! implementation of [`AskTransport`]; the engine only assumes the call
//! suspends and resumes with an [`AskReply`].

use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;

use crate::proto::op::Message;
use crate::proto::rr::{Name, RecordType};

/// How one upstream exchange ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AskStatus {
    /// A parsed response came back.
    Success,
    /// Nothing came back in time.
    Timeout,
    /// The network said no: unreachable, connection refused, TCP reset.
    NetworkError,
    /// A response arrived that could not have come from the queried server.
    Spoofed,
    /// The operating system refused the attempt (fd or buffer exhaustion).
    OsLimit,
}

/// Per-attempt knobs for an upstream query.
#[derive(Clone, Debug, Default)]
pub struct AskOptions {
    /// Use TCP instead of UDP.
    pub tcp: bool,
    /// Set the RD bit (only done when forwarding to a recursing upstream).
    pub send_rd: bool,
    /// Attach an OPT record (EDNS0 level 1).
    pub edns: bool,
    /// Optional EDNS Client Subnet source to attach.
    pub ecs: Option<IpNet>,
}

/// The transport's verdict plus the parsed response, if any.
#[derive(Clone, Debug)]
pub struct AskReply {
    /// Transport-level outcome.
    pub status: AskStatus,
    /// The parsed response; present only on `Success`.
    pub message: Option<Message>,
    /// True when this query was answered by piggy-backing on another
    /// identical in-flight query instead of hitting the wire.
    pub chained: bool,
}

impl AskReply {
    /// A successful reply carrying `message`.
    pub fn success(message: Message) -> Self {
        Self {
            status: AskStatus::Success,
            message: Some(message),
            chained: false,
        }
    }

    /// A reply that is just a status, no message.
    pub fn status(status: AskStatus) -> Self {
        Self {
            status,
            message: None,
            chained: false,
        }
    }
}

/// One-shot async query primitive against a single upstream server.
#[async_trait]
pub trait AskTransport: Send + Sync {
    /// Send `(qname, qtype)` to `server` and await the outcome.
    async fn ask(
        &self,
        server: IpAddr,
        qname: &Name,
        qtype: RecordType,
        options: &AskOptions,
    ) -> AskReply;
}
