pub mod bedrock;
pub mod java;

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Game-server family, which selects the ping protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    /// Java edition, TCP server-list ping.
    #[serde(alias = "PC", alias = "pc")]
    Java,
    /// Bedrock edition, RakNet unconnected ping.
    #[serde(alias = "PE", alias = "pe")]
    Bedrock,
}

impl ServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Java => "java",
            Self::Bedrock => "bedrock",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Java => java::DEFAULT_PORT,
            Self::Bedrock => bedrock::DEFAULT_PORT,
        }
    }
}

/// Where and how to ping one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingTarget {
    pub address: String,
    pub port: u16,
    pub kind: ServerKind,
}

/// Raw ping response, before clamping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingResponse {
    pub player_count: i64,
    pub protocol_version: Option<i32>,
    pub favicon: Option<String>,
}

/// Errors for a single server ping. None of these are fatal to a round.
#[derive(Error, Debug)]
pub enum PingError {
    #[error("connecting to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("ping exceeded scheduler deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("decoding status json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ping task failed: {0}")]
    Aborted(String),
}

/// Request/response contract for a ping collaborator.
pub trait Pinger: Send + Sync {
    /// Pings `target`, honouring `timeout` for the whole exchange.
    fn ping(
        &self,
        target: &PingTarget,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<PingResponse, PingError>> + Send;
}

/// Pinger that speaks the real game protocols.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtocolPinger;

impl Pinger for ProtocolPinger {
    async fn ping(
        &self,
        target: &PingTarget,
        timeout: Duration,
    ) -> Result<PingResponse, PingError> {
        match target.kind {
            ServerKind::Java => java::ping(&target.address, target.port, timeout).await,
            ServerKind::Bedrock => bedrock::ping(&target.address, target.port, timeout).await,
        }
    }
}

/// Keeps a favicon only if it is an image data URI.
pub fn sanitize_favicon(favicon: Option<String>) -> Option<String> {
    favicon.filter(|f| f.starts_with("data:image/"))
}
