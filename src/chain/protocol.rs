use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Chain gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not connected")]
    NotConnected,

    #[error("request timed out: {0}")]
    Timeout(&'static str),

    #[error("subscription lost")]
    SubscriptionLost,

    /// The server refused a broadcast; the reason string drives the
    /// coordinator's recovery policy.
    #[error("broadcast rejected: {0}")]
    Rejected(String),
}

pub type ChainResult<T> = Result<T, ChainError>;

/// RPC method names spoken to the chain server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMethod {
    /// blockchain.transaction.get
    TransactionGet,
    /// blockchain.transaction.broadcast
    TransactionBroadcast,
    /// blockchain.ref.get
    RefGet,
    /// blockchain.scripthash.subscribe
    ScriptHashSubscribe,
    /// blockchain.scripthash.unsubscribe
    ScriptHashUnsubscribe,
    /// blockchain.scripthash.listunspent
    ScriptHashListUnspent,
    /// server.ping
    Ping,
}

impl ChainMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransactionGet => "blockchain.transaction.get",
            Self::TransactionBroadcast => "blockchain.transaction.broadcast",
            Self::RefGet => "blockchain.ref.get",
            Self::ScriptHashSubscribe => "blockchain.scripthash.subscribe",
            Self::ScriptHashUnsubscribe => "blockchain.scripthash.unsubscribe",
            Self::ScriptHashListUnspent => "blockchain.scripthash.listunspent",
            Self::Ping => "server.ping",
        }
    }
}

impl std::fmt::Display for ChainMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outgoing JSON-RPC request line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

impl RpcRequest {
    pub fn new(id: u64, method: ChainMethod, params: Vec<Value>) -> Self {
        Self { id, method: method.as_str().to_string(), params }
    }

    /// Serialize to a newline-terminated JSON string.
    pub fn to_json_line(&self) -> ChainResult<String> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{}\n", json))
    }
}

/// Incoming line: either a reply to one of our requests (`id` set) or a
/// server-initiated notification (`method` set, `id` absent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Vec<Value>>,
}

impl RpcResponse {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    /// Flatten the error field into a reason string.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| match e {
            Value::String(s) => s.clone(),
            other => other
                .get("message")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_with_newline() {
        let req = RpcRequest::new(7, ChainMethod::Ping, vec![]);
        let line = req.to_json_line().unwrap();
        assert!(line.contains("server.ping"));
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_response_classification() {
        let reply: RpcResponse =
            serde_json::from_str(r#"{"id":1,"result":"00"}"#).unwrap();
        assert!(!reply.is_notification());
        assert!(!reply.is_error());

        let notification: RpcResponse = serde_json::from_str(
            r#"{"method":"blockchain.scripthash.subscribe","params":["ab","cd"]}"#,
        )
        .unwrap();
        assert!(notification.is_notification());
    }

    #[test]
    fn test_error_message_flattening() {
        let flat: RpcResponse =
            serde_json::from_str(r#"{"id":1,"error":"missing inputs"}"#).unwrap();
        assert_eq!(flat.error_message().unwrap(), "missing inputs");

        let nested: RpcResponse = serde_json::from_str(
            r#"{"id":2,"error":{"code":-26,"message":"txn-mempool-conflict"}}"#,
        )
        .unwrap();
        assert_eq!(nested.error_message().unwrap(), "txn-mempool-conflict");
    }
}
