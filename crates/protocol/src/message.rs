//! Envelope and message body definitions

use burrow_crypto::EncryptionType;
use rkyv::{Archive, Deserialize, Serialize};
use uuid::Uuid;

/// Which side of the tunnel a message body belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Agent,
    Proxy,
}

/// A fresh random id for a logical request (connect, data chunk, heartbeat).
pub fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

/// The outer wire record: shared token, cipher tag and a typed body.
///
/// The token is an opaque shared credential and is never empty; the
/// encryption type determines how the serialized body was transformed
/// before it was placed in the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub token: String,
    pub encryption: EncryptionType,
    pub body: MessageBody,
}

impl Envelope {
    pub fn agent(token: impl Into<String>, encryption: EncryptionType, body: AgentBody) -> Self {
        Self {
            token: token.into(),
            encryption,
            body: MessageBody::Agent(body),
        }
    }

    pub fn proxy(token: impl Into<String>, encryption: EncryptionType, body: ProxyBody) -> Self {
        Self {
            token: token.into(),
            encryption,
            body: MessageBody::Proxy(body),
        }
    }
}

/// Tagged union over the two body variants.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub enum MessageBody {
    Agent(AgentBody),
    Proxy(ProxyBody),
}

impl MessageBody {
    pub fn kind(&self) -> BodyKind {
        match self {
            MessageBody::Agent(_) => BodyKind::Agent,
            MessageBody::Proxy(_) => BodyKind::Proxy,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            MessageBody::Agent(body) => &body.id,
            MessageBody::Proxy(body) => &body.id,
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub enum AgentBodyType {
    Connect,
    Data,
    Heartbeat,
    Disconnect,
}

/// Body sent from the agent toward the proxy.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct AgentBody {
    /// Unique per logical request. A `Connect` carries the session id.
    pub id: String,
    pub body_type: AgentBodyType,
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
    pub payload: Option<Vec<u8>>,
}

impl AgentBody {
    /// Open a tunnel session toward `host:port`. The id becomes the
    /// session's client-connection id on both sides.
    pub fn connect(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            body_type: AgentBodyType::Connect,
            target_host: Some(host.into()),
            target_port: Some(port),
            payload: None,
        }
    }

    pub fn data(payload: Vec<u8>) -> Self {
        Self {
            id: fresh_id(),
            body_type: AgentBodyType::Data,
            target_host: None,
            target_port: None,
            payload: Some(payload),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            id: fresh_id(),
            body_type: AgentBodyType::Heartbeat,
            target_host: None,
            target_port: None,
            payload: None,
        }
    }

    pub fn disconnect() -> Self {
        Self {
            id: fresh_id(),
            body_type: AgentBodyType::Disconnect,
            target_host: None,
            target_port: None,
            payload: None,
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub enum ProxyBodyType {
    ConnectSuccess,
    ConnectFailure,
    Data,
    Heartbeat,
    Disconnect,
}

/// Body sent from the proxy toward the agent.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct ProxyBody {
    pub id: String,
    pub body_type: ProxyBodyType,
    pub payload: Option<Vec<u8>>,
}

impl ProxyBody {
    /// Confirm that the target connection for the session succeeded.
    pub fn connect_success(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body_type: ProxyBodyType::ConnectSuccess,
            payload: None,
        }
    }

    pub fn connect_failure(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body_type: ProxyBodyType::ConnectFailure,
            payload: None,
        }
    }

    pub fn data(payload: Vec<u8>) -> Self {
        Self {
            id: fresh_id(),
            body_type: ProxyBodyType::Data,
            payload: Some(payload),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            id: fresh_id(),
            body_type: ProxyBodyType::Heartbeat,
            payload: None,
        }
    }

    pub fn disconnect() -> Self {
        Self {
            id: fresh_id(),
            body_type: ProxyBodyType::Disconnect,
            payload: None,
        }
    }
}
