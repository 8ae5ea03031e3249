use crate::error::{CallError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the manual exchange this peer plays
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Caller => write!(f, "caller"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorKind {
    Offer,
    Answer,
}

impl DescriptorKind {
    /// The role that produces descriptors of this kind
    pub fn producer(self) -> Role {
        match self {
            DescriptorKind::Offer => Role::Caller,
            DescriptorKind::Answer => Role::Receiver,
        }
    }
}

/// Offer or answer session description, in the W3C
/// `{"type": ..., "sdp": ...}` shape plus the shared call id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    #[serde(rename = "type")]
    pub kind: DescriptorKind,
    pub sdp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ConnectionDescriptor {
    pub fn offer(sdp: String, id: impl Into<String>) -> Self {
        Self {
            kind: DescriptorKind::Offer,
            sdp,
            id: Some(id.into()),
        }
    }

    pub fn answer(sdp: String, id: impl Into<String>) -> Self {
        Self {
            kind: DescriptorKind::Answer,
            sdp,
            id: Some(id.into()),
        }
    }

    pub fn role(&self) -> Role {
        self.kind.producer()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.sdp.trim_start().starts_with("v=") {
            return Err(CallError::SchemaMismatch(
                "sdp must start with a version line".into(),
            ));
        }
        if matches!(&self.id, Some(id) if id.is_empty()) {
            return Err(CallError::SchemaMismatch("id must not be empty".into()));
        }
        Ok(())
    }
}

/// One connectivity path, in the W3C `RTCIceCandidateInit` shape
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectivityCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Fields parsed out of an `a=candidate` attribute line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateInfo {
    pub foundation: String,
    pub component: u16,
    pub protocol: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub kind: String,
}

impl ConnectivityCandidate {
    /// Identity used for at-most-once application on the remote side
    pub fn key(&self) -> (&str, Option<&str>, Option<u16>) {
        (
            self.candidate.trim(),
            self.sdp_mid.as_deref(),
            self.sdp_mline_index,
        )
    }

    /// candidate:<foundation> <component> <protocol> <priority> <address> <port> typ <type> ...
    pub fn info(&self) -> Result<CandidateInfo> {
        let line = self.candidate.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let line = line
            .strip_prefix("candidate:")
            .ok_or_else(|| CallError::SchemaMismatch("candidate line must start with candidate:".into()))?;

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 || fields[6] != "typ" {
            return Err(CallError::SchemaMismatch(format!(
                "incomplete candidate line: {}",
                self.candidate
            )));
        }

        let bad = |what: &str| CallError::SchemaMismatch(format!("bad {what} in candidate line"));
        Ok(CandidateInfo {
            foundation: fields[0].to_string(),
            component: fields[1].parse().map_err(|_| bad("component"))?,
            protocol: fields[2].to_ascii_lowercase(),
            priority: fields[3].parse().map_err(|_| bad("priority"))?,
            address: fields[4].to_string(),
            port: fields[5].parse().map_err(|_| bad("port"))?,
            kind: fields[7].to_string(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.sdp_mid.is_none() && self.sdp_mline_index.is_none() {
            return Err(CallError::SchemaMismatch(
                "candidate needs sdpMid or sdpMLineIndex".into(),
            ));
        }
        self.info().map(|_| ())
    }
}

/// ICE server configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}
