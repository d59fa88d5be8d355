//! Signaling wire types
//!
//! JSON messages exchanged on the `/api/ws/webrtc` socket. Field names
//! follow the browser conventions (`roomId`, `clientId`, `sdpMid`) because
//! the viewer side is a WebRTC client talking to the broker directly.

use serde::{Deserialize, Serialize};

/// Role a peer takes inside a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Broadcaster,
    #[default]
    Viewer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Broadcaster => write!(f, "broadcaster"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}

/// ICE candidate as carried on the signaling socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// One room member as reported to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSummary {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub role: Role,
}

/// Signaling message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    /// Broker greeting carrying the connection id
    #[serde(rename = "registered")]
    Registered {
        #[serde(rename = "clientId")]
        client_id: String,
    },

    #[serde(rename = "join")]
    Join {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(default)]
        role: Role,
    },

    #[serde(rename = "joined")]
    Joined {
        #[serde(rename = "roomId")]
        room_id: String,
        role: Role,
        clients: Vec<ClientSummary>,
    },

    #[serde(rename = "leave")]
    Leave {
        #[serde(rename = "roomId")]
        room_id: String,
    },

    #[serde(rename = "left")]
    Left {
        #[serde(rename = "roomId")]
        room_id: String,
    },

    /// SDP offer, forwarded verbatim with the sender's id inserted
    #[serde(rename = "offer")]
    Offer {
        target: String,
        #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        sdp: String,
        #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// SDP answer, forwarded verbatim with the sender's id inserted
    #[serde(rename = "answer")]
    Answer {
        target: String,
        #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        sdp: String,
        #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Trickled ICE candidate, forwarded verbatim with the sender's id inserted
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        target: String,
        #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        candidate: IceCandidateInit,
        #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    #[serde(rename = "client-joined")]
    ClientJoined {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "clientId")]
        client_id: String,
        role: Role,
    },

    #[serde(rename = "client-left")]
    ClientLeft {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "clientId")]
        client_id: String,
    },

    #[serde(rename = "get-room-info")]
    GetRoomInfo {
        #[serde(rename = "roomId")]
        room_id: String,
    },

    #[serde(rename = "room-info")]
    RoomInfo {
        #[serde(rename = "roomId")]
        room_id: String,
        clients: Vec<ClientSummary>,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

impl SignalMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Aggregate room counters for the inspection endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomOverview {
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "totalClients")]
    pub total_clients: usize,
    pub broadcasters: usize,
    pub viewers: usize,
}
