//! Session descriptions, candidates and track handles

use serde::{Deserialize, Serialize};

/// Which half of the negotiation a description is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Self-describing connection proposal, opaque to the signaling core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity-negotiation fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }
}

/// Handle to the captured local microphone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTrack {
    pub id: String,
    pub device: String,
}

/// Handle to an inbound audio stream, handed to the UI for playback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAudio {
    pub track_id: String,
}

/// Asynchronous notifications raised by a peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerConnectionEvent {
    /// A local candidate was gathered and should be published
    LocalCandidate(IceCandidate),
    /// The transport reports an active inbound audio track
    RemoteTrack(RemoteAudio),
}
