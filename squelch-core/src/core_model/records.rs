//! JSON records stored under the channel namespaces
//!
//! Field names are camelCase on the wire so that records written by other
//! clients of the same directory (including browser ones) parse unchanged.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{OfferEpoch, ParticipantId};
use crate::core_media::{IceCandidate, SessionDescription};

/// Encode/decode helpers shared by every directory record
pub trait Record: Serialize + DeserializeOwned + Sized {
    fn encode(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    fn decode(value: &Value) -> serde_json::Result<Self> {
        Self::deserialize(value)
    }
}

/// `channels/{C}/meta`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMeta {
    pub name: String,
    #[serde(default)]
    pub is_private: bool,
}

impl ChannelMeta {
    pub fn public(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_private: false,
        }
    }

    pub fn private(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_private: true,
        }
    }

    /// Name as shown in channel pickers; private channels get a star
    pub fn display_name(&self) -> String {
        if self.is_private {
            format!("★ {}", self.name)
        } else {
            self.name.clone()
        }
    }
}

impl Record for ChannelMeta {}

/// `channels/{C}/presence/{P}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub label: String,
    pub joined_at_millis: i64,
}

impl PresenceRecord {
    pub fn now(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            joined_at_millis: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl Record for PresenceRecord {}

/// `channels/{C}/offers/{P}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferRecord {
    pub epoch: OfferEpoch,
    pub description: SessionDescription,
}

impl Record for OfferRecord {}

/// `channels/{C}/answers/{P}/{R}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRecord {
    pub offer_epoch: OfferEpoch,
    pub description: SessionDescription,
}

impl Record for AnswerRecord {}

/// One entry of `channels/{C}/candidates/{P}`.
///
/// `target` is `None` when the publisher is the offerer (every listener of
/// `offer_epoch` may use it) and names the offerer when a listener publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub offer_epoch: OfferEpoch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ParticipantId>,
    pub candidate: IceCandidate,
}

impl Record for CandidateRecord {}
