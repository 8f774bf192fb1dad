//! Typed directory paths and the channel namespace layout
//!
//! ```text
//! channels/{C}/meta
//! channels/{C}/offers/{P}
//! channels/{C}/answers/{P}/{R}
//! channels/{C}/candidates/{P}/{seq}
//! channels/{C}/presence/{P}
//! ```

use std::fmt;

use super::errors::{DirectoryError, DirectoryResult};
use crate::core_model::{ChannelId, ParticipantId};

pub const CHANNELS: &str = "channels";
pub const META: &str = "meta";
pub const OFFERS: &str = "offers";
pub const ANSWERS: &str = "answers";
pub const CANDIDATES: &str = "candidates";
pub const PRESENCE: &str = "presence";

/// Slash-separated key in the directory
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DirectoryPath(Vec<String>);

impl DirectoryPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse `a/b/c`. Empty segments are rejected.
    pub fn parse(s: &str) -> DirectoryResult<Self> {
        let segments: Vec<String> = s.split('/').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(DirectoryError::InvalidPath(s.to_string()));
        }
        Ok(Self(segments))
    }

    /// Append one segment
    pub fn child(&self, segment: impl AsRef<str>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.as_ref().to_string());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `prefix` is this path or one of its ancestors
    pub fn starts_with(&self, prefix: &DirectoryPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Segments after `prefix`, or `None` if `prefix` is not an ancestor
    pub fn relative_to(&self, prefix: &DirectoryPath) -> Option<&[String]> {
        self.0.strip_prefix(prefix.0.as_slice())
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }
}

impl fmt::Display for DirectoryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// Builds the paths of one channel's namespaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPaths {
    base: DirectoryPath,
}

impl ChannelPaths {
    pub fn new(channel: &ChannelId) -> Self {
        Self {
            base: DirectoryPath::root().child(CHANNELS).child(channel.as_str()),
        }
    }

    pub fn all_channels() -> DirectoryPath {
        DirectoryPath::root().child(CHANNELS)
    }

    pub fn base(&self) -> &DirectoryPath {
        &self.base
    }

    pub fn meta(&self) -> DirectoryPath {
        self.base.child(META)
    }

    pub fn offers(&self) -> DirectoryPath {
        self.base.child(OFFERS)
    }

    pub fn offer(&self, offerer: &ParticipantId) -> DirectoryPath {
        self.offers().child(offerer.as_str())
    }

    /// Answers addressed to `offerer`
    pub fn answers_for(&self, offerer: &ParticipantId) -> DirectoryPath {
        self.base.child(ANSWERS).child(offerer.as_str())
    }

    pub fn answer(&self, offerer: &ParticipantId, responder: &ParticipantId) -> DirectoryPath {
        self.answers_for(offerer).child(responder.as_str())
    }

    pub fn candidates(&self) -> DirectoryPath {
        self.base.child(CANDIDATES)
    }

    pub fn candidates_of(&self, publisher: &ParticipantId) -> DirectoryPath {
        self.candidates().child(publisher.as_str())
    }

    pub fn presence(&self) -> DirectoryPath {
        self.base.child(PRESENCE)
    }

    pub fn presence_of(&self, participant: &ParticipantId) -> DirectoryPath {
        self.presence().child(participant.as_str())
    }
}
