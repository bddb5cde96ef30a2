//! The fixed set of per-pairing topics and their broker destinations.

use std::fmt;

/// A logical channel scoped to one pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Chat,
    E2eeChat,
    ReadReceipt,
    Typing,
    Schedule,
    Bucket,
    Finance,
}

impl Topic {
    /// Every topic the client subscribes to on connect.
    pub const ALL: [Topic; 7] = [
        Topic::Chat,
        Topic::E2eeChat,
        Topic::ReadReceipt,
        Topic::Typing,
        Topic::Schedule,
        Topic::Bucket,
        Topic::Finance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::E2eeChat => "e2ee",
            Self::ReadReceipt => "read",
            Self::Typing => "typing",
            Self::Schedule => "schedule",
            Self::Bucket => "bucket",
            Self::Finance => "finance",
        }
    }

    /// Where the broker delivers this topic's messages.
    pub fn subscribe_destination(&self, pairing_id: &str) -> String {
        match self {
            Self::Chat => format!("/topic/pairing/{pairing_id}"),
            other => format!("/topic/pairing/{pairing_id}/{}", other.as_str()),
        }
    }

    /// Where the client publishes on this topic.
    pub fn publish_destination(&self, pairing_id: &str) -> String {
        match self {
            Self::Chat => format!("/app/chat/{pairing_id}"),
            Self::E2eeChat | Self::ReadReceipt | Self::Typing => {
                format!("/app/chat/{pairing_id}/{}", self.as_str())
            }
            Self::Schedule | Self::Bucket | Self::Finance => {
                format!("/app/sync/{pairing_id}/{}", self.as_str())
            }
        }
    }

    /// The SUBSCRIBE id; the broker echoes it on every MESSAGE.
    pub fn subscription_id(&self) -> String {
        format!("sub-{}", self.as_str())
    }

    pub fn from_subscription_id(id: &str) -> Option<Self> {
        let name = id.strip_prefix("sub-")?;
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    pub fn from_destination(destination: &str, pairing_id: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.subscribe_destination(pairing_id) == destination)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
