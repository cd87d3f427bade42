//! Common identifier types used throughout the SFU implementation
//!
//! Rooms and connections are addressed by id everywhere; tables own the
//! records and callers only ever hold the ids.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of one control-channel connection
    ConnectionId
);

string_id!(
    /// Identifier of a room (the stream identifier, supplied by callers)
    RoomId
);

string_id!(
    /// Identifier of a media transport
    TransportId
);

string_id!(
    /// Identifier of a published track (producer)
    TrackId
);

string_id!(
    /// Identifier of a consumer
    ConsumerId
);

impl ConnectionId {
    /// Generate a fresh connection id
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(12))
    }
}

impl TransportId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl TrackId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl ConsumerId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let room = RoomId::from("r1");
        assert_eq!(serde_json::to_string(&room).unwrap(), "\"r1\"");

        let back: RoomId = serde_json::from_str("\"r1\"").unwrap();
        assert_eq!(back, room);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(ConnectionId::generate(), ConnectionId::generate());
        assert_ne!(TrackId::generate(), TrackId::generate());
        assert_eq!(ConnectionId::generate().as_str().len(), 12);
    }
}
