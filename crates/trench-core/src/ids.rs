//! Branded ID newtypes for type safety.
//!
//! Every entity the chat core touches has a distinct ID type implemented as a
//! newtype wrapper around `String`. This prevents accidentally passing a
//! conversation ID where a user ID is expected.
//!
//! Generated IDs are UUID v7 (time-ordered) via [`uuid::Uuid::now_v7`].
//! IDs arriving from the wire go through `parse`, which only accepts UUIDs
//! and normalizes them to the lowercase hyphenated form.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Generate a new UUID v7 string (time-ordered).
fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Parse an untrusted string. Returns `None` unless it is a UUID.
            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(|u| Self(u.to_string()))
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u.to_string())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Authenticated marketplace user.
    UserId
}

branded_id! {
    /// Chat conversation (a broadcast group).
    ConversationId
}

branded_id! {
    /// Persisted chat message.
    MessageId
}

branded_id! {
    /// Message attachment.
    AttachmentId
}

branded_id! {
    /// One physical WebSocket connection.
    ConnectionId
}

branded_id! {
    /// Marketplace contract a conversation may be bound to.
    ContractId
}

branded_id! {
    /// Marketplace job a conversation may be bound to.
    JobId
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
