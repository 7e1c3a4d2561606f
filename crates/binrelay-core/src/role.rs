//! Terminal roles.
//!
//! Exactly two kinds of terminal talk to the hub: the camera/microphone unit
//! mounted on the bin, and the AR assistant headset. On the wire they are
//! named `camera` and `ar`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Bin-side terminal (camera frames, optionally microphone/speaker).
    #[serde(rename = "camera")]
    Bin,
    /// AR/assistant terminal.
    #[serde(rename = "ar")]
    Assistant,
}

impl Role {
    pub const ALL: [Self; 2] = [Self::Bin, Self::Assistant];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bin => "camera",
            Self::Assistant => "ar",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "camera" => Ok(Self::Bin),
            "ar" => Ok(Self::Assistant),
            other => Err(Error::InvalidRole(other.to_string())),
        }
    }
}
