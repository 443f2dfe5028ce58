use serde::{Deserialize, Serialize};

use crate::errors::RelayError;

/// Declared role of a connection, taken from the handshake `type` parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Controller-primary: the desktop dashboard.
    Home,
    /// Controller-secondary: the mobile control app.
    Mobile,
    /// Passive display (OBS browser source).
    Overlay,
}

impl Role {
    /// Classify a handshake `type` value. Absent or empty defaults to
    /// [`Role::Overlay`]; anything else unrecognized is rejected.
    pub fn from_handshake(raw: Option<&str>) -> Result<Self, RelayError> {
        match raw {
            None | Some("") => Ok(Self::Overlay),
            Some(s) => s.parse(),
        }
    }

    pub fn is_controller(self) -> bool {
        matches!(self, Self::Home | Self::Mobile)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Home => "home",
            Self::Mobile => "mobile",
            Self::Overlay => "overlay",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = RelayError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "home" => Ok(Self::Home),
            "mobile" => Ok(Self::Mobile),
            "overlay" => Ok(Self::Overlay),
            other => Err(RelayError::UnknownRole(other.to_string())),
        }
    }
}
