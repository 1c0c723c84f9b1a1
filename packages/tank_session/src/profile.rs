use peer_mesh::{ConfigError, Metadata};
use serde::{Deserialize, Serialize};

/// Metadata every player announces when connecting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub pseudo: String,
    /// Vehicle variant, shown to other players.
    #[serde(rename = "type", default)]
    pub vehicle: String,
}

impl Profile {
    pub fn new(pseudo: impl Into<String>, vehicle: impl Into<String>) -> Self {
        Self {
            pseudo: pseudo.into(),
            vehicle: vehicle.into(),
        }
    }

    /// Name to show for a peer, falling back to a short uuid prefix for
    /// peers whose metadata we never received.
    pub fn display_name(&self, uuid: &str) -> String {
        if self.pseudo.is_empty() {
            uuid.chars().take(8).collect()
        } else {
            self.pseudo.clone()
        }
    }
}

impl Metadata for Profile {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.pseudo.trim().is_empty() {
            return Err(ConfigError::MissingMetadata("pseudo".into()));
        }
        Ok(())
    }
}
