use anyhow::{Context, Result};
use peer_mesh::MeshConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::debug;

// =============================================================================
// File config (figment-deserialized from defaults / tanks.toml / env vars)
// =============================================================================
//
//   tanks.toml:   [mesh]
//                 staleness_timeout_ms = 8000
//
//   env var:      TANKS_MESH__STALENESS_TIMEOUT_MS=8000   (double underscore = nesting)

pub const CONFIG_FILE: &str = "tanks.toml";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub player: PlayerFileConfig,
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
}

/// Lives under `[player]` in tanks.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlayerFileConfig {
    #[serde(default)]
    pub pseudo: Option<String>,
    #[serde(default = "default_vehicle")]
    pub vehicle: String,
}

impl Default for PlayerFileConfig {
    fn default() -> Self {
        Self {
            pseudo: None,
            vehicle: default_vehicle(),
        }
    }
}

/// Lives under `[server]` in tanks.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_vehicle() -> String {
    "tank".to_string()
}

fn default_bind() -> String {
    "0.0.0.0:4242".to_string()
}

/// Build a figment that layers: defaults → tanks.toml → TANKS_* env vars.
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join(CONFIG_FILE)))
        .merge(Env::prefixed("TANKS_").split("__"))
}

// =============================================================================
// Resolved session config (file config + CLI overrides)
// =============================================================================

/// Values the CLI may override on top of the file config.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub pseudo: Option<String>,
    pub vehicle: Option<String>,
    pub bind: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub pseudo: String,
    pub vehicle: String,
    pub bind: SocketAddr,
    pub mesh: MeshConfig,
}

impl SessionConfig {
    pub fn resolve(config_dir: &Path, overrides: Overrides) -> Result<Self> {
        let file: FileConfig = load_config(config_dir)
            .extract()
            .with_context(|| format!("Invalid configuration in {}", config_dir.display()))?;
        Self::from_file(file, overrides)
    }

    pub fn from_file(file: FileConfig, overrides: Overrides) -> Result<Self> {
        let pseudo = overrides
            .pseudo
            .or(file.player.pseudo)
            .filter(|p| !p.trim().is_empty())
            .context("A player name is required (--name or [player] pseudo)")?;
        let vehicle = overrides.vehicle.unwrap_or(file.player.vehicle);
        let bind_str = overrides.bind.unwrap_or(file.server.bind);
        let bind = bind_str
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid bind address: {bind_str}"))?;

        debug!(%pseudo, %vehicle, %bind, "resolved session config");
        Ok(Self {
            pseudo,
            vehicle,
            bind,
            mesh: file.mesh,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(pseudo: &str) -> Overrides {
        Overrides {
            pseudo: Some(pseudo.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.player.pseudo, None);
        assert_eq!(fc.player.vehicle, "tank");
        assert_eq!(fc.server.bind, "0.0.0.0:4242");
        assert_eq!(fc.mesh, MeshConfig::default());
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "[player]\npseudo = \"alice\"\n\n[mesh]\nstaleness_timeout_ms = 8000\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.player.pseudo.as_deref(), Some("alice"));
        assert_eq!(fc.mesh.staleness_timeout_ms, 8000);
        assert_eq!(fc.mesh.snapshot_interval_ms, 100);
    }

    #[test]
    fn test_invalid_toml_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "[mesh]\nstaleness_timeout_ms = \"soon\"\n",
        )
        .unwrap();
        assert!(SessionConfig::resolve(tmp.path(), named("alice")).is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = FileConfig {
            player: PlayerFileConfig {
                pseudo: Some("file".into()),
                vehicle: "light".into(),
            },
            ..Default::default()
        };
        let cfg = SessionConfig::from_file(
            file,
            Overrides {
                pseudo: Some("cli".into()),
                bind: Some("127.0.0.1:9000".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.pseudo, "cli");
        assert_eq!(cfg.vehicle, "light");
        assert_eq!(cfg.bind.port(), 9000);
    }

    #[test]
    fn test_pseudo_required() {
        assert!(SessionConfig::from_file(FileConfig::default(), Overrides::default()).is_err());
        assert!(SessionConfig::from_file(FileConfig::default(), named("   ")).is_err());
    }

    #[test]
    fn test_bad_bind_address() {
        let overrides = Overrides {
            bind: Some("not-an-addr".into()),
            ..named("alice")
        };
        assert!(SessionConfig::from_file(FileConfig::default(), overrides).is_err());
    }
}
