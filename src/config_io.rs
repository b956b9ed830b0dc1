use crate::config::{Config, ConfigError};
use std::path::Path;

pub type Result<T> = std::result::Result<T, ConfigIoError>;

pub const CONFIG_PATH_ENV: &str = "VPN_FLEET_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug)]
pub enum ConfigIoError {
    CreateDefault {
        path: String,
        source: Box<ConfigIoError>,
    },
    Read {
        path: String,
        source: std::io::Error,
    },
    ParseToml {
        path: String,
        source: toml::de::Error,
    },
    SerializeToml {
        source: toml::ser::Error,
    },
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    Write {
        path: String,
        source: std::io::Error,
    },
    Invalid {
        path: String,
        source: ConfigError,
    },
}

impl std::fmt::Display for ConfigIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateDefault { path, .. } => {
                write!(f, "failed to create default config at {path}")
            }
            Self::Read { path, .. } => write!(f, "failed reading config file {path}"),
            Self::ParseToml { path, .. } => write!(f, "invalid TOML in {path}"),
            Self::SerializeToml { .. } => write!(f, "failed serializing config to TOML"),
            Self::CreateDir { path, .. } => write!(f, "failed creating directory {path}"),
            Self::Write { path, .. } => write!(f, "failed writing config file {path}"),
            Self::Invalid { path, source } => write!(f, "invalid fleet config in {path}: {source}"),
        }
    }
}

impl std::error::Error for ConfigIoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CreateDefault { source, .. } => Some(source.as_ref()),
            Self::Read { source, .. } => Some(source),
            Self::ParseToml { source, .. } => Some(source),
            Self::SerializeToml { source } => Some(source),
            Self::CreateDir { source, .. } => Some(source),
            Self::Write { source, .. } => Some(source),
            Self::Invalid { source, .. } => Some(source),
        }
    }
}

/// Resolves the config path from `VPN_FLEET_CONFIG`, falling back to `config.toml`.
pub fn config_path_from_env() -> String {
    std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}

pub async fn load_or_create_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();

    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        let default_cfg: Config = Config::default();
        save_config(path, &default_cfg)
            .await
            .map_err(|source| ConfigIoError::CreateDefault {
                path: path.display().to_string(),
                source: Box::new(source),
            })?;
        return Ok(default_cfg);
    }

    let content: String =
        tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigIoError::Read {
                path: path.display().to_string(),
                source,
            })?;

    let cfg: Config = toml::from_str(&content).map_err(|source| ConfigIoError::ParseToml {
        path: path.display().to_string(),
        source,
    })?;

    Ok(cfg)
}

/// Loads the file, layers environment overrides on top and validates the fleet pairing.
pub async fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let mut cfg = load_or_create_config(path).await?;
    cfg.apply_env_overrides();
    cfg.fleet
        .validate()
        .map_err(|source| ConfigIoError::Invalid {
            path: path.display().to_string(),
            source,
        })?;
    Ok(cfg)
}

pub async fn save_config(path: impl AsRef<Path>, cfg: &Config) -> Result<()> {
    let path = path.as_ref();

    let toml_string =
        toml::to_string_pretty(cfg).map_err(|source| ConfigIoError::SerializeToml { source })?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ConfigIoError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
    }

    tokio::fs::write(path, toml_string)
        .await
        .map_err(|source| ConfigIoError::Write {
            path: path.display().to_string(),
            source,
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("vpn-fleet-config-{tag}-{nanos}/config.toml"))
    }

    #[tokio::test]
    async fn missing_config_is_created_with_defaults() {
        let path = temp_path("create");
        let cfg = load_or_create_config(&path).await.expect("load");
        assert_eq!(cfg.gateway.port, Config::default().gateway.port);
        assert!(path.exists());

        let again = load_or_create_config(&path).await.expect("reload");
        assert_eq!(again.worker.id, cfg.worker.id);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn invalid_toml_is_reported_with_path() {
        let path = temp_path("bad");
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, "gateway = [").await.unwrap();
        let err = load_or_create_config(&path).await.unwrap_err();
        assert!(matches!(err, ConfigIoError::ParseToml { .. }));
        assert!(err.to_string().contains("config.toml"));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
