use crate::error::{Error, Result};
use crate::framer::DEFAULT_MAX_MESSAGE_SIZE;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// How decoded messages are printed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub max_message_size: usize,
    pub format: OutputFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Observe Mongo's standard port locally
            listen_addr: "127.0.0.1:27017".to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            format: OutputFormat::Text,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Priority: explicit file (MONGOWIRE_CONFIG) or ./config.toml → env → defaults
        let path = std::env::var("MONGOWIRE_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
        let cfg = if Path::new(&path).exists() {
            Self::load_from(&path)?
        } else {
            Config::default()
        };
        cfg.with_env_overrides()
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        toml::from_str::<Config>(&contents)
            .map_err(|e| Error::Msg(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Apply `MONGOWIRE_*` environment variables on top of file values.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(addr) = std::env::var("MONGOWIRE_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(max) = std::env::var("MONGOWIRE_MAX_MESSAGE_SIZE") {
            self.max_message_size = max
                .parse()
                .map_err(|e| Error::Msg(format!("Invalid MONGOWIRE_MAX_MESSAGE_SIZE {max:?}: {e}")))?;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = std::env::temp_dir().join(format!("mongowire-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        fs::write(&path, "format = \"json\"\nmax_message_size = 1024\n").unwrap();

        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.format, OutputFormat::Json);
        assert_eq!(cfg.max_message_size, 1024);
        assert_eq!(cfg.listen_addr, "127.0.0.1:27017");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn bad_file_is_an_error() {
        let dir = std::env::temp_dir().join(format!("mongowire-badconfig-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        fs::write(&path, "format = 7\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Msg(_))));
        fs::remove_dir_all(&dir).ok();
    }
}
