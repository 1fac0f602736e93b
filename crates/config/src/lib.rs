use std::collections::BTreeMap;
use std::fs::{read_to_string, write};

use camino::Utf8Path;
use eyre::{Result as EyreResult, WrapErr};
use serde::{Deserialize, Serialize};
use strata_transfer_primitives::config::StateTransferConfig;
use strata_transfer_primitives::PeerId;

pub mod hints;

pub const CONFIG_FILE: &str = "config.toml";

/// How [`ConfigFile::render`] lays out the configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Toml,
    Json,
}

#[derive(Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct ConfigFile {
    /// Name this member goes by in the group
    pub identity: PeerId,

    #[serde(default)]
    pub state_transfer: StateTransferConfig,
}

impl ConfigFile {
    #[must_use]
    pub const fn new(identity: PeerId, state_transfer: StateTransferConfig) -> Self {
        Self {
            identity,
            state_transfer,
        }
    }

    #[must_use]
    pub fn exists(dir: &Utf8Path) -> bool {
        dir.join(CONFIG_FILE).is_file()
    }

    pub fn load(dir: &Utf8Path) -> EyreResult<Self> {
        let path = dir.join(CONFIG_FILE);
        let content = read_to_string(&path)
            .wrap_err_with(|| format!("failed to read configuration from {path:?}"))?;

        toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse configuration in {path:?}"))
    }

    pub fn save(&self, dir: &Utf8Path) -> EyreResult<()> {
        let path = dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self)?;

        write(&path, content)
            .wrap_err_with(|| format!("failed to write configuration to {path:?}"))?;

        Ok(())
    }

    /// Writes the file only if its content would change. Returns whether it
    /// was written.
    pub fn save_if_changed(&self, dir: &Utf8Path) -> EyreResult<bool> {
        let path = dir.join(CONFIG_FILE);
        let new_content = toml::to_string_pretty(self)?;

        let changed = match read_to_string(&path) {
            Ok(existing) => existing != new_content,
            Err(_) => true,
        };

        if changed {
            write(&path, new_content)
                .wrap_err_with(|| format!("failed to write configuration to {path:?}"))?;
        }

        Ok(changed)
    }

    pub fn render(&self, format: OutputFormat) -> EyreResult<String> {
        let rendered = match format {
            OutputFormat::Toml => toml::to_string_pretty(self)?,
            OutputFormat::Json => serde_json::to_string_pretty(self)?,
        };

        Ok(rendered)
    }

    /// Every key [`get_value`](Self::get_value) answers, with its current value.
    #[must_use]
    pub fn values(&self) -> BTreeMap<&'static str, String> {
        hints::CONFIG_HINTS
            .iter()
            .filter_map(|hint| Some((hint.key, self.get_value(hint.key)?)))
            .collect()
    }

    /// Get the value for a specific config key
    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<String> {
        let transfer = &self.state_transfer;
        let socket = &transfer.socket;

        let value = match key {
            "identity" => self.identity.to_string(),
            "state_transfer.transport" => transfer.transport.to_string(),
            "state_transfer.chunk_size" => transfer.chunk_size.to_string(),
            "state_transfer.buffer_size" => transfer.buffer_size.to_string(),
            "state_transfer.digest" => transfer.digest.to_string(),
            "state_transfer.socket.bind_addr" => socket.bind_addr.to_string(),
            "state_transfer.socket.bind_port" => socket.bind_port.to_string(),
            "state_transfer.socket.socket_buffer_size" => socket.socket_buffer_size.to_string(),
            "state_transfer.socket.max_pool" => socket.max_pool.to_string(),
            "state_transfer.socket.pool_keep_alive_ms" => {
                socket.pool_keep_alive.as_millis().to_string()
            }
            "state_transfer.socket.rendezvous_timeout_ms" => {
                socket.rendezvous_timeout.as_millis().to_string()
            }
            "state_transfer.socket.acceptor_shutdown_wait_ms" => {
                socket.acceptor_shutdown_wait.as_millis().to_string()
            }
            "state_transfer.socket.pool_shutdown_wait_ms" => {
                socket.pool_shutdown_wait.as_millis().to_string()
            }
            _ => return None,
        };

        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use strata_transfer_primitives::config::TransportKind;
    use tempfile::TempDir;

    use super::*;

    fn temp_home() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_save_then_load() {
        let (_dir, home) = temp_home();
        assert!(!ConfigFile::exists(&home), "nothing saved yet");

        let mut transfer = StateTransferConfig::default();
        transfer.transport = TransportKind::Socket;
        transfer.socket.max_pool = 2;

        let config = ConfigFile::new(PeerId::from("node-1"), transfer);
        config.save(&home).unwrap();
        assert!(ConfigFile::exists(&home), "file written");

        let loaded = ConfigFile::load(&home).unwrap();
        assert_eq!(loaded.identity, PeerId::from("node-1"), "identity survives");
        assert_eq!(
            loaded.state_transfer.transport,
            TransportKind::Socket,
            "transport survives"
        );
        assert_eq!(loaded.state_transfer.socket.max_pool, 2, "pool size survives");

        assert!(!loaded.save_if_changed(&home).unwrap(), "unchanged file is left alone");
    }

    #[test]
    fn test_state_transfer_section_is_optional() {
        let (_dir, home) = temp_home();
        write(home.join(CONFIG_FILE), "identity = \"node-2\"\n").unwrap();

        let loaded = ConfigFile::load(&home).unwrap();

        assert_eq!(
            loaded.get_value("state_transfer.transport").as_deref(),
            Some("in-band"),
            "in-band by default"
        );
        assert_eq!(
            loaded
                .get_value("state_transfer.socket.rendezvous_timeout_ms")
                .as_deref(),
            Some("20000"),
            "rendezvous timeout default"
        );
        assert_eq!(loaded.get_value("no.such.key"), None, "unknown keys have no value");
    }

    #[test]
    fn test_every_hinted_key_has_a_value() {
        let config = ConfigFile::new(PeerId::from("node-3"), StateTransferConfig::default());

        assert_eq!(
            config.values().len(),
            hints::CONFIG_HINTS.len(),
            "hints and values cover the same keys"
        );
    }

    #[test]
    fn test_load_reports_the_path() {
        let (_dir, home) = temp_home();

        let err = ConfigFile::load(&home).unwrap_err();

        assert!(
            format!("{err:#}").contains(CONFIG_FILE),
            "error names the missing file"
        );
    }
}
