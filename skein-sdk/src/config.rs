//! Persistent configuration and the live settings store.
//!
//! The config file lives at `~/.config/skein/config.toml`. Every section and
//! field has a default, so a partial (or missing) file is valid.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::client::ConnectConfig;
use crate::dcc::DccPolicy;
use crate::error::ConfigError;
use crate::flow::FlowConfig;
use crate::hub::{Hub, Subscription};
use crate::lag::LagConfig;
use crate::reconnect::ReconnectConfig;
use crate::router::NoticeRouting;
use crate::target::NetworkId;

/// One configured network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Stable identifier used for targets and the connection pool.
    pub id: NetworkId,
    /// Display name. Notices from an origin equal to this name are treated
    /// as server notices.
    #[serde(default)]
    pub name: Option<String>,
    /// Server address (host:port).
    pub server: String,
    pub nick: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub realname: Option<String>,
    /// Use TLS (auto-detected from :6697, but can force).
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub tls_insecure: bool,
    /// Channels to join after registration.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_true")]
    pub autoconnect: bool,
}

fn default_true() -> bool {
    true
}

impl NetworkConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }

    pub fn connect_config(&self) -> ConnectConfig {
        ConnectConfig {
            server_addr: self.server.clone(),
            nick: self.nick.clone(),
            user: self.user.clone().unwrap_or_else(|| self.nick.clone()),
            realname: self
                .realname
                .clone()
                .unwrap_or_else(|| "skein".to_string()),
            tls: self.tls,
            tls_insecure: self.tls_insecure,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub notice: NoticeRouting,
}

/// Full client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub lag: LagConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub dcc: DccPolicy,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("skein")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

impl ClientConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Load from the default location, logging and falling back to
    /// defaults on error.
    pub fn load() -> Self {
        let path = default_config_path();
        match Self::load_from(&path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unusable config file");
                Self::default()
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn network(&self, id: &NetworkId) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| &n.id == id)
    }
}

/// Shared, observable view of the configuration.
///
/// Components read through [`SettingsStore::get`] at decision time, so an
/// [`update`](SettingsStore::update) takes effect on the next event without
/// reconnecting.
#[derive(Clone)]
pub struct SettingsStore {
    current: Arc<RwLock<Arc<ClientConfig>>>,
    changes: Hub<Arc<ClientConfig>>,
}

impl SettingsStore {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            changes: Hub::new(),
        }
    }

    /// Snapshot of the current configuration.
    pub fn get(&self) -> Arc<ClientConfig> {
        self.current.read().clone()
    }

    /// Apply `f` to a copy of the configuration and publish the result.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut ClientConfig),
    {
        let next = {
            let mut guard = self.current.write();
            let mut cfg = (**guard).clone();
            f(&mut cfg);
            let next = Arc::new(cfg);
            *guard = Arc::clone(&next);
            next
        };
        self.changes.publish(&next);
    }

    pub fn on_change<F>(&self, cb: F) -> Subscription
    where
        F: Fn(&Arc<ClientConfig>) + Send + Sync + 'static,
    {
        self.changes.subscribe(cb)
    }

    pub fn network(&self, id: &NetworkId) -> Result<NetworkConfig, ConfigError> {
        self.get()
            .network(id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownNetwork(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SAMPLE: &str = r##"
[[networks]]
id = "libera"
name = "Libera.Chat"
server = "irc.libera.chat:6697"
nick = "skein"
tls = true
channels = ["#rust"]

[routing]
notice = "notice-tab"

[flow]
messages_per_second = 3

[dcc]
never_send = ["*.exe"]
"##;

    #[test]
    fn parses_partial_file_with_defaults() {
        let cfg = ClientConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(cfg.networks.len(), 1);
        let net = &cfg.networks[0];
        assert_eq!(net.display_name(), "Libera.Chat");
        assert!(net.autoconnect);
        assert_eq!(net.connect_config().user, "skein");
        assert_eq!(cfg.routing.notice, NoticeRouting::NoticeTab);
        assert_eq!(cfg.flow.messages_per_second, 3);
        assert_eq!(cfg.flow.burst_limit, FlowConfig::default().burst_limit);
        assert_eq!(cfg.dcc.never_send, vec!["*.exe".to_string()]);
        assert!(cfg.lag.enabled);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ClientConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert!(cfg.networks.is_empty());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");
        let cfg = ClientConfig::from_toml(SAMPLE).unwrap();
        cfg.save_to(&path).unwrap();
        let loaded = ClientConfig::load_from(&path).unwrap();
        assert_eq!(loaded.networks[0].id, NetworkId::from("libera"));
        assert_eq!(loaded.routing, cfg.routing);
    }

    #[test]
    fn bad_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "networks = 12").unwrap();
        let err = ClientConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn update_publishes_change() {
        let store = SettingsStore::new(ClientConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _sub = store.on_change(move |cfg| {
            assert_eq!(cfg.routing.notice, NoticeRouting::QueryTab);
            h.fetch_add(1, Ordering::SeqCst);
        });
        store.update(|c| c.routing.notice = NoticeRouting::QueryTab);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.get().routing.notice, NoticeRouting::QueryTab);
    }

    #[test]
    fn unknown_network_is_an_error() {
        let store = SettingsStore::new(ClientConfig::default());
        let err = store.network(&NetworkId::from("efnet")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownNetwork(_)));
    }
}
