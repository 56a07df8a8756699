//! Engine configuration.
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Port where the client listens for peer connections, also advertised on
    /// the extended handshake.
    pub local_peer_port: u16,

    /// Maximum number of connected peers across all torrents.
    pub max_global_peers: u32,

    /// Maximum number of connected peers per torrent.
    pub max_torrent_peers: u32,

    /// How many interested peers each torrent unchokes on every rechoke tick,
    /// not counting the optimistic slot.
    pub upload_slots_per_torrent: u32,

    /// Session-wide download cap in bytes per second, 0 means unlimited.
    pub download_rate_limit: u64,

    /// Session-wide upload cap in bytes per second, 0 means unlimited.
    pub upload_rate_limit: u64,

    /// If the local peer is running on ipv6.
    pub is_ipv6: bool,

    pub key: u32,
}

pub static CONFIG: LazyLock<Config> = LazyLock::new(|| Config::get().unwrap());

impl Config {
    /// Try to load the configuration. Environmental variables have privilege
    /// over values from the configuration file, and both over the defaults.
    pub fn load() -> Result<Self, Error> {
        Self::get()
    }

    fn get() -> Result<Config, Error> {
        // config.toml, the .toml part is omitted.
        let config_file = std::env::var("XDG_CONFIG_HOME")
            .map(|v| format!("{v}/sciame/config"))
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_default();
                format!("{home}/.config/sciame/config")
            });

        let key: u32 = rand::random();

        config::Config::builder()
            .add_source(config::File::with_name(&config_file).required(false))
            .add_source(config::Environment::default())
            .set_default("local_peer_port", 51413)
            .unwrap()
            .set_default("max_global_peers", 200)
            .unwrap()
            .set_default("max_torrent_peers", 50)
            .unwrap()
            .set_default("upload_slots_per_torrent", 8)
            .unwrap()
            .set_default("download_rate_limit", 0)
            .unwrap()
            .set_default("upload_rate_limit", 0)
            .unwrap()
            .set_default("is_ipv6", false)
            .unwrap()
            .set_default("key", key)
            .unwrap()
            .build()?
            .try_deserialize::<Config>()
            .map_err(Error::FromConfigError)
    }
}
