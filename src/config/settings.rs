use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub client: ClientSettings,
    pub gateway: GatewaySettings,
    pub log: LogSettings,
}

/// Address the broker binds to.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Where the last-value cache lives.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StoreSettings {
    pub path: String,
    /// Keep the cache in memory only; nothing survives a restart.
    pub in_memory: bool,
}

/// Client runtime timers and the broker URL it dials.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ClientSettings {
    pub url: String,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub watchdog_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct GatewaySettings {
    pub response_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

impl ServerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ClientSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
}

impl GatewaySettings {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub store: Option<PartialStoreSettings>,
    pub client: Option<PartialClientSettings>,
    pub gateway: Option<PartialGatewaySettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStoreSettings {
    pub path: Option<String>,
    pub in_memory: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialClientSettings {
    pub url: Option<String>,
    pub ping_interval_secs: Option<u64>,
    pub pong_timeout_secs: Option<u64>,
    pub watchdog_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialGatewaySettings {
    pub response_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8081,
            },
            store: StoreSettings {
                path: "keyrelay_db".to_string(),
                in_memory: false,
            },
            client: ClientSettings {
                url: "ws://127.0.0.1:8081".to_string(),
                ping_interval_secs: 30,
                pong_timeout_secs: 5,
                watchdog_interval_secs: 60,
            },
            gateway: GatewaySettings {
                response_timeout_secs: 10,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Overlay whatever was provided on top of the defaults.
    pub fn merge_with_defaults(self) -> Settings {
        let default = Settings::default();
        let server = self.server.unwrap_or_default();
        let store = self.store.unwrap_or_default();
        let client = self.client.unwrap_or_default();
        let gateway = self.gateway.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
            },
            store: StoreSettings {
                path: store.path.unwrap_or(default.store.path),
                in_memory: store.in_memory.unwrap_or(default.store.in_memory),
            },
            client: ClientSettings {
                url: client.url.unwrap_or(default.client.url),
                ping_interval_secs: client
                    .ping_interval_secs
                    .unwrap_or(default.client.ping_interval_secs),
                pong_timeout_secs: client
                    .pong_timeout_secs
                    .unwrap_or(default.client.pong_timeout_secs),
                watchdog_interval_secs: client
                    .watchdog_interval_secs
                    .unwrap_or(default.client.watchdog_interval_secs),
            },
            gateway: GatewaySettings {
                response_timeout_secs: gateway
                    .response_timeout_secs
                    .unwrap_or(default.gateway.response_timeout_secs),
            },
            log: LogSettings {
                level: log.level.unwrap_or(default.log.level),
            },
        }
    }
}
