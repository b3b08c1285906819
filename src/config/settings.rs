use std::time::Duration;

use serde::Deserialize;

use crate::broker::Broker;
use crate::channel::DispatchMode;
use crate::transport::ReconnectPolicy;
use crate::utils::error::BridgeError;

/// Top-level configuration of the bridge and its emulator.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server: ServerSettings,
    pub pubsub: PubSubSettings,
    pub bridge: BridgeSettings,
    pub logging: LoggingSettings,
}

/// Where the WebSocket emulator listens.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Names and limits on the broker side.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PubSubSettings {
    pub subscription: String,
    pub topic: String,
    pub ack_deadline_ms: u64,
    pub max_message_bytes: usize,
    pub lease_check_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DispatchSetting {
    Direct,
    Concurrent,
}

/// In-process wiring and connection behaviour of the bridge.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    pub input_channel: String,
    pub output_channel: String,
    pub dispatch: DispatchSetting,
    pub max_in_flight: usize,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    pub publish_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is not set.
    pub level: String,
}

/// Settings as found in files and the environment, every value optional.
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub pubsub: Option<PartialPubSubSettings>,
    pub bridge: Option<PartialBridgeSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPubSubSettings {
    pub subscription: Option<String>,
    pub topic: Option<String>,
    pub ack_deadline_ms: Option<u64>,
    pub max_message_bytes: Option<usize>,
    pub lease_check_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBridgeSettings {
    pub input_channel: Option<String>,
    pub output_channel: Option<String>,
    pub dispatch: Option<DispatchSetting>,
    pub max_in_flight: Option<usize>,
    pub reconnect_initial_backoff_ms: Option<u64>,
    pub reconnect_max_backoff_ms: Option<u64>,
    pub publish_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8085,
            },
            pubsub: PubSubSettings {
                subscription: "testSubscription".to_string(),
                topic: "testTopic".to_string(),
                ack_deadline_ms: 10_000,
                max_message_bytes: Broker::DEFAULT_MAX_MESSAGE_BYTES,
                lease_check_interval_ms: 100,
            },
            bridge: BridgeSettings {
                input_channel: "pubsubInputChannel".to_string(),
                output_channel: "pubsubOutputChannel".to_string(),
                dispatch: DispatchSetting::Direct,
                max_in_flight: 16,
                reconnect_initial_backoff_ms: 100,
                reconnect_max_backoff_ms: 10_000,
                publish_timeout_ms: 5_000,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    pub fn merge(self, default: Settings) -> Settings {
        Settings {
            server: self.server.unwrap_or_default().merge(default.server),
            pubsub: self.pubsub.unwrap_or_default().merge(default.pubsub),
            bridge: self.bridge.unwrap_or_default().merge(default.bridge),
            logging: self.logging.unwrap_or_default().merge(default.logging),
        }
    }
}

impl PartialServerSettings {
    fn merge(self, default: ServerSettings) -> ServerSettings {
        ServerSettings {
            host: self.host.unwrap_or(default.host),
            port: self.port.unwrap_or(default.port),
        }
    }
}

impl PartialPubSubSettings {
    fn merge(self, default: PubSubSettings) -> PubSubSettings {
        PubSubSettings {
            subscription: self.subscription.unwrap_or(default.subscription),
            topic: self.topic.unwrap_or(default.topic),
            ack_deadline_ms: self.ack_deadline_ms.unwrap_or(default.ack_deadline_ms),
            max_message_bytes: self.max_message_bytes.unwrap_or(default.max_message_bytes),
            lease_check_interval_ms: self
                .lease_check_interval_ms
                .unwrap_or(default.lease_check_interval_ms),
        }
    }
}

impl PartialBridgeSettings {
    fn merge(self, default: BridgeSettings) -> BridgeSettings {
        BridgeSettings {
            input_channel: self.input_channel.unwrap_or(default.input_channel),
            output_channel: self.output_channel.unwrap_or(default.output_channel),
            dispatch: self.dispatch.unwrap_or(default.dispatch),
            max_in_flight: self.max_in_flight.unwrap_or(default.max_in_flight),
            reconnect_initial_backoff_ms: self
                .reconnect_initial_backoff_ms
                .unwrap_or(default.reconnect_initial_backoff_ms),
            reconnect_max_backoff_ms: self
                .reconnect_max_backoff_ms
                .unwrap_or(default.reconnect_max_backoff_ms),
            publish_timeout_ms: self.publish_timeout_ms.unwrap_or(default.publish_timeout_ms),
        }
    }
}

impl PartialLoggingSettings {
    fn merge(self, default: LoggingSettings) -> LoggingSettings {
        LoggingSettings {
            level: self.level.unwrap_or(default.level),
        }
    }
}

impl Settings {
    /// Rejects settings the bridge cannot run with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let names = [
            ("server.host", &self.server.host),
            ("pubsub.subscription", &self.pubsub.subscription),
            ("pubsub.topic", &self.pubsub.topic),
            ("bridge.input_channel", &self.bridge.input_channel),
            ("bridge.output_channel", &self.bridge.output_channel),
        ];
        for (key, value) in names {
            if value.trim().is_empty() {
                return Err(BridgeError::Config(format!("{key} must not be empty")));
            }
        }

        let limits = [
            ("pubsub.ack_deadline_ms", self.pubsub.ack_deadline_ms),
            ("pubsub.lease_check_interval_ms", self.pubsub.lease_check_interval_ms),
            ("pubsub.max_message_bytes", self.pubsub.max_message_bytes as u64),
            ("bridge.max_in_flight", self.bridge.max_in_flight as u64),
            ("bridge.reconnect_initial_backoff_ms", self.bridge.reconnect_initial_backoff_ms),
            ("bridge.reconnect_max_backoff_ms", self.bridge.reconnect_max_backoff_ms),
            ("bridge.publish_timeout_ms", self.bridge.publish_timeout_ms),
        ];
        for (key, value) in limits {
            if value == 0 {
                return Err(BridgeError::Config(format!("{key} must be greater than zero")));
            }
        }

        if self.bridge.reconnect_max_backoff_ms < self.bridge.reconnect_initial_backoff_ms {
            return Err(BridgeError::Config(
                "bridge.reconnect_max_backoff_ms is below bridge.reconnect_initial_backoff_ms"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn ack_deadline(&self) -> Duration {
        Duration::from_millis(self.pubsub.ack_deadline_ms)
    }

    pub fn lease_check_interval(&self) -> Duration {
        Duration::from_millis(self.pubsub.lease_check_interval_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge.publish_timeout_ms)
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        match self.bridge.dispatch {
            DispatchSetting::Direct => DispatchMode::Direct,
            DispatchSetting::Concurrent => DispatchMode::Concurrent {
                max_in_flight: self.bridge.max_in_flight,
            },
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_backoff: Duration::from_millis(self.bridge.reconnect_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.bridge.reconnect_max_backoff_ms),
        }
    }
}
