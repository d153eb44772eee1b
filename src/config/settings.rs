use serde::Deserialize;

/// Top-level configuration settings for a bus.
///
/// Covers how to reach the broker, how topic exchanges are declared, the
/// channel options and the defaults used by the retry middleware.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BusSettings {
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub vhost: Option<String>,
    pub exchange_name: String,
    pub exchange: ExchangeSettings,
    pub prefetch: Option<u16>,
    pub enable_confirms: bool,
    pub assert_queues_on_first_send: bool,
    pub queues_file: Option<String>,
    pub worker_id: Option<String>,
    pub retry: RetrySettings,
    pub redis: RedisSettings,
}

/// Declaration options for the exchange backing publish/subscribe.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ExchangeSettings {
    pub kind: String,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Defaults for the retry middleware.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub namespace: Option<String>,
    pub set_retries_remaining: bool,
}

/// Connection settings for the redis-backed retry counter store.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub key_format: String,
    pub key_expire_ttl_secs: u64,
}

/// Partial configuration settings loaded from files or environment.
///
/// Settings where any field may be left out. Missing values are filled from defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub bus: Option<PartialBusSettings>,
    pub exchange: Option<PartialExchangeSettings>,
    pub retry: Option<PartialRetrySettings>,
    pub redis: Option<PartialRedisSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBusSettings {
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub vhost: Option<String>,
    pub exchange_name: Option<String>,
    pub prefetch: Option<u16>,
    pub enable_confirms: Option<bool>,
    pub assert_queues_on_first_send: Option<bool>,
    pub queues_file: Option<String>,
    pub worker_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialExchangeSettings {
    pub kind: Option<String>,
    pub durable: Option<bool>,
    pub auto_delete: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRetrySettings {
    pub max_retries: Option<u32>,
    pub namespace: Option<String>,
    pub set_retries_remaining: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRedisSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub password: Option<String>,
    pub key_format: Option<String>,
    pub key_expire_ttl_secs: Option<u64>,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            url: None,
            user: None,
            password: None,
            host: "localhost".to_string(),
            port: 5672,
            vhost: None,
            exchange_name: "amq.topic".to_string(),
            exchange: ExchangeSettings::default(),
            prefetch: None,
            enable_confirms: false,
            assert_queues_on_first_send: true,
            queues_file: None,
            worker_id: None,
            retry: RetrySettings::default(),
            redis: RedisSettings::default(),
        }
    }
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            kind: "topic".to_string(),
            durable: true,
            auto_delete: false,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            namespace: None,
            set_retries_remaining: false,
        }
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            key_format: "servicebus.retry.{}".to_string(),
            key_expire_ttl_secs: 30,
        }
    }
}

impl PartialSettings {
    /// Fill every missing value from `BusSettings::default()`.
    pub fn merge_with_defaults(self) -> BusSettings {
        let default = BusSettings::default();
        let bus = self.bus.unwrap_or_default();
        let exchange = self.exchange.unwrap_or_default();
        let retry = self.retry.unwrap_or_default();
        let redis = self.redis.unwrap_or_default();

        BusSettings {
            url: bus.url.or(default.url),
            user: bus.user.or(default.user),
            password: bus.password.or(default.password),
            host: bus.host.unwrap_or(default.host),
            port: bus.port.unwrap_or(default.port),
            vhost: bus.vhost.or(default.vhost),
            exchange_name: bus.exchange_name.unwrap_or(default.exchange_name),
            exchange: ExchangeSettings {
                kind: exchange.kind.unwrap_or(default.exchange.kind),
                durable: exchange.durable.unwrap_or(default.exchange.durable),
                auto_delete: exchange.auto_delete.unwrap_or(default.exchange.auto_delete),
            },
            prefetch: bus.prefetch.or(default.prefetch),
            enable_confirms: bus.enable_confirms.unwrap_or(default.enable_confirms),
            assert_queues_on_first_send: bus
                .assert_queues_on_first_send
                .unwrap_or(default.assert_queues_on_first_send),
            queues_file: bus.queues_file.or(default.queues_file),
            worker_id: bus.worker_id.or(default.worker_id),
            retry: RetrySettings {
                max_retries: retry.max_retries.unwrap_or(default.retry.max_retries),
                namespace: retry.namespace.or(default.retry.namespace),
                set_retries_remaining: retry
                    .set_retries_remaining
                    .unwrap_or(default.retry.set_retries_remaining),
            },
            redis: RedisSettings {
                host: redis.host.unwrap_or(default.redis.host),
                port: redis.port.unwrap_or(default.redis.port),
                password: redis.password.or(default.redis.password),
                key_format: redis.key_format.unwrap_or(default.redis.key_format),
                key_expire_ttl_secs: redis
                    .key_expire_ttl_secs
                    .unwrap_or(default.redis.key_expire_ttl_secs),
            },
        }
    }
}
