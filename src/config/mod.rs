mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};
use tracing::debug;

pub use settings::{BusSettings, ExchangeSettings, RedisSettings, RetrySettings};

/// Loads the configuration from the default file and environment variables.
///
/// A `.env` file is read first when present. Values from `config/default`
/// are overridden by `SERVICEBUS__<SECTION>__<KEY>` variables, and anything
/// still missing falls back to `BusSettings::default()`.
pub fn load_config() -> Result<BusSettings, ConfigError> {
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::with_prefix("SERVICEBUS").separator("__"));

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_with_defaults())
}

impl BusSettings {
    /// Resolve the broker URL.
    ///
    /// Order: explicit `url`, then `RABBITMQ_URL`, then a URL built from
    /// `user`/`password`/`host`/`port`, then `amqp://localhost`. A vhost
    /// (from settings or `RABBITMQ_VHOST`) is escaped and appended.
    pub fn broker_url(&self) -> String {
        let base = self
            .url
            .clone()
            .filter(|url| !url.is_empty())
            .or_else(|| std::env::var("RABBITMQ_URL").ok().filter(|url| !url.is_empty()))
            .unwrap_or_else(|| match (&self.user, &self.password) {
                (Some(user), Some(password)) => {
                    debug!(user = %user, host = %self.host, port = self.port, "Creating broker URL");
                    format!("amqp://{user}:{password}@{}:{}", self.host, self.port)
                }
                _ => {
                    debug!("Broker URL could not be determined, using default amqp://localhost");
                    "amqp://localhost".to_string()
                }
            });

        let vhost = self
            .vhost
            .clone()
            .or_else(|| std::env::var("RABBITMQ_VHOST").ok())
            .filter(|vhost| !vhost.is_empty());

        match vhost {
            Some(vhost) => format!("{base}/{}", urlencoding::encode(&vhost)),
            None => base,
        }
    }

    /// [`Self::broker_url`] with any password masked, for logs.
    pub fn redacted_broker_url(&self) -> String {
        redact_password(&self.broker_url())
    }
}

fn redact_password(url: &str) -> String {
    let Some(scheme_end) = url.find("://").map(|i| i + 3) else {
        return url.to_string();
    };
    let authority_end = url[scheme_end..]
        .find('/')
        .map_or(url.len(), |i| scheme_end + i);
    let Some(at) = url[scheme_end..authority_end].rfind('@').map(|i| scheme_end + i) else {
        return url.to_string();
    };
    match url[scheme_end..at].find(':').map(|i| scheme_end + i) {
        Some(colon) => format!("{}:***{}", &url[..colon], &url[at..]),
        None => url.to_string(),
    }
}
