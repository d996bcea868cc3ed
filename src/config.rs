//! Configuration for the bridge

use std::{
    env,
    net::{AddrParseError, IpAddr},
    num::ParseIntError,
    path::{Path, PathBuf},
};

use n0_future::time::Duration;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use crate::{
    http::HttpConfig,
    key::{KeyParsingError, SharedSecret},
    registry::{DEFAULT_ENTRY_EXPIRY, DEFAULT_SWEEP_INTERVAL, RegistryOptions},
};

/// Overrides the HTTP port.
pub const ENV_HTTP_PORT: &str = "SCRAPE_BRIDGE_HTTP_PORT";
/// Overrides the HTTP bind address.
pub const ENV_HTTP_HOST: &str = "SCRAPE_BRIDGE_HTTP_HOST";
/// Sets the shared registration secret.
pub const ENV_SHARED_SECRET: &str = "SCRAPE_BRIDGE_SHARED_SECRET";
/// Sets the seed of the bridge's key pair.
pub const ENV_KEY_PAIR_SEED: &str = "SCRAPE_BRIDGE_KEY_PAIR_SEED";
/// Overrides the target file location.
pub const ENV_TARGETS_PATH: &str = "SCRAPE_BRIDGE_TARGETS_PATH";

/// Errors when loading the configuration.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("Failed to read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Invalid config file"))]
    Parse { source: toml::de::Error },
    #[snafu(display("Invalid {name}"))]
    InvalidPort {
        name: &'static str,
        source: ParseIntError,
    },
    #[snafu(display("Invalid {name}"))]
    InvalidHost {
        name: &'static str,
        source: AddrParseError,
    },
    #[snafu(display("Invalid {name}"))]
    InvalidKey {
        name: &'static str,
        source: KeyParsingError,
    },
    #[snafu(display("A shared secret is required, set SCRAPE_BRIDGE_SHARED_SECRET"))]
    MissingSecret {},
    #[snafu(display("{field} must not be zero"))]
    ZeroDuration { field: &'static str },
}

/// Bridge configuration
///
/// The config is usually loaded from a file with [`Self::load`] and then overridden from the
/// environment with [`Self::apply_env`].
///
/// The struct also implements [`Default`] which creates a config suitable for local development
/// and testing, apart from the shared secret which has to be set.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Config for the HTTP server.
    pub http: HttpConfig,
    /// The secret registering peers must present, as hex or z-base-32.
    pub shared_secret: Option<SharedSecret>,
    /// Seed of the bridge's key pair, as hex or z-base-32.
    ///
    /// A random key pair is generated on every start if unset.
    pub key_pair_seed: Option<SharedSecret>,
    /// Location of the target file read by the metrics collector.
    pub targets_path: PathBuf,
    /// Time after which an alias that was not renewed is evicted.
    #[serde(with = "humantime_serde")]
    pub entry_expiry: Duration,
    /// Interval between expiry sweeps.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            shared_secret: None,
            key_pair_seed: None,
            targets_path: PathBuf::from("prometheus").join("targets.json"),
            entry_expiry: DEFAULT_ENTRY_EXPIRY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        toml::from_str(&s).context(ParseSnafu)
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(self) -> Result<Config, ConfigError> {
        self.apply_overrides(|name| env::var(name).ok())
    }

    /// Applies overrides looked up by variable name, see the `ENV_*` constants.
    pub fn apply_overrides(
        mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Config, ConfigError> {
        if let Some(port) = var(ENV_HTTP_PORT) {
            self.http.port = port
                .trim()
                .parse()
                .context(InvalidPortSnafu { name: ENV_HTTP_PORT })?;
        }
        if let Some(host) = var(ENV_HTTP_HOST) {
            let host: IpAddr = host
                .trim()
                .parse()
                .context(InvalidHostSnafu { name: ENV_HTTP_HOST })?;
            self.http.bind_addr = Some(host);
        }
        if let Some(secret) = var(ENV_SHARED_SECRET) {
            let secret = secret.parse().context(InvalidKeySnafu {
                name: ENV_SHARED_SECRET,
            })?;
            self.shared_secret = Some(secret);
        }
        if let Some(seed) = var(ENV_KEY_PAIR_SEED) {
            let seed = seed.parse().context(InvalidKeySnafu {
                name: ENV_KEY_PAIR_SEED,
            })?;
            self.key_pair_seed = Some(seed);
        }
        if let Some(path) = var(ENV_TARGETS_PATH) {
            self.targets_path = PathBuf::from(path);
        }
        Ok(self)
    }

    /// The configured shared secret.
    pub fn shared_secret(&self) -> Result<&SharedSecret, ConfigError> {
        self.shared_secret.as_ref().context(MissingSecretSnafu)
    }

    /// Options for the alias registry.
    pub fn registry_options(&self) -> Result<RegistryOptions, ConfigError> {
        snafu::ensure!(
            !self.entry_expiry.is_zero(),
            ZeroDurationSnafu {
                field: "entry_expiry"
            }
        );
        snafu::ensure!(
            !self.sweep_interval.is_zero(),
            ZeroDurationSnafu {
                field: "sweep_interval"
            }
        );
        Ok(RegistryOptions {
            entry_expiry: self.entry_expiry,
            sweep_interval: self.sweep_interval,
            targets_path: self.targets_path.clone(),
        })
    }
}
