//! The bridge, combining the alias registry, the registration server and the HTTP gateway.

use std::{net::SocketAddr, sync::Arc};

use iroh::SecretKey;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};
use tracing::info;

use crate::{
    METRICS_ALPN, REGISTER_ALPN,
    alias_server::AliasRpcServer,
    config::{Config, ConfigError},
    http::{AppState, HttpError, HttpServer},
    key::PeerKey,
    metrics::Metrics,
    registry::{AliasRegistry, PutError},
    transport::{Transport, iroh::IrohTransport},
};

/// Errors when starting or stopping the bridge.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum BridgeError {
    #[snafu(display("Invalid configuration"))]
    Config { source: ConfigError },
    #[snafu(display("Failed to bind the endpoint"))]
    Bind {
        source: iroh::endpoint::BindError,
    },
    #[snafu(display("Failed to start the alias registry"))]
    Registry { source: PutError },
    #[snafu(display("HTTP server failed"))]
    Http { source: HttpError },
    #[snafu(display("Failed to wait for Ctrl-C"))]
    Signal { source: std::io::Error },
}

/// Binds an iroh endpoint, spawns the bridge and runs until `Ctrl-C` is received, then shuts
/// down.
pub async fn run_with_config_until_ctrl_c(config: Config) -> Result<(), BridgeError> {
    config.shared_secret().context(ConfigSnafu)?;
    let secret_key = match &config.key_pair_seed {
        Some(seed) => SecretKey::from_bytes(seed.as_bytes()),
        None => SecretKey::generate(&mut rand::rngs::OsRng),
    };
    let transport = IrohTransport::bind(secret_key, [REGISTER_ALPN, METRICS_ALPN])
        .await
        .context(BindSnafu)?;
    let bridge = Bridge::spawn(&config, Arc::new(transport)).await?;
    tokio::signal::ctrl_c().await.context(SignalSnafu)?;
    info!("shutdown");
    bridge.shutdown().await
}

/// The bridge.
#[derive(Debug)]
pub struct Bridge {
    key: PeerKey,
    registry: AliasRegistry,
    alias_server: AliasRpcServer,
    http_server: HttpServer,
    metrics: Arc<Metrics>,
}

impl Bridge {
    /// Spawns the bridge on `transport`.
    ///
    /// Persisted aliases are reloaded before registrations are accepted. The transport is
    /// shut down with the bridge.
    pub async fn spawn(config: &Config, transport: Arc<dyn Transport>) -> Result<Self, BridgeError> {
        let secret = config.shared_secret().context(ConfigSnafu)?.clone();
        let options = config.registry_options().context(ConfigSnafu)?;
        let key = transport.public_key();
        let metrics = Arc::new(Metrics::default());

        let registry = AliasRegistry::new(transport.clone(), options, metrics.clone());
        if let Err(err) = registry.start().await {
            registry.close().await;
            return Err(err).context(RegistrySnafu);
        }
        let alias_server =
            AliasRpcServer::spawn(transport, secret, registry.clone(), metrics.clone());
        let state = AppState::new(registry.clone(), metrics.clone());
        let http_server = match HttpServer::spawn(config.http.clone(), state).await {
            Ok(server) => server,
            Err(err) => {
                alias_server.shutdown().await;
                registry.close().await;
                return Err(err).context(HttpSnafu);
            }
        };
        info!(
            me = %key,
            http = %http_server.http_addr(),
            aliases = registry.entries().len(),
            "bridge started"
        );
        Ok(Self {
            key,
            registry,
            alias_server,
            http_server,
            metrics,
        })
    }

    /// The overlay identity registering peers dial.
    pub fn public_key(&self) -> PeerKey {
        self.key
    }

    /// The bound address of the HTTP gateway.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_server.http_addr()
    }

    /// The alias registry.
    pub fn registry(&self) -> &AliasRegistry {
        &self.registry
    }

    /// The bridge metrics.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Shuts the bridge down.
    ///
    /// Stops the HTTP gateway and the expiry sweep, then stops accepting registrations and
    /// closes the registry, which writes the target file one last time.
    pub async fn shutdown(self) -> Result<(), BridgeError> {
        let res = self.http_server.shutdown().await;
        self.registry.stop_expiry();
        self.alias_server.shutdown().await;
        self.registry.close().await;
        info!("bridge stopped");
        res.context(HttpSnafu)
    }
}
