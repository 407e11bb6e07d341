//! Contains available options to configure the [`ConversionServer`][crate::ConversionServer].
use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use observability_conversion::{
    batch::BatchConfig, optimizer::OptimizerConfig, preservation::DEFAULT_MAX_PRESERVED_BYTES,
};

use crate::constants::DEFAULT_SOCKET_ADDRESS;

/// Specifies available server options.
///
/// The [`Default`] implementation for this struct contains the following values:
///
/// - The socket binds to 0.0.0.0 on port 8080 (HTTP)
/// - Conversion results are cached for five minutes
/// - Preserved fields may take up to 256 KiB per resource
///
/// ### Example with Custom IP Address, Port and Cache TTL
///
/// ```
/// use std::time::Duration;
///
/// use observability_conversion_webhook::ServerOptions;
///
/// let options = ServerOptions::builder()
///     .bind_address([127, 0, 0, 1], 12345)
///     .cache_ttl(Duration::from_secs(60))
///     .build();
///
/// assert_eq!(options.socket_addr.port(), 12345);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct ServerOptions {
    /// The socket address the [`TcpListener`][tokio::net::TcpListener] binds to.
    pub socket_addr: SocketAddr,

    pub optimizer: OptimizerConfig,

    /// The maximum serialized size of the data preserved in annotations.
    pub max_preserved_bytes: usize,

    /// Used by migrations started through the server.
    pub batch: BatchConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ServerOptions {
    /// Returns the default [`ServerOptionsBuilder`] which allows to selectively
    /// customize the options.
    pub fn builder() -> ServerOptionsBuilder {
        ServerOptionsBuilder::default()
    }
}

/// The [`ServerOptionsBuilder`] which allows to selectively customize the
/// [`ServerOptions`].
///
/// Usually, this struct is not constructed manually, but instead by calling
/// [`ServerOptions::builder()`] or [`ServerOptionsBuilder::default()`].
#[derive(Debug, Default)]
pub struct ServerOptionsBuilder {
    socket_addr: Option<SocketAddr>,
    optimizer: OptimizerConfig,
    max_preserved_bytes: Option<usize>,
    batch: BatchConfig,
}

impl ServerOptionsBuilder {
    /// Sets the socket address the server binds to.
    pub fn bind_address(mut self, bind_ip: impl Into<IpAddr>, bind_port: u16) -> Self {
        self.socket_addr = Some(SocketAddr::new(bind_ip.into(), bind_port));
        self
    }

    /// Sets the IP address of the socket address the server binds to.
    pub fn bind_ip(mut self, bind_ip: impl Into<IpAddr>) -> Self {
        let addr = self.socket_addr.get_or_insert(DEFAULT_SOCKET_ADDRESS);
        addr.set_ip(bind_ip.into());
        self
    }

    /// Sets the port of the socket address the server binds to.
    pub fn bind_port(mut self, bind_port: u16) -> Self {
        let addr = self.socket_addr.get_or_insert(DEFAULT_SOCKET_ADDRESS);
        addr.set_port(bind_port);
        self
    }

    pub fn cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.optimizer.cache_ttl = cache_ttl;
        self
    }

    /// Disables caching of conversion results. Results are the same with and
    /// without the cache.
    pub fn disable_cache(mut self) -> Self {
        self.optimizer.cache_enabled = false;
        self
    }

    /// Resources scoring above `complexity_threshold` are converted on the
    /// blocking thread pool.
    pub fn complexity_threshold(mut self, complexity_threshold: f64) -> Self {
        self.optimizer.complexity_threshold = complexity_threshold;
        self
    }

    pub fn max_preserved_bytes(mut self, max_preserved_bytes: usize) -> Self {
        self.max_preserved_bytes = Some(max_preserved_bytes);
        self
    }

    pub fn batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Builds the final [`ServerOptions`] by using default values for any not
    /// explicitly set option.
    pub fn build(self) -> ServerOptions {
        ServerOptions {
            socket_addr: self.socket_addr.unwrap_or(DEFAULT_SOCKET_ADDRESS),
            optimizer: self.optimizer,
            max_preserved_bytes: self
                .max_preserved_bytes
                .unwrap_or(DEFAULT_MAX_PRESERVED_BYTES),
            batch: self.batch,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn port_only_keeps_the_default_address() {
        let options = ServerOptions::builder().bind_port(9443).build();
        assert_eq!(
            options.socket_addr,
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 9443)
        );
    }

    #[test]
    fn defaults() {
        let options = ServerOptions::default();
        assert_eq!(options.socket_addr, DEFAULT_SOCKET_ADDRESS);
        assert_eq!(options.optimizer, OptimizerConfig::default());
        assert_eq!(options.max_preserved_bytes, DEFAULT_MAX_PRESERVED_BYTES);
    }
}
