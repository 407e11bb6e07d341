//! Default ports, addresses and environment variables of the server.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// The default HTTP port `8080`. TLS is terminated in front of the server.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// The default IP address [`Ipv4Addr::UNSPECIFIED`] (`0.0.0.0`) the server binds to,
/// which represents binding on all network addresses.
pub const DEFAULT_LISTEN_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// The default socket address `0.0.0.0:8080` the server binds to.
pub const DEFAULT_SOCKET_ADDRESS: SocketAddr =
    SocketAddr::new(DEFAULT_LISTEN_ADDRESS, DEFAULT_HTTP_PORT);

/// The environment variable holding the log level filter, for example
/// `info,observability_conversion=debug`.
pub const LOG_ENV_VAR: &str = "OBSERVABILITY_CONVERSION_LOG";

/// The prefix of rolling log files.
pub const LOG_FILE_PREFIX: &str = "observability-conversion-webhook";
