//! Command line arguments of the server. Every argument can also be set
//! through an environment variable of the same name.
use std::{net::IpAddr, path::PathBuf};

use clap::{Parser, ValueEnum};
use observability_conversion::{batch::BatchConfig, preservation::DEFAULT_MAX_PRESERVED_BYTES};
use tracing_appender::rolling::Rotation;

use crate::{
    constants::{DEFAULT_HTTP_PORT, DEFAULT_LISTEN_ADDRESS},
    options::ServerOptions,
};

/// Converts ObservabilityPlatform resources between their API versions.
#[derive(Debug, PartialEq, Parser)]
#[command(version, about)]
pub struct Cli {
    /// The IP address the server binds to.
    #[arg(long, env, default_value_t = DEFAULT_LISTEN_ADDRESS)]
    pub bind_address: IpAddr,

    /// The port the server listens on.
    #[arg(long, env, default_value_t = DEFAULT_HTTP_PORT)]
    pub port: u16,

    /// How long conversion results are cached, for example `5m` or `30s`.
    #[arg(long, env, default_value = "5m")]
    pub cache_ttl: humantime::Duration,

    /// Disable caching of conversion results.
    #[arg(long, env)]
    pub cache_disabled: bool,

    /// Resources scoring above this complexity are converted on the blocking
    /// thread pool.
    #[arg(long, env, default_value_t = 100.0)]
    pub complexity_threshold: f64,

    /// The maximum serialized size in BYTES of the data preserved across
    /// conversions.
    #[arg(long, env, value_name = "BYTES", default_value_t = DEFAULT_MAX_PRESERVED_BYTES)]
    pub max_preserved_bytes: usize,

    /// Resources migrated concurrently.
    #[arg(long, env, default_value_t = 5)]
    pub migration_concurrency: usize,

    /// Enable logging to files located in the specified DIRECTORY.
    #[arg(long, env, value_name = "DIRECTORY", group = "file_log")]
    pub log_directory: Option<PathBuf>,

    /// Time PERIOD after which log files are rolled over.
    #[arg(long, env, value_name = "PERIOD", requires = "file_log")]
    pub log_rotation_period: Option<RotationPeriod>,
}

impl Cli {
    pub fn server_options(&self) -> ServerOptions {
        let mut builder = ServerOptions::builder()
            .bind_address(self.bind_address, self.port)
            .cache_ttl(self.cache_ttl.into())
            .complexity_threshold(self.complexity_threshold)
            .max_preserved_bytes(self.max_preserved_bytes)
            .batch(BatchConfig::default().with_max_concurrency(self.migration_concurrency));

        if self.cache_disabled {
            builder = builder.disable_cache();
        }
        builder.build()
    }
}

/// Supported periods when the log file is rolled over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, strum::Display)]
pub enum RotationPeriod {
    Minutely,
    Hourly,
    Daily,

    #[default]
    Never,
}

impl From<RotationPeriod> for Rotation {
    fn from(period: RotationPeriod) -> Self {
        match period {
            RotationPeriod::Minutely => Self::MINUTELY,
            RotationPeriod::Hourly => Self::HOURLY,
            RotationPeriod::Daily => Self::DAILY,
            RotationPeriod::Never => Self::NEVER,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::CommandFactory;
    use rstest::rstest;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn arguments_become_server_options() {
        let cli = Cli::try_parse_from([
            "observability-conversion-webhook",
            "--bind-address",
            "127.0.0.1",
            "--port",
            "9443",
            "--cache-ttl",
            "90s",
            "--complexity-threshold",
            "250",
        ])
        .expect("arguments are valid");

        let options = cli.server_options();
        assert_eq!(options.socket_addr.to_string(), "127.0.0.1:9443");
        assert_eq!(options.optimizer.cache_ttl, Duration::from_secs(90));
        assert_eq!(options.optimizer.complexity_threshold, 250.0);
        assert!(options.optimizer.cache_enabled);
    }

    #[rstest]
    #[case::invalid_ttl(&["--cache-ttl", "soon"])]
    #[case::rotation_without_directory(&["--log-rotation-period", "daily"])]
    fn invalid_arguments(#[case] arguments: &[&str]) {
        let arguments = std::iter::once("observability-conversion-webhook").chain(arguments.iter().copied());
        assert!(Cli::try_parse_from(arguments).is_err());
    }
}
