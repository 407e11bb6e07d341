//! Installs the global `tracing` subscriber.
//!
//! Events are always written to the console. If a log directory is
//! configured they are additionally written to rolling JSON files. Both
//! outputs are filtered by [`LOG_ENV_VAR`], defaulting to `INFO`.
use std::path::Path;

use snafu::{ResultExt, Snafu};
use tracing::{level_filters::LevelFilter, subscriber::SetGlobalDefaultError};
use tracing_appender::rolling::{InitError, RollingFileAppender};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt};

use crate::{
    cli::RotationPeriod,
    constants::{LOG_ENV_VAR, LOG_FILE_PREFIX},
};

#[derive(Debug, Snafu)]
pub enum LoggingError {
    #[snafu(display("failed to initialize rolling file appender"))]
    InitRollingFileAppender { source: InitError },

    #[snafu(display("unable to set the global default subscriber"))]
    SetGlobalDefault { source: SetGlobalDefaultError },
}

/// Where and how log files are written.
#[derive(Clone, Copy, Debug)]
pub struct FileLog<'a> {
    pub directory: &'a Path,
    pub rotation_period: RotationPeriod,
}

pub fn init(file_log: Option<FileLog<'_>>) -> Result<(), LoggingError> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![
        tracing_subscriber::fmt::layer()
            .with_filter(env_filter())
            .boxed(),
    ];

    if let Some(FileLog {
        directory,
        rotation_period,
    }) = file_log
    {
        let file_appender = RollingFileAppender::builder()
            .rotation(rotation_period.into())
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix("json")
            .build(directory)
            .context(InitRollingFileAppenderSnafu)?;

        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_appender)
                .with_filter(env_filter())
                .boxed(),
        );
    }

    tracing::subscriber::set_global_default(Registry::default().with(layers))
        .context(SetGlobalDefaultSnafu)?;

    if let Some(file_log) = file_log {
        tracing::info!(
            directory = %file_log.directory.display(),
            rotation_period = %file_log.rotation_period,
            "writing logs to files"
        );
    }
    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_env_var(LOG_ENV_VAR)
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}
