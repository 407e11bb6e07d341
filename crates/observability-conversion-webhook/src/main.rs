use clap::Parser;
use observability_conversion_webhook::{
    ConversionServer,
    cli::Cli,
    logging::{self, FileLog, LoggingError},
};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize logging"))]
    InitLogging { source: LoggingError },

    #[snafu(display("failed to create server"))]
    CreateServer {
        source: observability_conversion_webhook::Error,
    },

    #[snafu(display("failed to run server"))]
    RunServer {
        source: observability_conversion_webhook::Error,
    },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    let file_log = cli.log_directory.as_deref().map(|directory| FileLog {
        directory,
        rotation_period: cli.log_rotation_period.unwrap_or_default(),
    });
    logging::init(file_log).context(InitLoggingSnafu)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting observability conversion webhook"
    );

    ConversionServer::new(cli.server_options())
        .context(CreateServerSnafu)?
        .run()
        .await
        .context(RunServerSnafu)
}
