//! mage-client binary.

use clap::Parser;
use mage_tower::client::{run_session, Client, ClientConfig, ClientError, Mode, SessionEnd};
use mage_tower::logging;
use std::process::ExitCode;
use tokio::io::BufReader;
use tracing::{error, info};

fn main() -> ExitCode {
    let config = ClientConfig::parse();

    logging::init(&config.log_level, std::io::stderr);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(run(config));
    // A pending stdin read must not hold the process open after an interrupt.
    runtime.shutdown_background();
    code
}

async fn run(config: ClientConfig) -> ExitCode {
    let mut client = match Client::connect(&config).await {
        Ok(client) => client,
        Err(e) => {
            error!(addr = %config.addr(), error = %e, "Failed to connect to server");
            return ExitCode::FAILURE;
        }
    };

    let mut out = tokio::io::stdout();
    let result = session(&mut client, config.mode(), &mut out).await;

    // Always close, whichever way the session ended.
    client.close().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Session ended with an error");
            ExitCode::FAILURE
        }
    }
}

async fn session(
    client: &mut Client,
    mode: Mode,
    out: &mut tokio::io::Stdout,
) -> Result<(), ClientError> {
    let input = BufReader::new(tokio::io::stdin());
    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    match run_session(client, mode, input, out, interrupt).await? {
        SessionEnd::Answered => {}
        SessionEnd::Quit => info!("Disconnecting from server"),
        SessionEnd::ServerClosed => info!("Server closed the connection"),
        SessionEnd::EndOfInput => info!("End of input"),
        SessionEnd::Interrupted => info!("Interrupted by user"),
    }
    Ok(())
}
