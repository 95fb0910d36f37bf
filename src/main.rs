// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
use std::process::ExitCode;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use helmwrap::error::is_logged;
use helmwrap::{workdir, write};

mod cli;

#[tokio::main]
async fn main() -> ExitCode {
    let args: cli::Cli = argh::from_env();
    init_tracing(&args.log_level);

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let result = cli::run(&args, &cancel).await;
    match workdir::teardown(args.keep_artifacts) {
        Ok(Some(kept)) => {
            let _ = write::ok("Kept", format!("working directory at {}", kept.display()));
        }
        Ok(None) => {}
        Err(e) => tracing::warn!("{:#}", e),
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Logged errors were already printed with their causes.
            let message = if is_logged(&e) {
                e.to_string()
            } else {
                format!("{:#}", e)
            };
            let _ = write::error("Error", message);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn cancel_on_signal(cancel: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    tracing::warn!("Interrupted, cancelling");
    cancel.cancel();
    Ok(())
}
