use std::process::ExitCode;
use std::sync::Arc;

use cacheproxy::config::CliArgs;
use cacheproxy::{Proxy, Server};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_telemetry() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cacheproxy=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_telemetry();
    let args = CliArgs::parse();

    let proxy = match Proxy::new(&args.to_config()) {
        Ok(proxy) => Arc::new(proxy),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let server = match Server::bind(args.listen_addr).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start listener");
            return ExitCode::FAILURE;
        }
    };
    info!(origin = %proxy.target(), listen = %server.local_addr(), "proxying");

    let result = server
        .run(move |req| {
            let proxy = Arc::clone(&proxy);
            async move { proxy.handle(req).await }
        })
        .await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server stopped");
            ExitCode::FAILURE
        }
    }
}
