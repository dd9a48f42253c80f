use std::io;

use anyhow::Result;
use clap::Parser;
use nativeserver::args::ServerArgs;
use nativeserver::server::{NativeServer, build_handler};
use nativesrv::logs::ClientLogsLayer;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    logutil::configure_global_logger_with_layer(
        args.log_level,
        args.log_format.into(),
        io::stderr,
        ClientLogsLayer,
    );

    let handler = build_handler(&args);
    let server = NativeServer::bind(&args.bind, handler).await?;
    let addr = server.local_addr()?;
    info!(%addr, version = env!("CARGO_PKG_VERSION"), "starting native protocol server");
    println!("Listening for native protocol connections on {addr}");

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received interrupt"),
            Err(e) => warn!(%e, "failed to listen for interrupt, shutting down"),
        }
        token.cancel();
    });

    server.serve(shutdown).await
}
