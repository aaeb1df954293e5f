use chathub_server::{ServerState, server};
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
struct Args {
    /// Port to listen on; falls back to $PORT, then 3001.
    #[clap(long)]
    port: Option<u16>,
    #[clap(short, long, default_value = "storage/chathub.json")]
    storage: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=info,tower_http=info", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let port = args
        .port
        .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(3001);
    let host = SocketAddr::from(([0, 0, 0, 0], port));

    let state = Arc::new(
        ServerState::new(args.storage)
            .await
            .expect("Init server state"),
    );

    info!("Starting server on http://{host}");

    let listener = tokio::net::TcpListener::bind(host)
        .await
        .expect("Unable to bind to host");
    axum::serve(
        listener,
        server(state.clone()).layer(TraceLayer::new_for_http()),
    )
    .with_graceful_shutdown(async { tokio::signal::ctrl_c().await.expect("Listen to ctrlc") })
    .await
    .unwrap();

    info!("Server has shut down");
    state.persist().await;
}
