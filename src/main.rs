use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wazgate::cli::Args;
use wazgate::config::{ConfigCache, ConfigResolver, FileConfigStore};
use wazgate::server::{create_router, AppState};
use wazgate::store::MetaStore;
use wazgate::substrate::{DockerSubstrate, Substrate};
use wazgate::unit::{EventSink, FileEventSink, Role};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let resolver = Arc::new(ConfigResolver::new(
        Arc::new(FileConfigStore::new(&args.config_dir)),
        Arc::new(ConfigCache::new()),
        args.default_cluster.clone(),
    ));

    let sink: Option<Arc<dyn EventSink>> = args
        .events_dir
        .as_ref()
        .map(|dir| Arc::new(FileEventSink::new(dir)) as Arc<dyn EventSink>);

    let meta = match &args.meta_db {
        Some(url) => Some(Arc::new(
            MetaStore::connect(url)
                .await
                .with_context(|| format!("failed to open meta store at {}", url))?,
        )),
        None => None,
    };

    let sleep_after = args.sleep_after();
    let state = AppState::new(
        resolver,
        sink,
        meta,
        args.default_cluster.clone(),
        args.settings(),
        |role: Role, index: usize| -> Arc<dyn Substrate> {
            Arc::new(DockerSubstrate::new(
                format!("wazgate-{}-{}", role, index),
                sleep_after,
            ))
        },
    );

    let addr = format!("{}:{}", args.bind_addr, args.port);
    info!("Starting wazgate on {}", addr);
    info!("Default cluster: {}", args.default_cluster);

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /health              - Health check");
    info!("  ALL  /dashboard/*         - Dashboard passthrough");
    info!("  POST /api/agents/enroll   - Agent enrollment");
    info!("  ALL  /api/agents/*        - Manager API");
    info!("  ALL  /api/indexer/*       - Indexer API");
    info!("  ALL  /api/certs/*         - Certs API");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
