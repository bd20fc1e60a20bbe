//! Binary entrypoint for the appear platform server: HTTP API, Git
//! smart-HTTP frontend and session relay, each on its own listener.
use anyhow::Context;
use appear_server::{
    build_router,
    config::{self, Configuration, Settings},
    db::init_db,
    docker::ImageBuilder,
    git::GitService,
    k8s::DeployController,
    relay::SessionRelay,
    telemetry::{HTTP_REQUESTS, HTTP_REQUEST_DURATION},
    AppState,
};
use axum::{
    body::Body,
    http::Request,
    middleware::{self, Next},
    response::Response,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "appear-server", about = "git-push platform server")]
struct Cli {
    /// appear configuration file path
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default appear_config.json into the working directory
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();
    let cli = Cli::parse();
    if let Some(Commands::Init) = cli.command {
        config::init_default_config().context("failed to init project config")?;
        info!("initialization successful");
        return Ok(());
    }

    let config_path = match cli.config {
        Some(path) => path,
        None => {
            let path = std::env::current_dir()?.join("appear_config.json");
            info!(path = %path.display(), "configuration file path is missing, defaulting");
            path
        }
    };
    let config = Configuration::load(&config_path)?;
    let settings = Settings::from_env(&config);
    if settings.master_key.is_empty() {
        warn!("master_authorization_key not set");
    }

    let pool = init_db(&config.database_url).await.context("database must be available")?;
    let git = Arc::new(GitService::new(
        PathBuf::from(&config.git_storage_path),
        settings.admin_repo_key.clone(),
        GitService::default_hook_bin(),
        Some(pool.clone()),
    )?);
    let builder = Arc::new(ImageBuilder::from_env(config.registry.clone())?);
    let cluster =
        Arc::new(DeployController::new(&config.k8s_config_dir, config.registry.clone()).await?);
    let relay = Arc::new(SessionRelay::new());

    let state = AppState {
        db: Some(pool),
        relay: relay.clone(),
        builder: Some(builder),
        cluster: Some(cluster),
        git: Some(git.clone()),
        settings: Arc::new(settings.clone()),
    };

    let tcp_addr = settings.tcp_server_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = relay.serve(&tcp_addr).await {
            error!(error = %e, "failed to start tcp server");
            std::process::exit(1);
        }
    });

    let git_addr = format!("0.0.0.0:{}", settings.git_server_port);
    let git_router = git.router();
    tokio::spawn(async move {
        info!(addr = %git_addr, "git server accepting http requests");
        let listener = match tokio::net::TcpListener::bind(&git_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "failed to start git server");
                std::process::exit(1);
            }
        };
        if let Err(e) = axum::serve(listener, git_router).await {
            error!(error = %e, "git server terminated");
            std::process::exit(1);
        }
    });

    const MAX_BODY_BYTES: usize = 1024 * 1024; // 1MB
    let app = build_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(middleware::from_fn(track_metrics));
    let addr = format!("0.0.0.0:{}", settings.api_port);
    info!(%addr, "appear server serving");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = std::time::Instant::now();
    let resp = next.run(req).await;
    let status = resp.status().as_u16().to_string();
    HTTP_REQUESTS
        .with_label_values(&[method.as_str(), path.as_str(), status.as_str()])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[method.as_str(), path.as_str()])
        .observe(start.elapsed().as_secs_f64());
    resp
}
