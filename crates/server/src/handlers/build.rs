use crate::error::ApiResponse;
use crate::models::HookInfo;
use crate::recipe::{self, ConfigError, Recipe};
use crate::registry::AppRegistry;
use crate::relay::SessionRelay;
use crate::AppState;
use anyhow::{anyhow, bail, Context};
use axum::{extract::State, Json};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const CLONE_DEADLINE: Duration = Duration::from_secs(2 * 60);
const BUILD_DEADLINE: Duration = Duration::from_secs(15 * 60);
const PUSH_DEADLINE: Duration = Duration::from_secs(10 * 60);
const DEPLOY_DEADLINE: Duration = Duration::from_secs(2 * 60);

/// Push-to-deploy pipeline, driven by the post-receive hook. The push has
/// already been accepted by the time this runs, so failures are reported as
/// HTTP 200 with `{error:true}` and a final line on the session stream; the
/// hook only relays status to the user's terminal.
pub async fn build_app(
    State(state): State<AppState>,
    Json(req): Json<HookInfo>,
) -> Json<ApiResponse> {
    let key = req.key.trim().to_string();
    info!(repo = %req.repo_name, git_ref = %req.git_ref, "build request received");
    match run_pipeline(&state, &req, &key).await {
        Ok(()) => Json(ApiResponse::ok("deployment updated", None)),
        Err(e) => {
            let msg = format!("{e:#}");
            emit(&state.relay, &key, &msg).await;
            Json(ApiResponse::fail(msg))
        }
    }
}

async fn run_pipeline(state: &AppState, req: &HookInfo, key: &str) -> anyhow::Result<()> {
    let relay = &state.relay;
    let pool = state.db.as_ref().context("database not ready")?;
    let git = state.git.as_ref().context("git service not ready")?;
    let builder = state.builder.as_ref().context("container engine not ready")?;
    let cluster = state.cluster.as_ref().context("cluster not ready")?;
    let registry = AppRegistry::new(
        pool.clone(),
        git.clone(),
        cluster.clone(),
        state.settings.repo_base_url.clone(),
    );

    let repo_url = format!(
        "{}/{}",
        state.settings.repo_base_url,
        canonical_repo_tail(&req.repo_path)
    );
    let Some(mut app) = registry.get_app_by_repo_url(&repo_url).await? else {
        bail!("404: app not found");
    };

    let clone_path = PathBuf::from(&state.settings.build_path).join(&req.repo_name);
    let author = tokio::time::timeout(CLONE_DEADLINE, git.clone_at_head(&clone_path, &app.repo_url))
        .await
        .map_err(|_| anyhow!("timeout cloning repository"))?
        .context("failed to build repo")?;
    emit(relay, key, &format!("calling user is {author}")).await;

    let config = match recipe::read_config(&clone_path) {
        Ok(config) => config,
        Err(ConfigError::Missing) => {
            emit(relay, key, "paas_config.json is missing").await;
            recipe::BuildConfig { name: app.name.clone(), ..Default::default() }
        }
        Err(e @ ConfigError::Malformed) => return Err(e.into()),
    };
    let recipe = Recipe::from_config(&config, &app.name);
    recipe
        .ensure_dockerfile(&clone_path)
        .context("failed to write build recipe")?;

    // Build and push are strictly sequential; the deploy must not start
    // before the push has completed.
    let output = builder
        .build_local_image(&clone_path, &recipe.name)
        .context("failed to build image")?;
    let pull_path = output.pull_path.clone();
    forward_log(relay, key, output.log, BUILD_DEADLINE)
        .await
        .context("failed to build image")?;

    emit(relay, key, &format!("pushing image {pull_path}")).await;
    let push_log = builder.push_image(&pull_path);
    forward_log(relay, key, push_log, PUSH_DEADLINE)
        .await
        .context("failed to push image")?;

    app.image_name = pull_path;
    registry.update_image(&app).await.context("failed to update deployment")?;
    tokio::time::timeout(DEPLOY_DEADLINE, cluster.update_deployment(&app))
        .await
        .map_err(|_| anyhow!("timeout updating deployment"))?
        .context("failed to update deployment")?;

    registry
        .log_deployment_event(&author, app.id)
        .await
        .context("failed to log deployment event")?;
    emit(relay, key, "deployment updated").await;
    Ok(())
}

/// Canonical repo tail: the last two path segments of the bare repo path,
/// which joined to the repo server base give the app's repository URL.
fn canonical_repo_tail(repo_path: &str) -> String {
    let parts: Vec<&str> = repo_path.split('/').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        [.., owner, repo] => format!("{owner}/{repo}"),
        _ => repo_path.trim_matches('/').to_string(),
    }
}

#[derive(Deserialize, Default)]
struct EngineFrame {
    stream: Option<String>,
    status: Option<String>,
    error: Option<String>,
}

/// Decode one engine event into a user-facing line; JSON frames yield their
/// stream/status text, anything else passes through raw. The second value
/// carries an engine-reported error, which terminates the pipeline.
fn decode_engine_frame(frame: &str) -> (String, Option<String>) {
    match serde_json::from_str::<EngineFrame>(frame) {
        Ok(decoded) => {
            if let Some(err) = decoded.error {
                return (err.clone(), Some(err));
            }
            let line = decoded.stream.or(decoded.status).unwrap_or_default();
            (line.trim_end().to_string(), None)
        }
        Err(_) => (frame.trim_end().to_string(), None),
    }
}

/// Forward every engine log frame to the session stream, FIFO, until the
/// channel closes or the step deadline expires.
async fn forward_log(
    relay: &SessionRelay,
    key: &str,
    mut log: mpsc::Receiver<String>,
    deadline: Duration,
) -> anyhow::Result<()> {
    let failure = tokio::time::timeout(deadline, async {
        let mut failure: Option<String> = None;
        while let Some(frame) = log.recv().await {
            let (line, error) = decode_engine_frame(&frame);
            if !line.is_empty() {
                emit(relay, key, &line).await;
            }
            if error.is_some() {
                failure = error;
            }
        }
        failure
    })
    .await
    .map_err(|_| anyhow!("timeout"))?;
    match failure {
        Some(err) => bail!(err),
        None => Ok(()),
    }
}

/// Relay delivery is best-effort: the push has already happened, so a write
/// failure is logged and never fails the pipeline.
async fn emit(relay: &SessionRelay, key: &str, msg: &str) {
    info!(%key, %msg, "pipeline");
    if let Err(e) = relay.write(key, msg).await {
        warn!(error = %e, "failed to write message to relay client");
    }
}
