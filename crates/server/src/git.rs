use crate::auth::verify_password;
use crate::models::User;
use anyhow::{bail, Context};
use axum::{
    body::Body,
    extract::{Path as UrlPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::Engine as _;
use flate2::read::GzDecoder;
use serde::Deserialize;
use sqlx::{Pool, Postgres};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

const UPLOAD_PACK: &str = "git-upload-pack";
const RECEIVE_PACK: &str = "git-receive-pack";
const HOOK_AGENT_NAME: &str = "hook-agent";
/// Upper bound on a single pushed pack.
const MAX_PACK_BYTES: usize = 1024 * 1024 * 1024;

/// Hosts authenticated Git smart-HTTP and owns the bare repositories on
/// disk, including the post-receive hook installed into each of them.
pub struct GitService {
    storage: PathBuf,
    admin_key: String,
    hook_bin: PathBuf,
    db: Option<Pool<Postgres>>,
}

impl GitService {
    pub fn new(
        storage: PathBuf,
        admin_key: String,
        hook_bin: PathBuf,
        db: Option<Pool<Postgres>>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&storage)
            .with_context(|| format!("failed to create git storage at {}", storage.display()))?;
        Ok(Self { storage, admin_key, hook_bin, db })
    }

    /// Default location of the hook agent binary: `APPEAR_HOOK_BIN`, or
    /// `appear-hook` next to the server executable.
    pub fn default_hook_bin() -> PathBuf {
        if let Ok(path) = std::env::var("APPEAR_HOOK_BIN") {
            return PathBuf::from(path);
        }
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|d| d.join("appear-hook")))
            .unwrap_or_else(|| PathBuf::from("appear-hook"))
    }

    pub fn repo_dir(&self, owner: &str, repo: &str) -> PathBuf {
        self.storage.join(owner).join(repo)
    }

    /// Create `<storage>/<owner>/<app>.git`, run `git init --bare` and
    /// install the post-receive hook. The repository is not usable (and this
    /// call fails) unless the hook is in place.
    pub async fn create_repository(&self, owner: &str, app_name: &str) -> anyhow::Result<()> {
        let full = self.repo_dir(owner, &format!("{app_name}.git"));
        std::fs::create_dir_all(&full)
            .with_context(|| format!("failed to create {}", full.display()))?;
        let status = Command::new("git")
            .arg("init")
            .arg("--bare")
            .current_dir(&full)
            .status()
            .await
            .context("failed to run git init")?;
        if !status.success() {
            bail!("git init --bare failed for {}", full.display());
        }
        self.install_hooks(&full)?;
        info!(repo = %full.display(), "created bare repository");
        Ok(())
    }

    /// Purge `hooks/`, write the post-receive stub and copy the hook agent
    /// binary next to it so the stub can exec it by absolute path.
    fn install_hooks(&self, repo: &Path) -> anyhow::Result<()> {
        let hooks = repo.join("hooks");
        if let Ok(entries) = std::fs::read_dir(&hooks) {
            for entry in entries.flatten() {
                std::fs::remove_dir_all(entry.path())
                    .or_else(|_| std::fs::remove_file(entry.path()))
                    .with_context(|| format!("failed to purge {}", entry.path().display()))?;
            }
        }
        std::fs::create_dir_all(&hooks)?;
        let agent = hooks.join(HOOK_AGENT_NAME);
        std::fs::copy(&self.hook_bin, &agent).with_context(|| {
            format!("hook agent binary not found at {}", self.hook_bin.display())
        })?;
        let stub = format!("#!/bin/sh\nexec \"{}\"\n", agent.display());
        let stub_path = hooks.join("post-receive");
        std::fs::write(&stub_path, stub)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub_path, std::fs::Permissions::from_mode(0o755))?;
            std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    }

    /// Best-effort removal of an app's bare repository, used to undo a
    /// partially completed app creation.
    pub fn remove_repository(&self, owner: &str, app_name: &str) {
        let full = self.repo_dir(owner, &format!("{app_name}.git"));
        if let Err(e) = std::fs::remove_dir_all(&full) {
            warn!(error = %e, repo = %full.display(), "failed to remove repository");
        }
    }

    /// Clone the repository at HEAD into `clone_path` using the admin repo
    /// key as basic auth. The previous checkout is discarded first so every
    /// push builds the just-pushed revision; a directory that already holds a
    /// repository is opened in place only when the fresh clone fails.
    /// Returns the HEAD commit author email.
    pub async fn clone_at_head(&self, clone_path: &Path, repo_url: &str) -> anyhow::Result<String> {
        let mut url = url::Url::parse(repo_url).context("invalid repository url")?;
        url.set_username(&self.admin_key)
            .ok()
            .context("cannot set credentials on repository url")?;
        let _ = url.set_password(Some(&self.admin_key));

        let _ = std::fs::remove_dir_all(clone_path);
        let status = Command::new("git")
            .arg("clone")
            .arg(url.as_str())
            .arg(clone_path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .status()
            .await
            .context("failed to run git clone")?;
        if !status.success() {
            let has_repo = clone_path.join("HEAD").exists() || clone_path.join(".git").exists();
            if !has_repo {
                bail!("git clone failed for {repo_url}");
            }
        }
        let out = Command::new("git")
            .arg("-C")
            .arg(clone_path)
            .args(["log", "-1", "--format=%ae"])
            .output()
            .await
            .context("failed to read HEAD commit")?;
        if !out.status.success() {
            bail!("git log failed in {}", clone_path.display());
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Basic-auth check: the admin repo key passes outright; anything else is
    /// matched against a user's email and bcrypt password hash.
    pub async fn verify_repository_user(&self, username: &str, password: &str) -> bool {
        if !self.admin_key.is_empty() && username == self.admin_key {
            return true;
        }
        let Some(pool) = self.db.as_ref() else { return false };
        let user = sqlx::query_as::<_, User>(
            "SELECT id, email, name, password_hash, created_at FROM users WHERE email = $1",
        )
        .bind(username)
        .fetch_optional(pool)
        .await;
        match user {
            Ok(Some(user)) => verify_password(password, &user.password_hash),
            _ => false,
        }
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/:owner/:repo/info/refs", get(info_refs))
            .route("/:owner/:repo/git-upload-pack", post(upload_pack))
            .route("/:owner/:repo/git-receive-pack", post(receive_pack))
            .with_state(Arc::clone(self))
    }
}

#[derive(Deserialize)]
struct InfoRefsQuery {
    #[serde(default)]
    service: String,
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"appear\"")],
        "auth required",
    )
        .into_response()
}

async fn authorize(git: &GitService, headers: &HeaderMap) -> Result<(), Response> {
    let creds = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|v| base64::engine::general_purpose::STANDARD.decode(v.trim()).ok())
        .and_then(|raw| String::from_utf8(raw).ok());
    let Some(creds) = creds else { return Err(unauthorized()) };
    let (username, password) = creds.split_once(':').unwrap_or((creds.as_str(), ""));
    if git.verify_repository_user(username, password).await {
        Ok(())
    } else {
        Err(unauthorized())
    }
}

fn rpc_command(service: &str) -> Option<&'static str> {
    match service {
        UPLOAD_PACK => Some("upload-pack"),
        RECEIVE_PACK => Some("receive-pack"),
        _ => None,
    }
}

fn resolve_repo(git: &GitService, owner: &str, repo: &str) -> Result<PathBuf, Response> {
    if owner.contains("..") || repo.contains("..") || !repo.ends_with(".git") {
        return Err(StatusCode::NOT_FOUND.into_response());
    }
    let dir = git.repo_dir(owner, repo);
    if !dir.join("HEAD").exists() {
        return Err(StatusCode::NOT_FOUND.into_response());
    }
    Ok(dir)
}

/// Length-prefixed pkt-line frame.
fn pkt_line(data: &str) -> String {
    format!("{:04x}{data}", data.len() + 4)
}

async fn info_refs(
    State(git): State<Arc<GitService>>,
    UrlPath((owner, repo)): UrlPath<(String, String)>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&git, &headers).await {
        return resp;
    }
    let Some(rpc) = rpc_command(&query.service) else {
        return (StatusCode::FORBIDDEN, "smart http is required").into_response();
    };
    let dir = match resolve_repo(&git, &owner, &repo) {
        Ok(dir) => dir,
        Err(resp) => return resp,
    };
    let out = Command::new("git")
        .arg(rpc)
        .arg("--stateless-rpc")
        .arg("--advertise-refs")
        .arg(&dir)
        .output()
        .await;
    let out = match out {
        Ok(out) if out.status.success() => out,
        other => {
            warn!(?other, "ref advertisement failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let mut body = pkt_line(&format!("# service={}\n", query.service)).into_bytes();
    body.extend_from_slice(b"0000");
    body.extend_from_slice(&out.stdout);
    (
        [
            (
                header::CONTENT_TYPE,
                format!("application/x-{}-advertisement", query.service),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        body,
    )
        .into_response()
}

async fn upload_pack(
    state: State<Arc<GitService>>,
    path: UrlPath<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    service_rpc(state, path, headers, body, UPLOAD_PACK).await
}

async fn receive_pack(
    state: State<Arc<GitService>>,
    path: UrlPath<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    service_rpc(state, path, headers, body, RECEIVE_PACK).await
}

/// Pipe the request body into `git <service> --stateless-rpc <dir>` and
/// stream its stdout back. The post-receive hook runs as a child of
/// receive-pack, so its output reaches the pushing client over sideband.
async fn service_rpc(
    State(git): State<Arc<GitService>>,
    UrlPath((owner, repo)): UrlPath<(String, String)>,
    headers: HeaderMap,
    body: Body,
    service: &str,
) -> Response {
    if let Err(resp) = authorize(&git, &headers).await {
        return resp;
    }
    let rpc = match rpc_command(service) {
        Some(rpc) => rpc,
        None => return StatusCode::FORBIDDEN.into_response(),
    };
    let dir = match resolve_repo(&git, &owner, &repo) {
        Ok(dir) => dir,
        Err(resp) => return resp,
    };
    let bytes = match axum::body::to_bytes(body, MAX_PACK_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to read rpc body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("gzip"));
    let payload = if gzipped {
        let mut decoded = Vec::new();
        if GzDecoder::new(&bytes[..]).read_to_end(&mut decoded).is_err() {
            return StatusCode::BAD_REQUEST.into_response();
        }
        decoded
    } else {
        bytes.to_vec()
    };

    let child = Command::new("git")
        .arg(rpc)
        .arg("--stateless-rpc")
        .arg(&dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, "failed to spawn git");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            let _ = stdin.write_all(&payload).await;
            let _ = stdin.shutdown().await;
        });
    }
    let out = match child.wait_with_output().await {
        Ok(out) => out,
        Err(e) => {
            warn!(error = %e, "git rpc failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    (
        [
            (header::CONTENT_TYPE, format!("application/x-{service}-result")),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        out.stdout,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkt_line_length_prefix() {
        assert_eq!(pkt_line("# service=git-upload-pack\n"), "001e# service=git-upload-pack\n");
        assert_eq!(pkt_line(""), "0004");
    }

    #[test]
    fn rpc_command_rejects_unknown_services() {
        assert_eq!(rpc_command("git-upload-pack"), Some("upload-pack"));
        assert_eq!(rpc_command("git-receive-pack"), Some("receive-pack"));
        assert_eq!(rpc_command("git-upload-archive"), None);
        assert_eq!(rpc_command(""), None);
    }
}
