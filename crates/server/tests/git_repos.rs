use appear_server::git::GitService;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use base64::Engine as _;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use tower::util::ServiceExt;

fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok()
}

fn fake_hook_bin(dir: &std::path::Path) -> PathBuf {
    let path = dir.join("hook-agent-src");
    std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    path
}

fn service(storage: &std::path::Path, hook_bin: PathBuf) -> Arc<GitService> {
    Arc::new(
        GitService::new(storage.to_path_buf(), "adminkey".into(), hook_bin, None).unwrap(),
    )
}

#[tokio::test]
async fn create_repository_installs_working_hook() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let hook_bin = fake_hook_bin(dir.path());
    let git = service(&dir.path().join("repos"), hook_bin);
    git.create_repository("jane", "hello").await.unwrap();

    let repo = dir.path().join("repos/jane/hello.git");
    assert!(repo.join("HEAD").exists(), "bare repository missing");
    let hooks = repo.join("hooks");
    let entries: Vec<String> = std::fs::read_dir(&hooks)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(entries.contains(&"post-receive".to_string()));
    assert!(entries.contains(&"hook-agent".to_string()));
    // The sample hooks git installs by default must be purged.
    assert_eq!(entries.len(), 2, "hooks dir not purged: {entries:?}");

    let stub = std::fs::read_to_string(hooks.join("post-receive")).unwrap();
    assert!(stub.starts_with("#!/bin/sh"));
    assert!(stub.contains("hook-agent"));
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(hooks.join("post-receive")).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0, "post-receive must be executable");
    }
}

#[tokio::test]
async fn repository_creation_is_repeatable() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let hook_bin = fake_hook_bin(dir.path());
    let git = service(&dir.path().join("repos"), hook_bin);
    git.create_repository("jane", "hello").await.unwrap();
    git.create_repository("jane", "hello").await.unwrap();
}

#[tokio::test]
async fn missing_hook_binary_fails_repository_creation() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let git = service(&dir.path().join("repos"), dir.path().join("does-not-exist"));
    let err = git.create_repository("jane", "hello").await.unwrap_err();
    assert!(err.to_string().contains("hook agent binary not found"));
}

fn basic_auth(user: &str, pass: &str) -> String {
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
    )
}

#[tokio::test]
async fn smart_http_requires_auth() {
    let dir = tempfile::tempdir().unwrap();
    let hook_bin = fake_hook_bin(dir.path());
    let git = service(&dir.path().join("repos"), hook_bin);
    let res = git
        .router()
        .oneshot(
            Request::builder()
                .uri("/jane/hello.git/info/refs?service=git-upload-pack")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert!(res.headers().contains_key(header::WWW_AUTHENTICATE));
}

#[tokio::test]
async fn admin_key_authenticates_and_unknown_repo_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let hook_bin = fake_hook_bin(dir.path());
    let git = service(&dir.path().join("repos"), hook_bin);
    let res = git
        .router()
        .oneshot(
            Request::builder()
                .uri("/jane/ghost.git/info/refs?service=git-upload-pack")
                .header(header::AUTHORIZATION, basic_auth("adminkey", "adminkey"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn info_refs_advertises_service() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let hook_bin = fake_hook_bin(dir.path());
    let git = service(&dir.path().join("repos"), hook_bin);
    git.create_repository("jane", "hello").await.unwrap();
    let res = git
        .router()
        .oneshot(
            Request::builder()
                .uri("/jane/hello.git/info/refs?service=git-receive-pack")
                .header(header::AUTHORIZATION, basic_auth("adminkey", "adminkey"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/x-git-receive-pack-advertisement"
    );
    let body = axum::body::to_bytes(res.into_body(), 1024 * 1024).await.unwrap();
    let text = String::from_utf8_lossy(&body);
    assert!(text.starts_with("001f# service=git-receive-pack\n0000"));
}

#[tokio::test]
async fn unknown_service_is_forbidden() {
    let dir = tempfile::tempdir().unwrap();
    let hook_bin = fake_hook_bin(dir.path());
    let git = service(&dir.path().join("repos"), hook_bin);
    let res = git
        .router()
        .oneshot(
            Request::builder()
                .uri("/jane/hello.git/info/refs?service=git-upload-archive")
                .header(header::AUTHORIZATION, basic_auth("adminkey", "adminkey"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}
