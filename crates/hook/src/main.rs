//! Post-receive hook agent. Invoked by the Git daemon inside a bare
//! repository with `<old-rev> <new-rev> <ref>` on stdin; posts a build
//! request to the platform and copies the session's relayed build output to
//! stdout, which Git forwards to the pushing user's terminal.
use anyhow::{bail, Context, Result};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const DEFAULT_RELAY_ADDR: &str = "localhost:9010";
const DEFAULT_BUILD_URL: &str = "http://localhost:9060/api/build";

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
struct HookInfo {
    repo_name: String,
    repo_path: String,
    old_rev: String,
    new_rev: String,
    #[serde(rename = "ref")]
    git_ref: String,
    ref_type: String,
    ref_name: String,
    key: String,
}

#[derive(Deserialize, Debug, Default)]
struct BuildResponse {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    message: String,
}

fn parse_hook_input(line: &str, workdir: &Path) -> Result<HookInfo> {
    let chunks: Vec<&str> = line.split(' ').collect();
    if chunks.len() != 3 {
        bail!("invalid hook input");
    }
    let ref_chunks: Vec<&str> = chunks[2].split('/').collect();
    Ok(HookInfo {
        repo_name: workdir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        repo_path: workdir.to_string_lossy().into_owned(),
        old_rev: chunks[0].to_string(),
        new_rev: chunks[1].to_string(),
        git_ref: chunks[2].to_string(),
        ref_type: ref_chunks.get(1).copied().unwrap_or_default().to_string(),
        ref_name: ref_chunks.get(2).copied().unwrap_or_default().to_string(),
        key: String::new(),
    })
}

fn session_key() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(char::from)
        .collect();
    format!("key{suffix}")
}

async fn run() -> Result<()> {
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("failed to read hook input")?;
    let workdir = std::env::current_dir().context("failed to read hook working directory")?;
    let mut info = parse_hook_input(line.trim_end(), &workdir)?;
    info.key = session_key();

    let relay_addr =
        std::env::var("APPEAR_RELAY_ADDR").unwrap_or_else(|_| DEFAULT_RELAY_ADDR.to_string());
    let stream = TcpStream::connect(&relay_addr)
        .await
        .context("internal TCP server error")?;
    let (mut relay_read, mut relay_write) = stream.into_split();
    relay_write
        .write_all(format!("connect|{}\n", info.key).as_bytes())
        .await
        .context("failed to register client")?;
    let pump = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let _ = tokio::io::copy(&mut relay_read, &mut stdout).await;
    });

    println!("Building app...");
    let build_url =
        std::env::var("APPEAR_BUILD_URL").unwrap_or_else(|_| DEFAULT_BUILD_URL.to_string());
    let response = reqwest::Client::new()
        .post(&build_url)
        .json(&info)
        .send()
        .await
        .context("error response from API")?;
    let result: BuildResponse = response.json().await.context("failed to decode response")?;

    // Give in-flight relay bytes a moment to land on stdout before exiting.
    tokio::time::sleep(Duration::from_millis(250)).await;
    pump.abort();

    if result.error {
        bail!("failed to build app: {}", result.message);
    }
    println!("app built: {}", result.message);
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        println!("{e:#}");
        std::process::exit(1);
    }
}
