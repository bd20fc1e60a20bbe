use crate::config::RegistryConfig;
use crate::util;
use bollard::auth::DockerCredentials;
use bollard::image::{BuildImageOptions, PushImageOptions};
use bollard::Docker;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::fmt::Debug;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::info;

/// Wraps the container engine client: builds an image from a work directory
/// and pushes it to the configured registry, exposing each engine event as a
/// line on a bounded log channel.
pub struct ImageBuilder {
    docker: Docker,
    registry: RegistryConfig,
}

pub struct BuildOutput {
    pub tag: String,
    pub pull_path: String,
    pub log: mpsc::Receiver<String>,
}

impl ImageBuilder {
    pub fn new(docker: Docker, registry: RegistryConfig) -> Self {
        Self { docker, registry }
    }

    pub fn from_env(registry: RegistryConfig) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(docker, registry))
    }

    /// Build `<workdir>` (which must already contain a Dockerfile) into an
    /// image tagged `<registry><app>:<6 hex>`. The tag is regenerated per
    /// build so cluster pulls are never satisfied by a cached digest.
    pub fn build_local_image(&self, workdir: &Path, app_name: &str) -> anyhow::Result<BuildOutput> {
        let context = build_context(workdir)?;
        let tag = util::random_hex(6);
        let pull_path = format!("{}{}:{}", self.registry.url, app_name, tag);
        info!(%pull_path, "starting image build");
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: pull_path.clone(),
            pull: true,
            rm: true,
            ..Default::default()
        };
        let docker = self.docker.clone();
        let (tx, rx) = mpsc::channel::<String>(1);
        tokio::spawn(async move {
            let stream = docker.build_image(options, None, Some(context.into()));
            pump_engine_frames(stream, tx).await;
        });
        Ok(BuildOutput { tag, pull_path, log: rx })
    }

    /// Push a previously built image; returns its event log channel.
    pub fn push_image(&self, pull_path: &str) -> mpsc::Receiver<String> {
        info!(%pull_path, "pushing image");
        let credentials = DockerCredentials {
            username: Some(self.registry.username.clone()),
            password: Some(self.registry.password.clone()),
            serveraddress: Some(self.registry.url.trim_end_matches('/').to_string()),
            ..Default::default()
        };
        let docker = self.docker.clone();
        let name = pull_path.to_string();
        let (tx, rx) = mpsc::channel::<String>(1);
        tokio::spawn(async move {
            let stream = docker.push_image(&name, None::<PushImageOptions<String>>, Some(credentials));
            pump_engine_frames(stream, tx).await;
        });
        rx
    }
}

/// Package the work directory as an uncompressed tar stream for the engine.
fn build_context(workdir: &Path) -> anyhow::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", workdir)?;
    Ok(builder.into_inner()?)
}

/// Drain an engine event stream into a capacity-1 channel of JSON frames;
/// the producer blocks on the consumer. Any error, engine-reported or
/// transport-level, becomes one final `{"error":...}` frame so consumers can
/// recognize it as terminal, then the channel closes.
async fn pump_engine_frames<T, S>(stream: S, tx: mpsc::Sender<String>)
where
    T: Serialize + Debug,
    S: Stream<Item = Result<T, bollard::errors::Error>>,
{
    futures_util::pin_mut!(stream);
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(item) => {
                let line = serde_json::to_string(&item).unwrap_or_else(|_| format!("{item:?}"));
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let frame = serde_json::json!({"error": e.to_string()}).to_string();
                let _ = tx.send(frame).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[derive(Serialize, Debug)]
    struct Frame {
        stream: String,
    }

    #[tokio::test]
    async fn frames_forwarded_in_order_then_closed() {
        let items = vec![
            Ok(Frame { stream: "Step 1/4".into() }),
            Ok(Frame { stream: "Step 2/4".into() }),
        ];
        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(pump_engine_frames(stream::iter(items), tx));
        assert_eq!(rx.recv().await.unwrap(), r#"{"stream":"Step 1/4"}"#);
        assert_eq!(rx.recv().await.unwrap(), r#"{"stream":"Step 2/4"}"#);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn transport_error_becomes_terminal_error_frame() {
        let items: Vec<Result<Frame, bollard::errors::Error>> = vec![
            Ok(Frame { stream: "Step 1/4".into() }),
            Err(bollard::errors::Error::IOError {
                err: std::io::Error::new(std::io::ErrorKind::Other, "engine exploded"),
            }),
            Ok(Frame { stream: "never delivered".into() }),
        ];
        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(pump_engine_frames(stream::iter(items), tx));
        assert_eq!(rx.recv().await.unwrap(), r#"{"stream":"Step 1/4"}"#);
        let err_line = rx.recv().await.unwrap();
        let decoded: serde_json::Value = serde_json::from_str(&err_line).unwrap();
        assert!(decoded["error"].as_str().unwrap().contains("engine exploded"));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn build_context_packs_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::write(dir.path().join("main.go"), "package main\n").unwrap();
        let bytes = build_context(dir.path()).unwrap();
        let mut archive = tar::Archive::new(&bytes[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("Dockerfile")));
        assert!(names.iter().any(|n| n.ends_with("main.go")));
    }
}
