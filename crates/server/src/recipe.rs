use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const CONFIG_FILE: &str = "paas_config.json";

const GO_BUILD_PORT: u16 = 9888;
const NODE_PORT: u16 = 9881;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("paas_config.json is missing")]
    Missing,
    #[error("failed to read paas_config.json. malformed json data")]
    Malformed,
}

/// Declarative build options read from `paas_config.json` at the repo root.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub dep: String,
    #[serde(default)]
    pub exec: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub base_dir: String,
}

pub fn read_config(workdir: &Path) -> Result<BuildConfig, ConfigError> {
    let path = workdir.join(CONFIG_FILE);
    let data = fs::read_to_string(path).map_err(|_| ConfigError::Missing)?;
    serde_json::from_str(&data).map_err(|_| ConfigError::Malformed)
}

/// Supported build stacks. Adding a language is one new variant plus its
/// per-variant data below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildKind {
    Go,
    NodeJs,
}

impl BuildKind {
    pub fn from_language(language: &str) -> Self {
        match language {
            "Go" => BuildKind::Go,
            _ => BuildKind::NodeJs,
        }
    }

    pub fn base_image(self) -> &'static str {
        match self {
            BuildKind::Go => "golang:alpine",
            BuildKind::NodeJs => "node:10",
        }
    }

    pub fn port(self) -> u16 {
        match self {
            BuildKind::Go => GO_BUILD_PORT,
            BuildKind::NodeJs => NODE_PORT,
        }
    }

    fn needs_compile_step(self) -> bool {
        matches!(self, BuildKind::Go)
    }

    fn default_dep_command(self) -> &'static str {
        match self {
            BuildKind::Go => "go mod download",
            BuildKind::NodeJs => "npm install",
        }
    }
}

/// A concrete container build recipe for one app.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub kind: BuildKind,
    pub name: String,
    pub dep: String,
    pub exec: String,
    pub envs: BTreeMap<String, String>,
    pub base_dir: String,
}

impl Recipe {
    /// Combine the declared config with registry knowledge; a missing app
    /// name falls back to the registry's name for the app.
    pub fn from_config(cfg: &BuildConfig, fallback_name: &str) -> Self {
        let kind = BuildKind::from_language(&cfg.language);
        let name = if cfg.name.is_empty() { fallback_name.to_string() } else { cfg.name.clone() };
        let dep = if cfg.dep.is_empty() {
            kind.default_dep_command().to_string()
        } else {
            cfg.dep.clone()
        };
        Self {
            kind,
            name,
            dep,
            exec: cfg.exec.clone(),
            envs: cfg.envs.clone(),
            base_dir: cfg.base_dir.clone(),
        }
    }

    /// Render the Dockerfile content.
    pub fn synthesize(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "FROM {}", self.kind.base_image());
        for (k, v) in &self.envs {
            let _ = writeln!(out, "ENV {k}={v}");
        }
        let workdir = if self.base_dir.is_empty() {
            "/usr/src/app/code".to_string()
        } else {
            format!("/go/src/{}/app", self.base_dir)
        };
        let _ = writeln!(out, "WORKDIR {workdir}");
        let _ = writeln!(out, "COPY . {workdir}");
        let _ = writeln!(out, "RUN ls");
        let _ = writeln!(out, "RUN {}", self.dep);
        if self.kind.needs_compile_step() {
            let _ = writeln!(
                out,
                "RUN CGO_ENABLED=0 GOOS=linux go build -o {} -a -installsuffix cgo -ldflags '-w'",
                self.name
            );
        }
        let _ = writeln!(out, "EXPOSE {}", self.kind.port());
        let _ = writeln!(out, "{}", self.exec.trim_end());
        out
    }

    /// Ensure `<workdir>/Dockerfile` exists: a user-supplied recipe wins and
    /// is left untouched; otherwise the synthesized one is written (truncate
    /// then write). Returns whether a file was written.
    pub fn ensure_dockerfile(&self, workdir: &Path) -> anyhow::Result<bool> {
        let path = workdir.join("Dockerfile");
        if path.exists() {
            return Ok(false);
        }
        fs::write(&path, self.synthesize())?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn go_config() -> BuildConfig {
        BuildConfig {
            language: "Go".into(),
            dep: "go mod download".into(),
            exec: "CMD [\"./hello\"]".into(),
            name: "hello".into(),
            ..Default::default()
        }
    }

    #[test]
    fn kind_selection_defaults_to_node() {
        assert_eq!(BuildKind::from_language("Go"), BuildKind::Go);
        assert_eq!(BuildKind::from_language("NodeJs"), BuildKind::NodeJs);
        assert_eq!(BuildKind::from_language(""), BuildKind::NodeJs);
        assert_eq!(BuildKind::from_language("Rust"), BuildKind::NodeJs);
    }

    #[test]
    fn go_recipe_contains_compile_step() {
        let recipe = Recipe::from_config(&go_config(), "ignored");
        let out = recipe.synthesize();
        assert!(out.starts_with("FROM golang:alpine\n"));
        assert!(out.contains("RUN CGO_ENABLED=0 GOOS=linux go build -o hello"));
        assert!(out.contains("EXPOSE 9888"));
        assert!(out.trim_end().ends_with("CMD [\"./hello\"]"));
    }

    #[test]
    fn node_recipe_has_no_compile_step() {
        let cfg = BuildConfig {
            language: "NodeJs".into(),
            dep: "npm install".into(),
            exec: "CMD [\"node\", \"index.js\"]".into(),
            ..Default::default()
        };
        let recipe = Recipe::from_config(&cfg, "web");
        let out = recipe.synthesize();
        assert!(out.starts_with("FROM node:10\n"));
        assert!(!out.contains("go build"));
        assert!(out.contains("EXPOSE 9881"));
        assert_eq!(recipe.name, "web");
    }

    #[test]
    fn env_lines_emitted_for_each_entry() {
        let mut cfg = go_config();
        cfg.envs.insert("A".into(), "1".into());
        cfg.envs.insert("B".into(), "two".into());
        let out = Recipe::from_config(&cfg, "hello").synthesize();
        assert!(out.contains("ENV A=1\n"));
        assert!(out.contains("ENV B=two\n"));
    }

    #[test]
    fn base_dir_switches_workdir() {
        let mut cfg = go_config();
        cfg.base_dir = "github.com/jane/hello".into();
        let out = Recipe::from_config(&cfg, "hello").synthesize();
        assert!(out.contains("WORKDIR /go/src/github.com/jane/hello/app\n"));
        let plain = Recipe::from_config(&go_config(), "hello").synthesize();
        assert!(plain.contains("WORKDIR /usr/src/app/code\n"));
    }

    #[test]
    fn empty_dep_falls_back_to_stack_default() {
        let cfg = BuildConfig::default();
        let recipe = Recipe::from_config(&cfg, "web");
        assert_eq!(recipe.dep, "npm install");
        let go = BuildConfig { language: "Go".into(), ..Default::default() };
        assert_eq!(Recipe::from_config(&go, "web").dep, "go mod download");
    }

    #[test]
    fn config_read_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(read_config(dir.path()), Err(ConfigError::Missing)));
        fs::write(dir.path().join(CONFIG_FILE), "{").unwrap();
        assert!(matches!(read_config(dir.path()), Err(ConfigError::Malformed)));
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"language":"Go","dep":"go mod download","exec":"CMD [\"./a\"]","name":"a"}"#,
        )
        .unwrap();
        let cfg = read_config(dir.path()).unwrap();
        assert_eq!(cfg.language, "Go");
        assert_eq!(cfg.name, "a");
    }

    #[test]
    fn user_dockerfile_wins() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        let recipe = Recipe::from_config(&go_config(), "hello");
        assert!(!recipe.ensure_dockerfile(dir.path()).unwrap());
        assert_eq!(fs::read_to_string(dir.path().join("Dockerfile")).unwrap(), "FROM scratch\n");
    }
}
