use crate::config::RegistryConfig;
use crate::models::App;
use anyhow::{anyhow, Context};
use base64::Engine as _;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    EnvVar, Namespace, Node, PersistentVolume, PersistentVolumeClaim, Pod, Secret, Service,
};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{DeleteParams, ListParams, LogParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

pub const NAMESPACE: &str = "appear-namespace";
/// Every app Service listens on this fixed internal port; external traffic
/// reaches it through the NodePort preserved across updates.
pub const STABLE_PORT: i32 = 6003;
const REGISTRY_SECRET: &str = "appear-registry-secret";
const LOG_CAP_BYTES: usize = 1 << 20;
const CONFLICT_RETRIES: u32 = 4;

/// Drives the cluster control plane: one Deployment+Service+Ingress triple
/// per app in a fixed namespace, plus database provisioning.
pub struct DeployController {
    client: Client,
    registry: RegistryConfig,
}

#[derive(Debug, Clone)]
pub struct ProvisionDatabaseOpts {
    pub name: String,
    pub base_image: String,
    pub default_port: i32,
    pub space_gi: i64,
    pub username_key: String,
    pub password_key: String,
    pub database_name_key: String,
    pub data_mount_path: String,
    pub envs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseCredential {
    pub username: String,
    pub password: String,
    pub database_name: String,
}

impl DeployController {
    /// Build a client from `<k8s_config_dir>/config` when present, falling
    /// back to the ambient kubeconfig/in-cluster config. Ensures the platform
    /// namespace and registry pull secret exist; a secret-creation failure is
    /// a warning only.
    pub async fn new(k8s_config_dir: &str, registry: RegistryConfig) -> anyhow::Result<Self> {
        let client = build_client(k8s_config_dir).await?;
        let controller = Self { client, registry };
        controller.ensure_namespace().await;
        if let Err(e) = controller.create_registry_secret().await {
            warn!(error = %e, "cannot create private registry secret");
        }
        Ok(controller)
    }

    async fn ensure_namespace(&self) {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": NAMESPACE}});
        match typed::<Namespace>(ns) {
            Ok(ns) => {
                if let Err(e) = api.create(&PostParams::default(), &ns).await {
                    warn!(error = %e, "failed to create namespace");
                }
            }
            Err(e) => warn!(error = %e, "bad namespace manifest"),
        }
    }

    async fn create_registry_secret(&self) -> anyhow::Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), NAMESPACE);
        let secret = typed::<Secret>(registry_secret_manifest(&self.registry))?;
        api.create(&PostParams::default(), &secret).await?;
        Ok(())
    }

    /// Idempotence is the caller's concern: invoked once per app creation,
    /// this deploys the default nginx image behind a NodePort Service and an
    /// nginx-class Ingress.
    pub async fn bootstrap_app(&self, app: &App) -> anyhow::Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), NAMESPACE);
        let manifest = app_deployment_manifest(
            &app.deployment_name(),
            "nginx",
            &app.name,
            &BTreeMap::new(),
            STABLE_PORT,
        );
        deployments
            .create(&PostParams::default(), &typed::<Deployment>(manifest)?)
            .await
            .with_context(|| format!("failed to create deployment for app {}", app.name))?;

        let services: Api<Service> = Api::namespaced(self.client.clone(), NAMESPACE);
        let manifest = app_service_manifest(&app.name, 80, None);
        services
            .create(&PostParams::default(), &typed::<Service>(manifest)?)
            .await
            .with_context(|| format!("failed to create service for app {}", app.name))?;

        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), NAMESPACE);
        match typed::<Ingress>(app_ingress_manifest(&app.name, 80)) {
            Ok(ingress) => {
                if let Err(e) = ingresses.create(&PostParams::default(), &ingress).await {
                    warn!(error = %e, "failed to create ingress for service");
                }
            }
            Err(e) => warn!(error = %e, "bad ingress manifest"),
        }
        Ok(())
    }

    /// Best-effort removal of whatever `bootstrap_app` managed to create, so
    /// a failed app creation leaves no cluster objects behind. Missing
    /// objects are fine; anything else is only logged.
    pub async fn teardown_app(&self, app: &App) {
        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), NAMESPACE);
        delete_if_exists(&ingresses, &format!("{}-ingress", app.name), "ingress").await;
        let services: Api<Service> = Api::namespaced(self.client.clone(), NAMESPACE);
        delete_if_exists(&services, &app.name, "service").await;
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), NAMESPACE);
        delete_if_exists(&deployments, &app.deployment_name(), "deployment").await;
    }

    /// Swap the app's Deployment onto its freshly pushed image while
    /// preserving the externally visible NodePort. Version conflicts retry
    /// the whole sequence; every other error is terminal.
    pub async fn update_deployment(&self, app: &App) -> anyhow::Result<()> {
        info!(image = %app.image_name, "updating deployment");
        let mut backoff = ConflictBackoff::new();
        loop {
            let err = match self.swap_image(app).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if is_conflict(&err) && backoff.pause().await {
                warn!(app = %app.name, "version conflict during image swap, retrying");
                continue;
            }
            return Err(err);
        }
    }

    async fn swap_image(&self, app: &App) -> anyhow::Result<()> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), NAMESPACE);
        let svc = services
            .get(&app.name)
            .await
            .context("failed to find deployment service")?;
        let node_port = svc
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .and_then(|p| p.first())
            .and_then(|p| p.node_port);

        services.delete(&app.name, &DeleteParams::default()).await?;
        let manifest = app_service_manifest(&app.name, STABLE_PORT, node_port);
        services.create(&PostParams::default(), &typed::<Service>(manifest)?).await?;

        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), NAMESPACE);
        let ingress_name = format!("{}-ingress", app.name);
        // Tolerate a missing Ingress so a retried sequence is re-executable.
        match ingresses.delete(&ingress_name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
        let manifest = app_ingress_manifest(&app.name, STABLE_PORT);
        ingresses.create(&PostParams::default(), &typed::<Ingress>(manifest)?).await?;

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), NAMESPACE);
        let name = app.deployment_name();
        let mut deployment = deployments.get(&name).await.context("failed to get deployment object")?;
        let containers = deployment
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
            .map(|ps| &mut ps.containers)
            .ok_or_else(|| anyhow!("deployment {name} has no pod spec"))?;
        containers
            .first_mut()
            .ok_or_else(|| anyhow!("deployment {name} has no containers"))?
            .image = Some(app.image_name.clone());
        deployments.replace(&name, &PostParams::default(), &deployment).await?;
        Ok(())
    }

    /// Concatenated logs of every pod whose name starts with the app name,
    /// capped at 1 MiB.
    pub async fn logs(&self, app_name: &str) -> anyhow::Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), NAMESPACE);
        let list = pods.list(&ListParams::default()).await?;
        let mut out = String::new();
        for pod in list.items {
            let name = pod.metadata.name.clone().unwrap_or_default();
            if !name.starts_with(app_name) {
                continue;
            }
            let text = pods
                .logs(&name, &LogParams::default())
                .await
                .with_context(|| format!("failed to stream logs for pod {name}"))?;
            let remaining = LOG_CAP_BYTES.saturating_sub(out.len());
            if remaining == 0 {
                break;
            }
            if text.len() > remaining {
                let mut cut = remaining;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                out.push_str(&text[..cut]);
                break;
            }
            out.push_str(&text);
        }
        Ok(out)
    }

    pub async fn scale(&self, deployment_name: &str, replicas: i32) -> anyhow::Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), NAMESPACE);
        let mut backoff = ConflictBackoff::new();
        loop {
            let err = match async {
                let mut deployment = deployments.get(deployment_name).await?;
                if let Some(spec) = deployment.spec.as_mut() {
                    spec.replicas = Some(replicas);
                }
                deployments
                    .replace(deployment_name, &PostParams::default(), &deployment)
                    .await?;
                Ok::<_, anyhow::Error>(())
            }
            .await
            {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if is_conflict(&err) && backoff.pause().await {
                continue;
            }
            return Err(err);
        }
    }

    /// Append environment variables to the app container; existing entries
    /// are never removed.
    pub async fn update_env(&self, app: &App, envs: &BTreeMap<String, String>) -> anyhow::Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), NAMESPACE);
        let name = app.deployment_name();
        let mut backoff = ConflictBackoff::new();
        loop {
            let err = match async {
                let mut deployment = deployments.get(&name).await?;
                let container = deployment
                    .spec
                    .as_mut()
                    .and_then(|s| s.template.spec.as_mut())
                    .and_then(|ps| ps.containers.first_mut())
                    .ok_or_else(|| anyhow!("deployment {name} has no containers"))?;
                let list = container.env.get_or_insert_with(Vec::new);
                for (k, v) in envs {
                    list.push(EnvVar { name: k.clone(), value: Some(v.clone()), value_from: None });
                }
                deployments.replace(&name, &PostParams::default(), &deployment).await?;
                Ok::<_, anyhow::Error>(())
            }
            .await
            {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if is_conflict(&err) && backoff.pause().await {
                continue;
            }
            return Err(err);
        }
    }

    /// Node hosting the first pod whose name has the given prefix.
    pub async fn get_pod_node(&self, prefix: &str) -> anyhow::Result<Node> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), NAMESPACE);
        let list = pods.list(&ListParams::default()).await?;
        for pod in list.items {
            let name = pod.metadata.name.clone().unwrap_or_default();
            if !name.starts_with(prefix) {
                continue;
            }
            let node_name = pod
                .spec
                .and_then(|s| s.node_name)
                .ok_or_else(|| anyhow!("pod {name} not scheduled yet"))?;
            let nodes: Api<Node> = Api::all(self.client.clone());
            return Ok(nodes.get(&node_name).await?);
        }
        Err(anyhow!("node not found"))
    }

    /// External IP of the node hosting the app, if the cluster exposes one.
    pub async fn node_external_ip(&self, prefix: &str) -> Option<String> {
        let node = self.get_pod_node(prefix).await.ok()?;
        node.status?
            .addresses?
            .into_iter()
            .find(|a| a.type_ == "ExternalIP")
            .map(|a| a.address)
    }

    /// Stand up a dedicated database: volume + claim + LoadBalancer Service
    /// + Recreate-strategy Deployment + password Secret.
    pub async fn provision_database(
        &self,
        opt: &ProvisionDatabaseOpts,
    ) -> anyhow::Result<DatabaseCredential> {
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        volumes
            .create(&PostParams::default(), &typed::<PersistentVolume>(database_pv_manifest(opt))?)
            .await?;
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), NAMESPACE);
        claims
            .create(
                &PostParams::default(),
                &typed::<PersistentVolumeClaim>(database_pvc_manifest(opt))?,
            )
            .await?;
        let services: Api<Service> = Api::namespaced(self.client.clone(), NAMESPACE);
        services
            .create(&PostParams::default(), &typed::<Service>(database_service_manifest(opt))?)
            .await?;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), NAMESPACE);
        secrets
            .create(&PostParams::default(), &typed::<Secret>(database_secret_manifest(opt))?)
            .await?;
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), NAMESPACE);
        deployments
            .create(&PostParams::default(), &typed::<Deployment>(database_deployment_manifest(opt))?)
            .await?;
        Ok(DatabaseCredential {
            username: opt.envs.get(&opt.username_key).cloned().unwrap_or_default(),
            password: opt.envs.get(&opt.password_key).cloned().unwrap_or_default(),
            database_name: opt.envs.get(&opt.database_name_key).cloned().unwrap_or_default(),
        })
    }
}

async fn build_client(k8s_config_dir: &str) -> anyhow::Result<Client> {
    let path = Path::new(k8s_config_dir).join("config");
    if path.exists() {
        let kubeconfig = Kubeconfig::read_from(&path)
            .with_context(|| format!("failed to read kubeconfig at {}", path.display()))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context("failed to load kubeconfig")?;
        return Ok(Client::try_from(config)?);
    }
    Client::try_default().await.context("failed to build cluster client")
}

fn typed<K: DeserializeOwned>(manifest: Value) -> anyhow::Result<K> {
    Ok(serde_json::from_value(manifest)?)
}

async fn delete_if_exists<K>(api: &Api<K>, name: &str, what: &str)
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => warn!(error = %e, what, name, "failed to delete during teardown"),
    }
}

fn is_conflict(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<kube::Error>(), Some(kube::Error::Api(ae)) if ae.code == 409)
}

/// Exponential backoff for optimistic-concurrency retries: 4 pauses starting
/// at 10 ms, growing fivefold.
struct ConflictBackoff {
    attempt: u32,
    delay: Duration,
}

impl ConflictBackoff {
    fn new() -> Self {
        Self { attempt: 0, delay: Duration::from_millis(10) }
    }

    async fn pause(&mut self) -> bool {
        if self.attempt >= CONFLICT_RETRIES {
            return false;
        }
        tokio::time::sleep(self.delay).await;
        self.delay *= 5;
        self.attempt += 1;
        true
    }
}

fn app_deployment_manifest(
    name: &str,
    image: &str,
    app: &str,
    envs: &BTreeMap<String, String>,
    port: i32,
) -> Value {
    let mut env_list: Vec<Value> = envs
        .iter()
        .map(|(k, v)| json!({"name": k, "value": v}))
        .collect();
    env_list.push(json!({"name": "PORT", "value": port.to_string()}));
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": NAMESPACE,
            "labels": {"app": app}
        },
        "spec": {
            "replicas": 1,
            "selector": {"matchLabels": {"app": app}},
            "template": {
                "metadata": {"name": name, "labels": {"app": app}},
                "spec": {
                    "containers": [{
                        "name": format!("{name}-container"),
                        "image": image,
                        "ports": [{"name": "http-port", "containerPort": port}],
                        "env": env_list,
                        "imagePullPolicy": "Always"
                    }],
                    "imagePullSecrets": [{"name": REGISTRY_SECRET}]
                }
            }
        }
    })
}

fn app_service_manifest(name: &str, service_port: i32, node_port: Option<i32>) -> Value {
    let mut port = json!({"name": "http", "protocol": "TCP", "port": service_port});
    if let Some(np) = node_port {
        port["nodePort"] = json!(np);
    }
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "namespace": NAMESPACE,
            "labels": {"app": name}
        },
        "spec": {
            "type": "NodePort",
            "selector": {"app": name},
            "ports": [port]
        }
    })
}

fn app_ingress_manifest(service_name: &str, port: i32) -> Value {
    // The rewrite annotation keeps every app reachable under its own path
    // prefix on the shared host.
    json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": format!("{service_name}-ingress"),
            "namespace": NAMESPACE,
            "annotations": {
                "kubernetes.io/ingress.class": "nginx",
                "nginx.ingress.kubernetes.io/rewrite-target": "/$1"
            }
        },
        "spec": {
            "defaultBackend": {
                "service": {"name": service_name, "port": {"number": port}}
            },
            "rules": [{
                "http": {
                    "paths": [{
                        "path": format!("/{service_name}/?(.*)"),
                        "pathType": "ImplementationSpecific",
                        "backend": {
                            "service": {"name": service_name, "port": {"number": port}}
                        }
                    }]
                }
            }]
        }
    })
}

fn registry_secret_manifest(registry: &RegistryConfig) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {"name": REGISTRY_SECRET, "namespace": NAMESPACE},
        "type": "kubernetes.io/dockerconfigjson",
        "stringData": {".dockerconfigjson": docker_config_json(registry)}
    })
}

/// JSON form of the registry auth credentials, as the kubelet expects them.
fn docker_config_json(registry: &RegistryConfig) -> String {
    let auth = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", registry.username, registry.password));
    let entry = json!({
        "username": registry.username,
        "password": registry.password,
        "auth": auth
    });
    let mut auths = serde_json::Map::new();
    auths.insert(registry.url.clone(), entry);
    json!({"auths": auths}).to_string()
}

fn database_pv_manifest(opt: &ProvisionDatabaseOpts) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "PersistentVolume",
        "metadata": {
            "name": format!("{}-pv", opt.name),
            "labels": {"type": format!("{}-local", opt.name)}
        },
        "spec": {
            "capacity": {"storage": format!("{}Gi", opt.space_gi)},
            "accessModes": ["ReadWriteOnce"],
            "storageClassName": "manual",
            "hostPath": {"path": "/mnt/data"}
        }
    })
}

fn database_pvc_manifest(opt: &ProvisionDatabaseOpts) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {"name": format!("{}-pvc", opt.name), "namespace": NAMESPACE},
        "spec": {
            "storageClassName": "manual",
            "accessModes": ["ReadWriteOnce"],
            "resources": {"requests": {"storage": format!("{}Gi", opt.space_gi)}}
        }
    })
}

fn database_service_manifest(opt: &ProvisionDatabaseOpts) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": opt.name,
            "namespace": NAMESPACE,
            "labels": {"database": opt.name}
        },
        "spec": {
            "type": "LoadBalancer",
            "selector": {"database": format!("{}-database-deployment", opt.name)},
            "ports": [{"name": "db-port", "protocol": "TCP", "port": opt.default_port}]
        }
    })
}

fn database_secret_manifest(opt: &ProvisionDatabaseOpts) -> Value {
    let secret_name = format!("{}-secret", opt.name);
    let password = opt.envs.get(&opt.password_key).cloned().unwrap_or_default();
    let mut string_data = serde_json::Map::new();
    string_data.insert(secret_name.clone(), Value::String(password));
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {"name": secret_name, "namespace": NAMESPACE},
        "type": "Opaque",
        "stringData": string_data
    })
}

fn database_deployment_manifest(opt: &ProvisionDatabaseOpts) -> Value {
    let name = format!("{}-database-deployment", opt.name);
    let volume_name = format!("{}-volume-mount", opt.name);
    let env_list: Vec<Value> = opt
        .envs
        .iter()
        .map(|(k, v)| json!({"name": k, "value": v}))
        .collect();
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": NAMESPACE,
            "labels": {"database": name}
        },
        "spec": {
            "selector": {"matchLabels": {"database": name}},
            "strategy": {"type": "Recreate"},
            "template": {
                "metadata": {"labels": {"database": name}},
                "spec": {
                    "containers": [{
                        "name": format!("{name}-container"),
                        "image": opt.base_image,
                        "ports": [{"name": "connect-port", "protocol": "TCP", "containerPort": opt.default_port}],
                        "env": env_list,
                        "volumeMounts": [{"name": volume_name, "mountPath": opt.data_mount_path}]
                    }],
                    "volumes": [{
                        "name": volume_name,
                        "persistentVolumeClaim": {"claimName": format!("{}-pvc", opt.name)}
                    }]
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ProvisionDatabaseOpts {
        let mut envs = BTreeMap::new();
        envs.insert("POSTGRES_USER".to_string(), "u1".to_string());
        envs.insert("POSTGRES_PASSWORD".to_string(), "p1".to_string());
        envs.insert("POSTGRES_DB".to_string(), "d1".to_string());
        ProvisionDatabaseOpts {
            name: "acme".into(),
            base_image: "postgres:10.4".into(),
            default_port: 5432,
            space_gi: 1,
            username_key: "POSTGRES_USER".into(),
            password_key: "POSTGRES_PASSWORD".into(),
            database_name_key: "POSTGRES_DB".into(),
            data_mount_path: "/mnt/acme/postgres".into(),
            envs,
        }
    }

    #[test]
    fn deployment_manifest_shape() {
        let v = app_deployment_manifest("hello-deployment", "nginx", "hello", &BTreeMap::new(), STABLE_PORT);
        assert_eq!(v["metadata"]["labels"]["app"], "hello");
        let container = &v["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "nginx");
        assert_eq!(container["imagePullPolicy"], "Always");
        let envs = container["env"].as_array().unwrap();
        assert!(envs.iter().any(|e| e["name"] == "PORT" && e["value"] == "6003"));
        let secrets = v["spec"]["template"]["spec"]["imagePullSecrets"].as_array().unwrap();
        assert_eq!(secrets[0]["name"], REGISTRY_SECRET);
        typed::<Deployment>(v).expect("manifest deserializes into a Deployment");
    }

    #[test]
    fn service_manifest_carries_node_port() {
        let with = app_service_manifest("hello", STABLE_PORT, Some(30123));
        assert_eq!(with["spec"]["ports"][0]["nodePort"], 30123);
        assert_eq!(with["spec"]["ports"][0]["port"], STABLE_PORT);
        assert_eq!(with["spec"]["type"], "NodePort");
        typed::<Service>(with).expect("manifest deserializes into a Service");

        let without = app_service_manifest("hello", 80, None);
        assert!(without["spec"]["ports"][0].get("nodePort").is_none());
        typed::<Service>(without).unwrap();
    }

    #[test]
    fn ingress_manifest_path_and_rewrite() {
        let v = app_ingress_manifest("hello", STABLE_PORT);
        assert_eq!(v["metadata"]["name"], "hello-ingress");
        assert_eq!(
            v["metadata"]["annotations"]["nginx.ingress.kubernetes.io/rewrite-target"],
            "/$1"
        );
        let path = &v["spec"]["rules"][0]["http"]["paths"][0];
        assert_eq!(path["path"], "/hello/?(.*)");
        assert_eq!(path["backend"]["service"]["port"]["number"], STABLE_PORT);
        typed::<Ingress>(v).expect("manifest deserializes into an Ingress");
    }

    #[test]
    fn registry_secret_is_dockerconfigjson() {
        let registry = RegistryConfig {
            url: "registry:5000/".into(),
            username: "jane".into(),
            password: "pw".into(),
        };
        let v = registry_secret_manifest(&registry);
        assert_eq!(v["type"], "kubernetes.io/dockerconfigjson");
        let blob: Value =
            serde_json::from_str(v["stringData"][".dockerconfigjson"].as_str().unwrap()).unwrap();
        let auth = blob["auths"]["registry:5000/"]["auth"].as_str().unwrap();
        let decoded = base64::engine::general_purpose::STANDARD.decode(auth).unwrap();
        assert_eq!(decoded, b"jane:pw");
        typed::<Secret>(v).unwrap();
    }

    #[test]
    fn database_manifests_deserialize() {
        let opt = opts();
        typed::<PersistentVolume>(database_pv_manifest(&opt)).unwrap();
        typed::<PersistentVolumeClaim>(database_pvc_manifest(&opt)).unwrap();
        typed::<Service>(database_service_manifest(&opt)).unwrap();
        typed::<Secret>(database_secret_manifest(&opt)).unwrap();
        let dep = database_deployment_manifest(&opt);
        assert_eq!(dep["spec"]["strategy"]["type"], "Recreate");
        assert_eq!(
            dep["spec"]["template"]["spec"]["volumes"][0]["persistentVolumeClaim"]["claimName"],
            "acme-pvc"
        );
        typed::<Deployment>(dep).unwrap();
    }

    #[test]
    fn database_pv_capacity_in_gi() {
        let v = database_pv_manifest(&opts());
        assert_eq!(v["spec"]["capacity"]["storage"], "1Gi");
        assert_eq!(v["spec"]["storageClassName"], "manual");
    }
}
