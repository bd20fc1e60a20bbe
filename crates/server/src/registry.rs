use crate::auth::{generate_token, hash_password, verify_password};
use crate::git::GitService;
use crate::k8s::{DeployController, ProvisionDatabaseOpts};
use crate::models::{App, AuthenticateOpts, CreateAccountOpts, User};
use crate::util;
use anyhow::{bail, Context};
use sqlx::{Pool, Postgres};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// User account persistence and authentication.
pub struct UserStore {
    db: Pool<Postgres>,
    jwt_secret: String,
}

impl UserStore {
    pub fn new(db: Pool<Postgres>, jwt_secret: String) -> Self {
        Self { db, jwt_secret }
    }

    pub async fn create_user(&self, opt: &CreateAccountOpts) -> anyhow::Result<User> {
        util::validate_email(&opt.email)?;
        if self.get_by_email(&opt.email).await?.is_some() {
            bail!("email already in use by another user");
        }
        let hash = hash_password(&opt.password)?;
        let mut user = sqlx::query_as::<_, User>(
            "INSERT INTO users (email, name, password_hash) VALUES ($1, $2, $3) \
             RETURNING id, email, name, password_hash, created_at",
        )
        .bind(&opt.email)
        .bind(&opt.name)
        .bind(&hash)
        .fetch_one(&self.db)
        .await
        .context("failed to create user")?;
        user.token = generate_token(&user, &self.jwt_secret);
        Ok(user)
    }

    pub async fn authenticate(&self, opt: &AuthenticateOpts) -> anyhow::Result<User> {
        util::validate_email(&opt.email)?;
        let Some(mut user) = self.get_by_email(&opt.email).await? else {
            bail!("invalid authentication credentials");
        };
        if !verify_password(&opt.password, &user.password_hash) {
            bail!("invalid authentication credentials");
        }
        user.token = generate_token(&user, &self.jwt_secret);
        Ok(user)
    }

    pub async fn get_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT id, email, name, password_hash, created_at FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.db)
        .await?)
    }
}

/// Persistent index of applications, coordinating repository provisioning
/// and the initial cluster bootstrap.
pub struct AppRegistry {
    db: Pool<Postgres>,
    git: Arc<GitService>,
    cluster: Arc<DeployController>,
    repo_base_url: String,
}

const APP_COLUMNS: &str =
    "id, user_id, name, repo_url, app_url, image_name, host, created_at, updated_at";

impl AppRegistry {
    pub fn new(
        db: Pool<Postgres>,
        git: Arc<GitService>,
        cluster: Arc<DeployController>,
        repo_base_url: String,
    ) -> Self {
        Self { db, git, cluster, repo_base_url }
    }

    /// Create an application: bare repository on disk, app + credential rows
    /// in one transaction, and the placeholder cluster deployment. A failure
    /// after the repository or cluster objects exist tears them down again,
    /// so a failed create leaves neither disk nor cluster state behind.
    pub async fn create_app(&self, user: &User, requested_name: &str) -> anyhow::Result<App> {
        let name = if requested_name.is_empty() {
            util::generate_app_name()
        } else {
            requested_name.to_string()
        };
        if self.app_exists(&name, user.id).await? {
            bail!("app with name {name} already exists for your account");
        }
        self.git.create_repository(&user.unique_name(), &name).await?;

        let mut tx = self.db.begin().await?;
        let repo_url = format!("{}/{}/{}.git", self.repo_base_url, user.unique_name(), name);
        let inserted = async {
            let app = sqlx::query_as::<_, App>(&format!(
                "INSERT INTO apps (user_id, name, repo_url) VALUES ($1, $2, $3) RETURNING {APP_COLUMNS}"
            ))
            .bind(user.id)
            .bind(&name)
            .bind(&repo_url)
            .fetch_one(&mut *tx)
            .await
            .context("failed to create app")?;
            sqlx::query("INSERT INTO credentials (app_id, secret) VALUES ($1, $2)")
                .bind(app.id)
                .bind(util::random_string(64))
                .execute(&mut *tx)
                .await
                .context("failed to create credential")?;
            Ok::<_, anyhow::Error>(app)
        }
        .await;
        let app = match inserted {
            Ok(app) => app,
            Err(e) => {
                tx.rollback().await.ok();
                self.git.remove_repository(&user.unique_name(), &name);
                return Err(e);
            }
        };
        if let Err(e) = self.cluster.bootstrap_app(&app).await {
            tx.rollback().await.ok();
            self.cluster.teardown_app(&app).await;
            self.git.remove_repository(&user.unique_name(), &name);
            return Err(e.context("failed to create default nginx deployment"));
        }
        if let Err(e) = tx.commit().await {
            self.cluster.teardown_app(&app).await;
            self.git.remove_repository(&user.unique_name(), &name);
            return Err(e.into());
        }

        let app_url = match self.cluster.node_external_ip(&app.deployment_name()).await {
            Some(ip) => ip,
            None => format!("http://localhost/{}", app.name),
        };
        if let Err(e) = sqlx::query("UPDATE apps SET app_url = $1, updated_at = now() WHERE id = $2")
            .bind(&app_url)
            .bind(app.id)
            .execute(&self.db)
            .await
        {
            warn!(error = %e, "failed to store app url");
        }
        self.get_app(app.id).await
    }

    pub async fn app_exists(&self, name: &str, user_id: Uuid) -> anyhow::Result<bool> {
        let found: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM apps WHERE name = $1 AND user_id = $2")
                .bind(name)
                .bind(user_id)
                .fetch_optional(&self.db)
                .await?;
        Ok(found.is_some())
    }

    pub async fn get_app(&self, id: Uuid) -> anyhow::Result<App> {
        Ok(sqlx::query_as::<_, App>(&format!("SELECT {APP_COLUMNS} FROM apps WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.db)
            .await?)
    }

    pub async fn get_app_by_repo_url(&self, repo_url: &str) -> anyhow::Result<Option<App>> {
        Ok(sqlx::query_as::<_, App>(&format!(
            "SELECT {APP_COLUMNS} FROM apps WHERE repo_url = $1"
        ))
        .bind(repo_url)
        .fetch_optional(&self.db)
        .await?)
    }

    pub async fn update_image(&self, app: &App) -> anyhow::Result<()> {
        sqlx::query("UPDATE apps SET image_name = $1, updated_at = now() WHERE id = $2")
            .bind(&app.image_name)
            .bind(app.id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Hook point for deployment auditing; currently only recorded in the
    /// process log.
    pub async fn log_deployment_event(&self, user: &str, app_id: Uuid) -> anyhow::Result<()> {
        info!(%user, %app_id, "deployment event");
        Ok(())
    }

    pub async fn logs(&self, app_name: &str) -> anyhow::Result<String> {
        self.cluster.logs(app_name).await
    }

    /// Provision a dedicated database instance. Only postgres is recognized.
    pub async fn provision_database(
        &self,
        name: &str,
        database_type: &str,
    ) -> anyhow::Result<crate::k8s::DatabaseCredential> {
        let name = if name.is_empty() { util::generate_app_name() } else { name.to_string() };
        let name = name.replace('-', "");
        if database_type != "postgres" {
            bail!("unsupported database type {database_type}");
        }
        let opts = postgres_db_opts(&name);
        self.cluster.provision_database(&opts).await
    }
}

fn postgres_db_opts(name: &str) -> ProvisionDatabaseOpts {
    let data_mount_path = format!("/mnt/{name}/postgres");
    let mut envs = BTreeMap::new();
    envs.insert("POSTGRES_PASSWORD".to_string(), util::random_string(60));
    envs.insert("POSTGRES_USER".to_string(), util::random_string(30));
    envs.insert("POSTGRES_DB".to_string(), name.to_string());
    envs.insert("PGDATA".to_string(), data_mount_path.clone());
    ProvisionDatabaseOpts {
        name: name.to_string(),
        base_image: "postgres:10.4".to_string(),
        default_port: 5432,
        space_gi: 1,
        username_key: "POSTGRES_USER".to_string(),
        password_key: "POSTGRES_PASSWORD".to_string(),
        database_name_key: "POSTGRES_DB".to_string(),
        data_mount_path,
        envs,
    }
}
