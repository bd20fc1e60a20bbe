use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    #[sqlx(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct App {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "app_name")]
    pub name: String,
    pub repo_url: String,
    pub app_url: String,
    pub image_name: String,
    pub host: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Credential {
    pub id: Uuid,
    pub app_id: Uuid,
    pub secret: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Git path prefix for this user: the local part of the email when the
    /// address has exactly one `@`, the full email otherwise.
    pub fn unique_name(&self) -> String {
        let parts: Vec<&str> = self.email.split('@').collect();
        if parts.len() == 2 { parts[0].to_string() } else { self.email.clone() }
    }
}

impl App {
    pub fn deployment_name(&self) -> String {
        format!("{}-deployment", self.name)
    }
}

/// Build request posted by the post-receive hook.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct HookInfo {
    pub repo_name: String,
    pub repo_path: String,
    pub old_rev: String,
    pub new_rev: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub ref_type: String,
    pub ref_name: String,
    pub key: String,
}

#[derive(Deserialize, Debug)]
pub struct CreateAccountOpts {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize, Debug)]
pub struct AuthenticateOpts {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize, Debug, Default)]
pub struct CreateAppOpts {
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize, Debug)]
pub struct ProvisionDatabaseRequest {
    #[serde(default)]
    pub name: String,
    pub database_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(email: &str) -> User {
        User {
            id: Uuid::new_v4(),
            email: email.into(),
            name: "jane".into(),
            password_hash: String::new(),
            created_at: Utc::now(),
            token: None,
        }
    }

    #[test]
    fn unique_name_is_local_part() {
        assert_eq!(user("jane@example.com").unique_name(), "jane");
    }

    #[test]
    fn unique_name_falls_back_to_full_email() {
        assert_eq!(user("a@b@c").unique_name(), "a@b@c");
        assert_eq!(user("no-at-sign").unique_name(), "no-at-sign");
    }

    #[test]
    fn deployment_name_suffix() {
        let app = App {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "hello".into(),
            repo_url: String::new(),
            app_url: String::new(),
            image_name: String::new(),
            host: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(app.deployment_name(), "hello-deployment");
    }

    #[test]
    fn user_json_hides_password_hash() {
        let v = serde_json::to_value(user("jane@example.com")).unwrap();
        assert!(v.get("password_hash").is_none());
    }

    #[test]
    fn hook_info_ref_field_name() {
        let info = HookInfo { git_ref: "refs/heads/master".into(), ..Default::default() };
        let v = serde_json::to_value(info).unwrap();
        assert_eq!(v["ref"], "refs/heads/master");
    }
}
