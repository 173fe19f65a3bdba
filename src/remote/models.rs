// ABOUTME: Data structures exchanged with the project management API
// ABOUTME: These are serialized to JSON for API communication

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProjectRequest {
    pub organization_id: String,
    pub name: String,
    pub region: String,
    #[serde(rename = "plan")]
    pub tier: String,
    pub db_pass: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectHandle {
    #[serde(alias = "id")]
    pub project_ref: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    ComingUp,
    ActiveHealthy,
    ActiveUnhealthy,
    Inactive,
    Paused,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectInfo {
    #[serde(alias = "id")]
    pub project_ref: String,
    pub status: ProjectStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl ConnectionInfo {
    /// Key/value connection string understood by tokio-postgres.
    pub fn to_connection_string(&self) -> String {
        let mut parts = vec![
            format!("host={}", self.host),
            format!("port={}", self.port),
            format!("dbname={}", self.database),
            format!("user={}", self.user),
        ];
        if let Some(password) = &self.password {
            parts.push(format!("password='{}'", password.replace('\'', "\\'")));
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub file_size_limit: Option<u64>,
    #[serde(default)]
    pub allowed_mime_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageObject {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EdgeFunctionSummary {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub verify_jwt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeFunction {
    pub slug: String,
    pub name: String,
    pub verify_jwt: bool,
    pub body: Vec<u8>,
}

/// Project-level settings copied during configuration migration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub auth: Option<serde_json::Value>,
    #[serde(default)]
    pub postgrest: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiKey {
    pub name: String,
    pub api_key: String,
}
