// ABOUTME: Project management client seam and its HTTP implementation
// ABOUTME: Every call returns a tagged ApiResult; non-success responses become ApiError

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use super::models::{
    ApiKey, Bucket, ConnectionInfo, CreateProjectRequest, EdgeFunction, EdgeFunctionSummary,
    ProjectConfig, ProjectHandle, ProjectInfo, StorageObject,
};
use crate::error::{ApiError, ApiResult};

const OBJECT_PAGE_SIZE: usize = 1000;

/// Operations the orchestrator needs from the hosted project API.
#[async_trait]
pub trait ProjectManagementClient: Send + Sync {
    async fn create_project(&self, request: &CreateProjectRequest) -> ApiResult<ProjectHandle>;

    async fn get_project(&self, project_ref: &str) -> ApiResult<ProjectInfo>;

    async fn get_connection_info(&self, project_ref: &str) -> ApiResult<ConnectionInfo>;

    async fn list_buckets(&self, project_ref: &str) -> ApiResult<Vec<Bucket>>;

    async fn create_bucket(&self, project_ref: &str, bucket: &Bucket) -> ApiResult<()>;

    async fn list_storage_objects(
        &self,
        project_ref: &str,
        bucket: &str,
    ) -> ApiResult<Vec<StorageObject>>;

    async fn copy_storage_object(
        &self,
        source_ref: &str,
        target_ref: &str,
        bucket: &str,
        object: &StorageObject,
    ) -> ApiResult<()>;

    async fn list_functions(&self, project_ref: &str) -> ApiResult<Vec<EdgeFunctionSummary>>;

    async fn get_function(&self, project_ref: &str, slug: &str) -> ApiResult<EdgeFunction>;

    async fn deploy_function(&self, project_ref: &str, function: &EdgeFunction) -> ApiResult<()>;

    async fn get_config(&self, project_ref: &str) -> ApiResult<ProjectConfig>;

    async fn update_config(&self, project_ref: &str, config: &ProjectConfig) -> ApiResult<()>;

    /// Execute SQL against the project's database through the API.
    async fn run_query(&self, project_ref: &str, sql: &str) -> ApiResult<serde_json::Value>;

    /// Cheap authenticated request used by health probes.
    async fn ping(&self) -> ApiResult<()>;
}

pub struct HttpProjectClient {
    client: Client,
    api_base_url: String,
    access_token: String,
    project_url_template: String,
    service_keys: Mutex<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct ProjectDatabase {
    database: Option<DatabaseHost>,
}

#[derive(Deserialize)]
struct DatabaseHost {
    host: String,
}

impl HttpProjectClient {
    pub fn new(
        api_base_url: String,
        access_token: String,
        project_url_template: String,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            access_token,
            project_url_template,
            service_keys: Mutex::new(HashMap::new()),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/v1{}", self.api_base_url, path)
    }

    fn project_url(&self, project_ref: &str, path: &str) -> String {
        format!(
            "{}{}",
            self.project_url_template.replace("{ref}", project_ref),
            path
        )
    }

    async fn send(&self, request: RequestBuilder) -> ApiResult<Response> {
        let response = request.send().await.map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::new(Some(status.as_u16()), body));
        }

        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> ApiResult<T> {
        let response = self.send(request).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::transport(format!("Failed to parse API response: {}", e)))
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(self.api_url(path))
            .bearer_auth(&self.access_token)
    }

    async fn service_key(&self, project_ref: &str) -> ApiResult<String> {
        if let Some(key) = self.service_keys.lock().get(project_ref) {
            return Ok(key.clone());
        }

        let keys: Vec<ApiKey> = self
            .send_json(self.get(&format!("/projects/{}/api-keys", project_ref)))
            .await?;
        let key = keys
            .into_iter()
            .find(|k| k.name == "service_role")
            .map(|k| k.api_key)
            .ok_or_else(|| {
                ApiError::new(
                    Some(404),
                    format!("No service_role key found for project {}", project_ref),
                )
            })?;

        self.service_keys
            .lock()
            .insert(project_ref.to_string(), key.clone());
        Ok(key)
    }
}

fn transport_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::transport(format!("connection timed out: {}", err))
    } else if err.is_connect() {
        ApiError::transport(format!("connection refused: {}", err))
    } else {
        ApiError::transport(format!("network error: {}", err))
    }
}

#[async_trait]
impl ProjectManagementClient for HttpProjectClient {
    async fn create_project(&self, request: &CreateProjectRequest) -> ApiResult<ProjectHandle> {
        self.send_json(
            self.client
                .post(self.api_url("/projects"))
                .bearer_auth(&self.access_token)
                .json(request),
        )
        .await
    }

    async fn get_project(&self, project_ref: &str) -> ApiResult<ProjectInfo> {
        self.send_json(self.get(&format!("/projects/{}", project_ref)))
            .await
    }

    async fn get_connection_info(&self, project_ref: &str) -> ApiResult<ConnectionInfo> {
        let project: ProjectDatabase = self
            .send_json(self.get(&format!("/projects/{}", project_ref)))
            .await?;
        let host = project.database.map(|db| db.host).ok_or_else(|| {
            ApiError::new(
                Some(404),
                format!("Project {} has no database host yet", project_ref),
            )
        })?;

        Ok(ConnectionInfo {
            host,
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: None,
        })
    }

    async fn list_buckets(&self, project_ref: &str) -> ApiResult<Vec<Bucket>> {
        self.send_json(self.get(&format!("/projects/{}/storage/buckets", project_ref)))
            .await
    }

    async fn create_bucket(&self, project_ref: &str, bucket: &Bucket) -> ApiResult<()> {
        let key = self.service_key(project_ref).await?;
        self.send(
            self.client
                .post(self.project_url(project_ref, "/storage/v1/bucket"))
                .bearer_auth(key)
                .json(bucket),
        )
        .await?;
        Ok(())
    }

    async fn list_storage_objects(
        &self,
        project_ref: &str,
        bucket: &str,
    ) -> ApiResult<Vec<StorageObject>> {
        let key = self.service_key(project_ref).await?;
        let url = self.project_url(project_ref, &format!("/storage/v1/object/list/{}", bucket));

        let mut objects = Vec::new();
        loop {
            let page: Vec<StorageObject> = self
                .send_json(self.client.post(&url).bearer_auth(&key).json(&serde_json::json!({
                    "prefix": "",
                    "limit": OBJECT_PAGE_SIZE,
                    "offset": objects.len(),
                })))
                .await?;
            let done = page.len() < OBJECT_PAGE_SIZE;
            objects.extend(page);
            if done {
                return Ok(objects);
            }
        }
    }

    async fn copy_storage_object(
        &self,
        source_ref: &str,
        target_ref: &str,
        bucket: &str,
        object: &StorageObject,
    ) -> ApiResult<()> {
        let path = format!("/storage/v1/object/{}/{}", bucket, object.name);

        let source_key = self.service_key(source_ref).await?;
        let bytes = self
            .send(
                self.client
                    .get(self.project_url(source_ref, &path))
                    .bearer_auth(source_key),
            )
            .await?
            .bytes()
            .await
            .map_err(transport_error)?;

        let target_key = self.service_key(target_ref).await?;
        self.send(
            self.client
                .post(self.project_url(target_ref, &path))
                .bearer_auth(target_key)
                .header("x-upsert", "true")
                .body(bytes),
        )
        .await?;
        Ok(())
    }

    async fn list_functions(&self, project_ref: &str) -> ApiResult<Vec<EdgeFunctionSummary>> {
        self.send_json(self.get(&format!("/projects/{}/functions", project_ref)))
            .await
    }

    async fn get_function(&self, project_ref: &str, slug: &str) -> ApiResult<EdgeFunction> {
        let summary: EdgeFunctionSummary = self
            .send_json(self.get(&format!("/projects/{}/functions/{}", project_ref, slug)))
            .await?;
        let body = self
            .send(self.get(&format!("/projects/{}/functions/{}/body", project_ref, slug)))
            .await?
            .bytes()
            .await
            .map_err(transport_error)?;

        Ok(EdgeFunction {
            slug: summary.slug,
            name: summary.name,
            verify_jwt: summary.verify_jwt,
            body: body.to_vec(),
        })
    }

    async fn deploy_function(&self, project_ref: &str, function: &EdgeFunction) -> ApiResult<()> {
        let query = [
            ("slug", function.slug.clone()),
            ("name", function.name.clone()),
            ("verify_jwt", function.verify_jwt.to_string()),
        ];
        let created = self
            .send(
                self.client
                    .post(self.api_url(&format!("/projects/{}/functions", project_ref)))
                    .bearer_auth(&self.access_token)
                    .query(&query)
                    .header("content-type", "application/vnd.denoland.eszip")
                    .body(function.body.clone()),
            )
            .await;

        match created {
            Ok(_) => Ok(()),
            // Already deployed on the target: update in place.
            Err(ApiError {
                status: Some(409), ..
            }) => {
                self.send(
                    self.client
                        .patch(self.api_url(&format!(
                            "/projects/{}/functions/{}",
                            project_ref, function.slug
                        )))
                        .bearer_auth(&self.access_token)
                        .query(&query)
                        .header("content-type", "application/vnd.denoland.eszip")
                        .body(function.body.clone()),
                )
                .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_config(&self, project_ref: &str) -> ApiResult<ProjectConfig> {
        let auth: serde_json::Value = self
            .send_json(self.get(&format!("/projects/{}/config/auth", project_ref)))
            .await?;
        let postgrest: serde_json::Value = self
            .send_json(self.get(&format!("/projects/{}/postgrest", project_ref)))
            .await?;

        Ok(ProjectConfig {
            auth: Some(auth),
            postgrest: Some(postgrest),
        })
    }

    async fn update_config(&self, project_ref: &str, config: &ProjectConfig) -> ApiResult<()> {
        if let Some(auth) = &config.auth {
            self.send(
                self.client
                    .patch(self.api_url(&format!("/projects/{}/config/auth", project_ref)))
                    .bearer_auth(&self.access_token)
                    .json(auth),
            )
            .await?;
        }
        if let Some(postgrest) = &config.postgrest {
            self.send(
                self.client
                    .patch(self.api_url(&format!("/projects/{}/postgrest", project_ref)))
                    .bearer_auth(&self.access_token)
                    .json(postgrest),
            )
            .await?;
        }
        Ok(())
    }

    async fn run_query(&self, project_ref: &str, sql: &str) -> ApiResult<serde_json::Value> {
        self.send_json(
            self.client
                .post(self.api_url(&format!("/projects/{}/database/query", project_ref)))
                .bearer_auth(&self.access_token)
                .json(&serde_json::json!({ "query": sql })),
        )
        .await
    }

    async fn ping(&self) -> ApiResult<()> {
        self.send(self.get("/projects")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpProjectClient {
        HttpProjectClient::new(
            "https://api.example.com/".to_string(),
            "token".to_string(),
            "https://{ref}.example.co".to_string(),
            Duration::from_secs(30),
        )
        .unwrap()
    }

    #[test]
    fn test_client_creation() {
        let client = client();
        assert_eq!(client.api_base_url, "https://api.example.com");
    }

    #[test]
    fn test_url_building() {
        let client = client();
        assert_eq!(
            client.api_url("/projects/abc"),
            "https://api.example.com/v1/projects/abc"
        );
        assert_eq!(
            client.project_url("abc", "/storage/v1/bucket"),
            "https://abc.example.co/storage/v1/bucket"
        );
    }
}
