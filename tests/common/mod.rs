// ABOUTME: In-memory collaborators shared by the integration tests
// ABOUTME: A fake project API, schema inspector and row transfer with scriptable failures

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use project_migrator::audit::{AuditEntry, AuditSink};
use project_migrator::config::OrchestratorSettings;
use project_migrator::error::{ApiError, ApiResult, MigratorError};
use project_migrator::models::MigrationOptions;
use project_migrator::orchestrator::{Collaborators, MigrationOrchestrator};
use project_migrator::remote::{
    BatchRequest, Bucket, ConnectionInfo, CreateProjectRequest, DataTransfer, EdgeFunction,
    EdgeFunctionSummary, ProjectConfig, ProjectHandle, ProjectInfo, ProjectManagementClient,
    ProjectStatus, SchemaInspector, StorageObject,
};
use project_migrator::schema::{DatabaseSchema, Publication, Table};

pub const SOURCE_REF: &str = "srcproject";
pub const ORG: &str = "acme-org";

pub fn options() -> MigrationOptions {
    MigrationOptions::new(SOURCE_REF, "Copy of source", ORG)
}

pub fn host_for(project_ref: &str) -> String {
    format!("db.{}.test", project_ref)
}

fn connection(project_ref: &str) -> ConnectionInfo {
    ConnectionInfo {
        host: host_for(project_ref),
        port: 5432,
        database: "postgres".into(),
        user: "postgres".into(),
        password: None,
    }
}

#[derive(Default)]
struct ProjectData {
    buckets: Vec<Bucket>,
    objects: HashMap<String, Vec<StorageObject>>,
    functions: HashMap<String, EdgeFunction>,
    config: ProjectConfig,
}

/// Project management API backed by maps.
#[derive(Default)]
pub struct FakeProjects {
    projects: Mutex<HashMap<String, ProjectData>>,
    created: AtomicUsize,
    /// Status polls a new project answers with `coming_up` before it is healthy.
    polls_until_healthy: AtomicUsize,
    polls: AtomicUsize,
    failures: Mutex<HashMap<&'static str, VecDeque<ApiError>>>,
    queries: Mutex<Vec<(String, String)>>,
    /// Row store that `TRUNCATE TABLE` queries clear.
    rows: Mutex<Option<Arc<FakeTransfer>>>,
}

impl FakeProjects {
    pub fn attach_rows(&self, transfer: Arc<FakeTransfer>) {
        *self.rows.lock() = Some(transfer);
    }

    pub fn new() -> Arc<Self> {
        let fake = Self::default();
        {
            let mut projects = fake.projects.lock();
            let mut source = ProjectData::default();
            source.buckets.push(Bucket {
                id: "avatars".into(),
                name: "avatars".into(),
                public: true,
                file_size_limit: None,
                allowed_mime_types: None,
            });
            source.objects.insert(
                "avatars".into(),
                vec![
                    StorageObject {
                        name: "alice.png".into(),
                        size: Some(1024),
                    },
                    StorageObject {
                        name: "bob.png".into(),
                        size: Some(2048),
                    },
                ],
            );
            source.functions.insert(
                "hello".into(),
                EdgeFunction {
                    slug: "hello".into(),
                    name: "hello".into(),
                    verify_jwt: true,
                    body: b"Deno.serve(() => new Response('hi'))".to_vec(),
                },
            );
            source.config = ProjectConfig {
                auth: Some(serde_json::json!({ "site_url": "https://example.com" })),
                postgrest: Some(serde_json::json!({ "max_rows": 1000 })),
            };
            projects.insert(SOURCE_REF.to_string(), source);
        }
        Arc::new(fake)
    }

    /// Fail the next `times` calls of `operation` with `error`.
    pub fn fail(&self, operation: &'static str, error: ApiError, times: usize) {
        let mut failures = self.failures.lock();
        let queue = failures.entry(operation).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    pub fn never_healthy(&self) {
        self.polls_until_healthy.store(usize::MAX, Ordering::SeqCst);
    }

    pub fn created_projects(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<(String, String)> {
        self.queries.lock().clone()
    }

    pub fn objects_in(&self, project_ref: &str, bucket: &str) -> usize {
        self.projects
            .lock()
            .get(project_ref)
            .and_then(|p| p.objects.get(bucket))
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn function_in(&self, project_ref: &str, slug: &str) -> Option<EdgeFunction> {
        self.projects
            .lock()
            .get(project_ref)
            .and_then(|p| p.functions.get(slug).cloned())
    }

    pub fn config_of(&self, project_ref: &str) -> Option<ProjectConfig> {
        self.projects.lock().get(project_ref).map(|p| p.config.clone())
    }

    fn check(&self, operation: &'static str) -> ApiResult<()> {
        match self
            .failures
            .lock()
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn with_project<T>(
        &self,
        project_ref: &str,
        f: impl FnOnce(&mut ProjectData) -> T,
    ) -> ApiResult<T> {
        self.projects
            .lock()
            .get_mut(project_ref)
            .map(f)
            .ok_or_else(|| ApiError::new(Some(404), format!("project {} not found", project_ref)))
    }
}

#[async_trait]
impl ProjectManagementClient for FakeProjects {
    async fn create_project(&self, request: &CreateProjectRequest) -> ApiResult<ProjectHandle> {
        self.check("create_project")?;
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let project_ref = format!("target{}", n);
        self.projects
            .lock()
            .insert(project_ref.clone(), ProjectData::default());
        Ok(ProjectHandle {
            project_ref,
            name: request.name.clone(),
        })
    }

    async fn get_project(&self, project_ref: &str) -> ApiResult<ProjectInfo> {
        self.check("get_project")?;
        self.with_project(project_ref, |_| ())?;
        let polls = self.polls.fetch_add(1, Ordering::SeqCst);
        let status = if polls < self.polls_until_healthy.load(Ordering::SeqCst) {
            ProjectStatus::ComingUp
        } else {
            ProjectStatus::ActiveHealthy
        };
        Ok(ProjectInfo {
            project_ref: project_ref.to_string(),
            status,
        })
    }

    async fn get_connection_info(&self, project_ref: &str) -> ApiResult<ConnectionInfo> {
        self.check("get_connection_info")?;
        self.with_project(project_ref, |_| connection(project_ref))
    }

    async fn list_buckets(&self, project_ref: &str) -> ApiResult<Vec<Bucket>> {
        self.check("list_buckets")?;
        self.with_project(project_ref, |p| p.buckets.clone())
    }

    async fn create_bucket(&self, project_ref: &str, bucket: &Bucket) -> ApiResult<()> {
        self.check("create_bucket")?;
        self.with_project(project_ref, |p| p.buckets.push(bucket.clone()))
    }

    async fn list_storage_objects(
        &self,
        project_ref: &str,
        bucket: &str,
    ) -> ApiResult<Vec<StorageObject>> {
        self.check("list_storage_objects")?;
        self.with_project(project_ref, |p| {
            p.objects.get(bucket).cloned().unwrap_or_default()
        })
    }

    async fn copy_storage_object(
        &self,
        _source_ref: &str,
        target_ref: &str,
        bucket: &str,
        object: &StorageObject,
    ) -> ApiResult<()> {
        self.check("copy_storage_object")?;
        self.with_project(target_ref, |p| {
            p.objects
                .entry(bucket.to_string())
                .or_default()
                .push(object.clone())
        })
    }

    async fn list_functions(&self, project_ref: &str) -> ApiResult<Vec<EdgeFunctionSummary>> {
        self.check("list_functions")?;
        self.with_project(project_ref, |p| {
            p.functions
                .values()
                .map(|f| EdgeFunctionSummary {
                    slug: f.slug.clone(),
                    name: f.name.clone(),
                    verify_jwt: f.verify_jwt,
                })
                .collect()
        })
    }

    async fn get_function(&self, project_ref: &str, slug: &str) -> ApiResult<EdgeFunction> {
        self.check("get_function")?;
        self.with_project(project_ref, |p| p.functions.get(slug).cloned())?
            .ok_or_else(|| ApiError::new(Some(404), format!("function {} not found", slug)))
    }

    async fn deploy_function(&self, project_ref: &str, function: &EdgeFunction) -> ApiResult<()> {
        self.check("deploy_function")?;
        self.with_project(project_ref, |p| {
            p.functions.insert(function.slug.clone(), function.clone());
        })
    }

    async fn get_config(&self, project_ref: &str) -> ApiResult<ProjectConfig> {
        self.check("get_config")?;
        self.with_project(project_ref, |p| p.config.clone())
    }

    async fn update_config(&self, project_ref: &str, config: &ProjectConfig) -> ApiResult<()> {
        self.check("update_config")?;
        self.with_project(project_ref, |p| p.config = config.clone())
    }

    async fn run_query(&self, project_ref: &str, sql: &str) -> ApiResult<serde_json::Value> {
        self.check("run_query")?;
        self.with_project(project_ref, |_| ())?;
        self.queries
            .lock()
            .push((project_ref.to_string(), sql.to_string()));
        let truncated = sql
            .strip_prefix("TRUNCATE TABLE ")
            .map(|rest| rest.trim_end_matches(" CASCADE").replace('"', ""));
        if let (Some(table), Some(rows)) = (truncated, self.rows.lock().clone()) {
            rows.truncate(&host_for(project_ref), &table);
        }
        Ok(serde_json::json!([]))
    }

    async fn ping(&self) -> ApiResult<()> {
        self.check("ping")
    }
}

fn table(name: &str) -> Table {
    Table {
        schema: "public".into(),
        name: name.into(),
        columns: Vec::new(),
        constraints: Vec::new(),
        rls_enabled: false,
    }
}

/// Returns the source schema for the source host and the same tables, without
/// publications, for any other host.
pub struct FakeInspector {
    schema: DatabaseSchema,
}

impl FakeInspector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            schema: DatabaseSchema {
                tables: vec![table("users"), table("orders")],
                publications: vec![Publication {
                    name: "supabase_realtime".into(),
                    all_tables: false,
                    tables: vec!["public.orders".into()],
                    operations: vec!["insert".into(), "update".into()],
                }],
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl SchemaInspector for FakeInspector {
    async fn get_complete_schema(&self, connection: &ConnectionInfo) -> Result<DatabaseSchema> {
        if connection.host == host_for(SOURCE_REF) {
            Ok(self.schema.clone())
        } else {
            Ok(DatabaseSchema {
                tables: self.schema.tables.clone(),
                ..Default::default()
            })
        }
    }
}

/// Row store keyed by `host/table`.
pub struct FakeTransfer {
    rows: Mutex<HashMap<String, u64>>,
    copy_failures: Mutex<VecDeque<MigratorError>>,
    fail_forever: Mutex<Option<String>>,
    /// Failures keyed by the 1-based copy call they replace.
    scheduled: Mutex<HashMap<usize, MigratorError>>,
    calls: AtomicUsize,
    batches: AtomicUsize,
}

impl FakeTransfer {
    pub fn new() -> Arc<Self> {
        let mut rows = HashMap::new();
        rows.insert(format!("{}/public.users", host_for(SOURCE_REF)), 250);
        rows.insert(format!("{}/public.orders", host_for(SOURCE_REF)), 40);
        Arc::new(Self {
            rows: Mutex::new(rows),
            copy_failures: Mutex::new(VecDeque::new()),
            fail_forever: Mutex::new(None),
            scheduled: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            batches: AtomicUsize::new(0),
        })
    }

    /// Fail the next copies with connection timeouts.
    pub fn time_out_next(&self, times: usize) {
        let mut failures = self.copy_failures.lock();
        for _ in 0..times {
            failures.push_back(MigratorError::Connection("connection timed out".into()));
        }
    }

    pub fn fail_next_with(&self, error: MigratorError) {
        self.copy_failures.lock().push_back(error);
    }

    /// Every copy fails with a connection timeout.
    pub fn always_time_out(&self) {
        *self.fail_forever.lock() = Some("connection timed out".into());
    }

    /// Fail the `call`-th copy (counting from 1) with `error`.
    pub fn fail_call(&self, call: usize, error: MigratorError) {
        self.scheduled.lock().insert(call, error);
    }

    pub fn truncate(&self, host: &str, table: &str) {
        self.rows.lock().remove(&format!("{}/{}", host, table));
    }

    pub fn rows_in(&self, project_ref: &str, table: &str) -> u64 {
        self.rows
            .lock()
            .get(&format!("{}/{}", host_for(project_ref), table))
            .copied()
            .unwrap_or(0)
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataTransfer for FakeTransfer {
    async fn count_rows(
        &self,
        connection: &ConnectionInfo,
        table: &str,
        _filter: Option<&str>,
    ) -> Result<u64> {
        Ok(self
            .rows
            .lock()
            .get(&format!("{}/{}", connection.host, table))
            .copied()
            .unwrap_or(0))
    }

    async fn copy_batch(
        &self,
        source: &ConnectionInfo,
        target: &ConnectionInfo,
        batch: &BatchRequest<'_>,
    ) -> Result<u64> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.scheduled.lock().remove(&call) {
            return Err(error.into());
        }
        if let Some(message) = self.fail_forever.lock().clone() {
            return Err(MigratorError::Connection(message).into());
        }
        if let Some(error) = self.copy_failures.lock().pop_front() {
            return Err(error.into());
        }
        self.batches.fetch_add(1, Ordering::SeqCst);

        let mut rows = self.rows.lock();
        let available = rows
            .get(&format!("{}/{}", source.host, batch.table))
            .copied()
            .unwrap_or(0);
        let copied = available.saturating_sub(batch.offset).min(batch.limit);
        *rows
            .entry(format!("{}/{}", target.host, batch.table))
            .or_insert(0) += copied;
        Ok(copied)
    }
}

/// Keeps every audit entry for assertions.
#[derive(Default)]
pub struct RecordingAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingAuditSink {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, entry: &AuditEntry) -> Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

pub struct Harness {
    pub orchestrator: MigrationOrchestrator,
    pub projects: Arc<FakeProjects>,
    pub transfer: Arc<FakeTransfer>,
    pub audit: Arc<RecordingAuditSink>,
}

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        event_channel_capacity: 4096,
        ..OrchestratorSettings::default()
    }
}

pub fn harness() -> Harness {
    harness_with(settings())
}

pub fn harness_with(settings: OrchestratorSettings) -> Harness {
    let projects = FakeProjects::new();
    let transfer = FakeTransfer::new();
    let audit = Arc::new(RecordingAuditSink::default());
    projects.attach_rows(transfer.clone());
    let orchestrator = MigrationOrchestrator::builder(
        settings,
        Collaborators {
            projects: projects.clone(),
            inspector: FakeInspector::new(),
            transfer: transfer.clone(),
        },
    )
    .audit(audit.clone())
    .build();

    Harness {
        orchestrator,
        projects,
        transfer,
        audit,
    }
}

/// Long enough for any retry schedule in these tests under paused time.
pub const GENEROUS: Duration = Duration::from_secs(3600);
