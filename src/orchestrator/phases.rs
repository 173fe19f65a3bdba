// ABOUTME: Bodies of the ten clone phases and the resumable state they share
// ABOUTME: Each phase is idempotent against the state left by an earlier attempt of itself

use anyhow::{Context, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::Inner;
use crate::error::MigratorError;
use crate::models::{
    CloneType, MigrationCounters, MigrationOptions, Phase, PhaseStatus, Progress,
};
use crate::remote::{
    BatchRequest, ConnectionInfo, CreateProjectRequest, DataTransfer, ProjectConfig,
    ProjectManagementClient, ProjectStatus,
};
use crate::replication::plan_publications;
use crate::schema::ddl::{render_schema, render_security};
use crate::schema::{quote_ident, quote_table_path, DatabaseSchema};

const TARGET_PASSWORD_LENGTH: usize = 32;

/// Supabase-managed tables copied when user data is requested.
const USER_DATA_TABLES: [&str; 2] = ["auth.users", "auth.identities"];

/// Everything a later phase or a retried attempt needs from earlier work.
#[derive(Debug, Default)]
pub(super) struct PhaseState {
    target_ref: Option<String>,
    target_password: Option<String>,
    source_conn: Option<Arc<ConnectionInfo>>,
    target_conn: Option<Arc<ConnectionInfo>>,
    source_schema: Option<Arc<DatabaseSchema>>,
    schema_statements_applied: usize,
    security_statements_applied: usize,
    table_offsets: HashMap<String, u64>,
    completed_tables: HashSet<String>,
    created_buckets: HashSet<String>,
    copied_objects: HashSet<String>,
    deployed_functions: HashSet<String>,
}

impl PhaseState {
    /// Resumable position, stored with each checkpoint. Credentials stay out.
    pub(super) fn checkpoint_blob(&self) -> serde_json::Value {
        serde_json::json!({
            "target_ref": self.target_ref,
            "schema_statements_applied": self.schema_statements_applied,
            "security_statements_applied": self.security_statements_applied,
            "table_offsets": self.table_offsets,
            "completed_tables": self.completed_tables,
            "created_buckets": self.created_buckets,
            "copied_objects": self.copied_objects.len(),
            "deployed_functions": self.deployed_functions,
        })
    }

    /// Forget the work `phase` did so it starts over after a rollback.
    /// Preparation keeps its project; a rollback reuses it.
    pub(super) fn reset(&mut self, phase: Phase) {
        match phase {
            Phase::SchemaMigration => self.schema_statements_applied = 0,
            Phase::DataMigration => {
                self.table_offsets.clear();
                self.completed_tables.clear();
            }
            Phase::StorageMigration => {
                self.created_buckets.clear();
                self.copied_objects.clear();
            }
            Phase::EdgeFunctionsMigration => self.deployed_functions.clear(),
            Phase::SecurityMigration => self.security_statements_applied = 0,
            _ => {}
        }
    }
}

/// Zero the counters owned by `phase` after its work was rolled back.
pub(super) fn reset_counters(phase: Phase, counters: &mut MigrationCounters) {
    match phase {
        Phase::DataMigration => {
            counters.tables_migrated = 0;
            counters.rows_migrated = 0;
        }
        Phase::StorageMigration => counters.storage_objects_migrated = 0,
        Phase::EdgeFunctionsMigration => counters.functions_migrated = 0,
        _ => {}
    }
}

/// SQL that undoes everything `phase` may write to the target, derived from
/// the phase's full scope rather than the progress made so far.
pub(super) fn rollback_instructions(
    phase: Phase,
    state: &PhaseState,
    options: &MigrationOptions,
) -> Vec<String> {
    match phase {
        Phase::SchemaMigration => state
            .source_schema
            .as_ref()
            .map(|schema| {
                schema
                    .tables
                    .iter()
                    .map(|t| format!("DROP TABLE IF EXISTS {} CASCADE", t.quoted_name()))
                    .collect()
            })
            .unwrap_or_default(),
        Phase::DataMigration => {
            let mut tables: Vec<String> = state
                .source_schema
                .as_ref()
                .map(|schema| data_tables(schema, options))
                .unwrap_or_default();
            tables.extend(state.table_offsets.keys().cloned());
            tables.extend(state.completed_tables.iter().cloned());
            tables.sort();
            tables.dedup();
            tables
                .into_iter()
                .map(|t| format!("TRUNCATE TABLE {} CASCADE", quote_table_path(&t)))
                .collect()
        }
        Phase::SecurityMigration => state
            .source_schema
            .as_ref()
            .map(|schema| {
                schema
                    .policies
                    .iter()
                    .map(|p| {
                        format!(
                            "DROP POLICY IF EXISTS {} ON {}",
                            quote_ident(&p.name),
                            quote_table_path(&format!("{}.{}", p.schema, p.table))
                        )
                    })
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[derive(Clone)]
pub(super) struct PhaseContext {
    pub(super) inner: Arc<Inner>,
    pub(super) job_id: String,
    pub(super) phase: Phase,
    pub(super) options: Arc<MigrationOptions>,
    pub(super) state: Arc<Mutex<PhaseState>>,
}

impl PhaseContext {
    fn projects(&self) -> &dyn ProjectManagementClient {
        self.inner.collaborators.projects.as_ref()
    }

    fn transfer(&self) -> Arc<dyn DataTransfer> {
        self.inner.collaborators.transfer.clone()
    }

    /// Publish this phase's own percentage and the matching overall value.
    fn report(&self, percentage: f64, details: impl Into<String>) {
        let phase = self.phase;
        let details = details.into();
        self.inner.update_progress(&self.job_id, |progress| {
            with_phase_percentage(progress, phase, percentage, details)
        });
    }

    /// Update counters and derive the phase percentage from them.
    fn count(
        &self,
        update: impl FnOnce(&mut MigrationCounters) -> f64,
        details: impl Into<String>,
    ) {
        let phase = self.phase;
        let details = details.into();
        self.inner.update_progress(&self.job_id, |progress| {
            let mut next = progress.clone();
            let percentage = update(&mut next.counters);
            with_phase_percentage(&next, phase, percentage, details)
        });
    }

    /// Recompute the undo steps of this attempt's checkpoint now that the
    /// phase has learned its scope.
    fn refresh_rollback_instructions(&self) {
        let instructions = {
            let state = self.state.lock();
            rollback_instructions(self.phase, &state, &self.options)
        };
        let store = self.inner.engine.checkpoints();
        if let Some(checkpoint) = store.latest_for_phase(&self.job_id, self.phase) {
            store.set_rollback_instructions(&self.job_id, &checkpoint.id, instructions);
        }
    }

    /// Whether an earlier phase of this job ran to completion.
    fn completed(&self, phase: Phase) -> bool {
        self.inner
            .with_job(&self.job_id, |job| {
                job.progress
                    .phase(phase)
                    .map(|p| p.status == PhaseStatus::Completed)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    fn target_ref(&self) -> Result<String> {
        self.state
            .lock()
            .target_ref
            .clone()
            .ok_or_else(|| MigratorError::Migration("Target project has not been created".into()).into())
    }

    fn connections(&self) -> Result<(Arc<ConnectionInfo>, Arc<ConnectionInfo>)> {
        let state = self.state.lock();
        match (&state.source_conn, &state.target_conn) {
            (Some(source), Some(target)) => Ok((source.clone(), target.clone())),
            _ => Err(MigratorError::Migration("Database connections are not resolved".into()).into()),
        }
    }

    fn source_schema(&self) -> Result<Arc<DatabaseSchema>> {
        self.state.lock().source_schema.clone().ok_or_else(|| {
            MigratorError::Migration("Source schema has not been inspected".into()).into()
        })
    }
}

fn with_phase_percentage(
    progress: &Progress,
    phase: Phase,
    percentage: f64,
    details: String,
) -> Progress {
    let percentage = percentage.clamp(0.0, 100.0);
    progress
        .with_phase(phase, |p| {
            p.percentage = percentage;
            p.details = Some(details);
        })
        .advanced_to(phase.overall_at(percentage))
}

fn ratio(done: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 / total as f64 * 100.0
    }
}

pub(super) async fn execute(phase: Phase, ctx: PhaseContext) -> Result<()> {
    match phase {
        Phase::Preparation => preparation(ctx).await,
        Phase::SchemaMigration => schema_migration(ctx).await,
        Phase::DataMigration => data_migration(ctx).await,
        Phase::StorageMigration => storage_migration(ctx).await,
        Phase::ConfigurationMigration => configuration_migration(ctx).await,
        Phase::EdgeFunctionsMigration => edge_functions_migration(ctx).await,
        Phase::SecurityMigration => security_migration(ctx).await,
        Phase::RealtimeSetup => realtime_setup(ctx).await,
        Phase::Validation => validation(ctx).await,
        Phase::Cutover => cutover(ctx).await,
    }
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TARGET_PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

async fn preparation(ctx: PhaseContext) -> Result<()> {
    let existing = ctx.state.lock().target_ref.clone();
    let target_ref = match existing {
        Some(project_ref) => {
            tracing::info!(job_id = %ctx.job_id, target = %project_ref, "Reusing target project");
            project_ref
        }
        None => {
            let password = generate_password();
            let request = CreateProjectRequest {
                organization_id: ctx.options.organization_id.clone(),
                name: ctx.options.target_project_name.clone(),
                region: ctx.options.target_region.clone(),
                tier: ctx.options.target_tier.clone(),
                db_pass: password.clone(),
            };
            let handle = ctx
                .projects()
                .create_project(&request)
                .await
                .context("Failed to create target project")?;
            tracing::info!(job_id = %ctx.job_id, target = %handle.project_ref, "Target project created");

            {
                let mut state = ctx.state.lock();
                state.target_ref = Some(handle.project_ref.clone());
                state.target_password = Some(password);
            }
            ctx.inner.with_job(&ctx.job_id, |job| {
                job.target_project_ref = Some(handle.project_ref.clone())
            });
            handle.project_ref
        }
    };
    ctx.report(20.0, "Target project requested");

    wait_until_ready(&ctx, &target_ref).await?;
    ctx.report(80.0, "Target project is healthy");

    let mut source = ctx
        .projects()
        .get_connection_info(&ctx.options.source_project_ref)
        .await
        .context("Failed to resolve source database")?;
    if source.password.is_none() {
        source.password = ctx.options.source_db_password.clone();
    }
    let mut target = ctx
        .projects()
        .get_connection_info(&target_ref)
        .await
        .context("Failed to resolve target database")?;
    if target.password.is_none() {
        target.password = ctx.state.lock().target_password.clone();
    }

    {
        let mut state = ctx.state.lock();
        state.source_conn = Some(Arc::new(source));
        state.target_conn = Some(Arc::new(target));
    }
    ctx.report(100.0, "Target project ready");
    Ok(())
}

async fn wait_until_ready(ctx: &PhaseContext, project_ref: &str) -> Result<()> {
    let attempts = ctx.inner.settings.project_ready_attempts.max(1);
    let interval = ctx.inner.settings.project_ready_interval();

    for attempt in 1..=attempts {
        match ctx.projects().get_project(project_ref).await {
            Ok(info) if info.status == ProjectStatus::ActiveHealthy => return Ok(()),
            Ok(info) => {
                tracing::debug!(project_ref, attempt, status = ?info.status, "Waiting for target project")
            }
            Err(e) => {
                tracing::debug!(project_ref, attempt, error = %e, "Target project status check failed")
            }
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }

    Err(MigratorError::ProjectNotReady {
        project_ref: project_ref.to_string(),
        attempts,
    }
    .into())
}

async fn apply_statements(
    ctx: &PhaseContext,
    target_ref: &str,
    statements: &[String],
    applied: impl Fn(&mut PhaseState) -> &mut usize,
) -> Result<()> {
    let start = {
        let mut state = ctx.state.lock();
        *applied(&mut *state)
    };
    let total = statements.len();

    for (index, statement) in statements.iter().enumerate().skip(start) {
        ctx.projects()
            .run_query(target_ref, statement)
            .await
            .with_context(|| format!("Failed to apply statement {} of {}", index + 1, total))?;
        {
            let mut state = ctx.state.lock();
            *applied(&mut *state) = index + 1;
        }
        ctx.report(
            ratio(index as u64 + 1, total as u64),
            format!("Applied {}/{} statements", index + 1, total),
        );
    }
    Ok(())
}

async fn schema_migration(ctx: PhaseContext) -> Result<()> {
    let target_ref = ctx.target_ref()?;
    let (source, _) = ctx.connections()?;

    let cached = ctx.state.lock().source_schema.clone();
    let schema = match cached {
        Some(schema) => schema,
        None => {
            let schema = ctx
                .inner
                .collaborators
                .inspector
                .get_complete_schema(&source)
                .await
                .context("Failed to inspect source schema")?;
            let schema = Arc::new(schema);
            ctx.state.lock().source_schema = Some(schema.clone());
            ctx.refresh_rollback_instructions();
            schema
        }
    };
    tracing::info!(
        job_id = %ctx.job_id,
        tables = schema.tables.len(),
        functions = schema.functions.len(),
        "Source schema inspected"
    );

    let statements = render_schema(&schema);
    apply_statements(&ctx, &target_ref, &statements, |s| {
        &mut s.schema_statements_applied
    })
    .await
}

/// Tables the data phase copies, schema-qualified.
fn data_tables(schema: &DatabaseSchema, options: &MigrationOptions) -> Vec<String> {
    let mut tables: Vec<String> = schema
        .tables
        .iter()
        .filter(|t| {
            let bare_public = t.schema == "public" && options.is_excluded(&t.name);
            !bare_public && !options.is_excluded(&t.qualified_name())
        })
        .map(|t| t.qualified_name())
        .collect();

    if options.include_user_data {
        for table in USER_DATA_TABLES {
            if !tables.iter().any(|t| t == table) && !options.is_excluded(table) {
                tables.push(table.to_string());
            }
        }
    }
    tables
}

/// Row filter for `table`; bare names address the public schema.
fn table_filter<'a>(options: &'a MigrationOptions, table: &str) -> Option<&'a str> {
    options.filter_for(table).or_else(|| {
        table
            .strip_prefix("public.")
            .and_then(|bare| options.filter_for(bare))
    })
}

async fn data_migration(ctx: PhaseContext) -> Result<()> {
    let (source, target) = ctx.connections()?;
    let schema = ctx.source_schema()?;
    let tables = data_tables(&schema, &ctx.options);
    let transfer = ctx.transfer();

    let mut totals = Vec::with_capacity(tables.len());
    for table in &tables {
        let rows = transfer
            .count_rows(&source, table, table_filter(&ctx.options, table))
            .await
            .with_context(|| format!("Failed to count rows in {}", table))?;
        totals.push((table.clone(), rows));
    }
    let rows_total: u64 = totals.iter().map(|(_, rows)| rows).sum();
    let tables_total = totals.len() as u64;
    ctx.count(
        |c| {
            c.tables_total = tables_total;
            c.rows_total = rows_total;
            ratio(c.rows_migrated, c.rows_total)
        },
        format!("{} tables, {} rows to copy", tables_total, rows_total),
    );

    let pending: Vec<(String, u64)> = {
        let state = ctx.state.lock();
        totals
            .into_iter()
            .filter(|(table, _)| !state.completed_tables.contains(table))
            .collect()
    };
    let threads = ctx.options.parallel_threads.max(1) as usize;

    let results: Vec<Result<()>> = futures::stream::iter(pending.into_iter().map(|(table, rows)| {
        copy_table(ctx.clone(), source.clone(), target.clone(), table, rows)
    }))
    .buffer_unordered(threads)
    .collect()
    .await;

    results.into_iter().collect::<Result<Vec<()>>>()?;
    Ok(())
}

async fn copy_table(
    ctx: PhaseContext,
    source: Arc<ConnectionInfo>,
    target: Arc<ConnectionInfo>,
    table: String,
    rows: u64,
) -> Result<()> {
    let transfer = ctx.transfer();
    let filter = table_filter(&ctx.options, &table);
    let limit = u64::from(ctx.options.batch_size.max(1));
    let mut offset = ctx.state.lock().table_offsets.get(&table).copied().unwrap_or(0);

    while offset < rows {
        let batch = BatchRequest {
            table: &table,
            filter,
            offset,
            limit,
            compression: ctx.options.compression,
        };
        let copied = transfer
            .copy_batch(&source, &target, &batch)
            .await
            .with_context(|| format!("Failed to copy {} at offset {}", table, offset))?;
        if copied == 0 {
            break;
        }
        offset += copied;
        ctx.state.lock().table_offsets.insert(table.clone(), offset);
        ctx.count(
            |c| {
                c.rows_migrated += copied;
                ratio(c.rows_migrated, c.rows_total)
            },
            format!("Copying {}", table),
        );
    }

    ctx.state.lock().completed_tables.insert(table.clone());
    ctx.count(
        |c| {
            c.tables_migrated += 1;
            if c.rows_total == 0 {
                ratio(c.tables_migrated, c.tables_total)
            } else {
                ratio(c.rows_migrated, c.rows_total)
            }
        },
        format!("Copied {}", table),
    );
    tracing::debug!(job_id = %ctx.job_id, table = %table, rows = offset, "Table copied");
    Ok(())
}

async fn storage_migration(ctx: PhaseContext) -> Result<()> {
    let target_ref = ctx.target_ref()?;
    let source_ref = ctx.options.source_project_ref.as_str();
    let projects = ctx.projects();

    let buckets = projects
        .list_buckets(source_ref)
        .await
        .context("Failed to list source buckets")?;
    let existing: HashSet<String> = projects
        .list_buckets(&target_ref)
        .await
        .context("Failed to list target buckets")?
        .into_iter()
        .map(|b| b.name)
        .collect();

    for bucket in &buckets {
        let created = ctx.state.lock().created_buckets.contains(&bucket.name);
        if existing.contains(&bucket.name) || created {
            continue;
        }
        projects
            .create_bucket(&target_ref, bucket)
            .await
            .with_context(|| format!("Failed to create bucket {}", bucket.name))?;
        ctx.state.lock().created_buckets.insert(bucket.name.clone());
    }
    ctx.report(10.0, format!("{} buckets ready", buckets.len()));

    let mut objects = Vec::new();
    for bucket in &buckets {
        let listed = projects
            .list_storage_objects(source_ref, &bucket.name)
            .await
            .with_context(|| format!("Failed to list objects in bucket {}", bucket.name))?;
        objects.extend(listed.into_iter().map(|o| (bucket.name.clone(), o)));
    }
    let total = objects.len() as u64;

    for (bucket, object) in objects {
        let key = format!("{}/{}", bucket, object.name);
        if ctx.state.lock().copied_objects.contains(&key) {
            continue;
        }
        projects
            .copy_storage_object(source_ref, &target_ref, &bucket, &object)
            .await
            .with_context(|| format!("Failed to copy storage object {}", key))?;
        let copied = {
            let mut state = ctx.state.lock();
            state.copied_objects.insert(key);
            state.copied_objects.len() as u64
        };
        ctx.count(
            |c| {
                c.storage_objects_total = total;
                c.storage_objects_migrated = copied;
                10.0 + ratio(copied, total) * 0.9
            },
            format!("Copied {}/{} objects", copied, total),
        );
    }

    ctx.count(
        |c| {
            c.storage_objects_total = total;
            100.0
        },
        format!("{} objects copied", total),
    );
    Ok(())
}

async fn configuration_migration(ctx: PhaseContext) -> Result<()> {
    let target_ref = ctx.target_ref()?;
    let source = ctx
        .projects()
        .get_config(&ctx.options.source_project_ref)
        .await
        .context("Failed to read source configuration")?;
    ctx.report(50.0, "Source configuration read");

    let config = ProjectConfig {
        auth: if ctx.options.include_auth_config {
            source.auth
        } else {
            None
        },
        postgrest: source.postgrest,
    };
    ctx.projects()
        .update_config(&target_ref, &config)
        .await
        .context("Failed to apply configuration to target")?;
    ctx.report(
        100.0,
        if config.auth.is_some() {
            "API and auth configuration applied"
        } else {
            "API configuration applied"
        },
    );
    Ok(())
}

async fn edge_functions_migration(ctx: PhaseContext) -> Result<()> {
    let target_ref = ctx.target_ref()?;
    let source_ref = ctx.options.source_project_ref.as_str();
    let projects = ctx.projects();

    let functions = projects
        .list_functions(source_ref)
        .await
        .context("Failed to list edge functions")?;
    let total = functions.len() as u64;

    for summary in functions {
        if ctx.state.lock().deployed_functions.contains(&summary.slug) {
            continue;
        }
        let function = projects
            .get_function(source_ref, &summary.slug)
            .await
            .with_context(|| format!("Failed to download edge function {}", summary.slug))?;
        projects
            .deploy_function(&target_ref, &function)
            .await
            .with_context(|| format!("Failed to deploy edge function {}", summary.slug))?;
        let deployed = {
            let mut state = ctx.state.lock();
            state.deployed_functions.insert(summary.slug.clone());
            state.deployed_functions.len() as u64
        };
        ctx.count(
            |c| {
                c.functions_total = total;
                c.functions_migrated = deployed;
                ratio(deployed, total)
            },
            format!("Deployed {}", summary.slug),
        );
    }

    ctx.count(
        |c| {
            c.functions_total = total;
            100.0
        },
        format!("{} functions deployed", total),
    );
    Ok(())
}

async fn security_migration(ctx: PhaseContext) -> Result<()> {
    let target_ref = ctx.target_ref()?;
    let schema = ctx.source_schema()?;
    let statements = render_security(&schema);
    tracing::info!(
        job_id = %ctx.job_id,
        policies = schema.policies.len(),
        statements = statements.len(),
        "Applying security policies"
    );
    apply_statements(&ctx, &target_ref, &statements, |s| {
        &mut s.security_statements_applied
    })
    .await?;
    ctx.report(100.0, "Security policies applied");
    Ok(())
}

async fn realtime_setup(ctx: PhaseContext) -> Result<()> {
    let target_ref = ctx.target_ref()?;
    let (_, target) = ctx.connections()?;
    let source = ctx.source_schema()?;

    let current = ctx
        .inner
        .collaborators
        .inspector
        .get_complete_schema(&target)
        .await
        .context("Failed to inspect target schema")?;
    let target_tables: HashSet<String> = current.tables.iter().map(|t| t.qualified_name()).collect();
    let changes = plan_publications(&source.publications, &current.publications, &target_tables);
    ctx.report(30.0, format!("{} publication changes planned", changes.len()));

    for change in &changes {
        let sql = change.to_sql();
        ctx.projects()
            .run_query(&target_ref, &sql)
            .await
            .with_context(|| format!("Failed to apply publication change: {}", sql))?;
    }
    ctx.report(100.0, "Realtime publications in place");
    Ok(())
}

fn function_digest(body: &[u8]) -> String {
    format!("{:x}", Sha256::digest(body))
}

async fn validation(ctx: PhaseContext) -> Result<()> {
    let target_ref = ctx.target_ref()?;
    let (source, target) = ctx.connections()?;
    let schema = ctx.source_schema()?;
    let options = ctx.options.clone();
    let mut problems = Vec::new();

    let current = ctx
        .inner
        .collaborators
        .inspector
        .get_complete_schema(&target)
        .await
        .context("Failed to inspect target schema")?;
    for table in &schema.tables {
        if current.table(&table.qualified_name()).is_none() {
            problems.push(format!("table {} is missing on target", table.qualified_name()));
        }
    }
    ctx.report(25.0, "Schema verified");

    if ctx.completed(Phase::DataMigration) {
        let transfer = ctx.transfer();
        for table in data_tables(&schema, &options) {
            let filter = table_filter(&options, &table);
            let expected = transfer
                .count_rows(&source, &table, filter)
                .await
                .with_context(|| format!("Failed to count source rows in {}", table))?;
            let actual = transfer
                .count_rows(&target, &table, filter)
                .await
                .with_context(|| format!("Failed to count target rows in {}", table))?;
            let consistent = match options.clone_type {
                CloneType::DataSubset => actual <= expected,
                _ => actual == expected,
            };
            if !consistent {
                problems.push(format!(
                    "table {} has {} rows on target, expected {}",
                    table, actual, expected
                ));
            }
        }
    }
    ctx.report(60.0, "Row counts verified");

    if ctx.completed(Phase::StorageMigration) {
        let wanted = ctx
            .projects()
            .list_buckets(&options.source_project_ref)
            .await
            .context("Failed to list source buckets")?;
        let present: HashSet<String> = ctx
            .projects()
            .list_buckets(&target_ref)
            .await
            .context("Failed to list target buckets")?
            .into_iter()
            .map(|b| b.name)
            .collect();
        for bucket in wanted {
            if !present.contains(&bucket.name) {
                problems.push(format!("bucket {} is missing on target", bucket.name));
            }
        }
    }
    ctx.report(80.0, "Storage verified");

    if ctx.completed(Phase::EdgeFunctionsMigration) {
        let functions = ctx
            .projects()
            .list_functions(&options.source_project_ref)
            .await
            .context("Failed to list edge functions")?;
        for summary in functions {
            let original = ctx
                .projects()
                .get_function(&options.source_project_ref, &summary.slug)
                .await
                .with_context(|| format!("Failed to download edge function {}", summary.slug))?;
            match ctx.projects().get_function(&target_ref, &summary.slug).await {
                Ok(copy) if function_digest(&copy.body) == function_digest(&original.body) => {}
                Ok(_) => problems.push(format!("edge function {} differs on target", summary.slug)),
                Err(_) => problems.push(format!("edge function {} is missing on target", summary.slug)),
            }
        }
    }

    if !problems.is_empty() {
        tracing::error!(job_id = %ctx.job_id, problems = problems.len(), "Clone validation failed");
        return Err(MigratorError::IntegrityCheck(problems.join("; ")).into());
    }
    ctx.report(100.0, "Clone validated");
    Ok(())
}

async fn cutover(ctx: PhaseContext) -> Result<()> {
    let target_ref = ctx.target_ref()?;
    ctx.projects()
        .run_query(&target_ref, "ANALYZE")
        .await
        .context("Failed to refresh planner statistics on target")?;
    ctx.report(100.0, format!("Project {} is ready", target_ref));
    tracing::info!(job_id = %ctx.job_id, target = %target_ref, "Cutover complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DataFilter;
    use crate::schema::{Policy, Table};

    fn table(schema: &str, name: &str) -> Table {
        Table {
            schema: schema.into(),
            name: name.into(),
            columns: Vec::new(),
            constraints: Vec::new(),
            rls_enabled: false,
        }
    }

    fn schema() -> DatabaseSchema {
        DatabaseSchema {
            tables: vec![
                table("public", "users"),
                table("public", "audit_log"),
                table("billing", "invoices"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_data_tables_honours_exclusions_and_user_data() {
        let mut options = MigrationOptions::new("src", "Copy of src", "acme");
        options.excluded_tables = vec!["audit_log".into(), "billing.invoices".into()];
        options.include_user_data = true;

        let tables = data_tables(&schema(), &options);
        assert_eq!(tables, vec!["public.users", "auth.users", "auth.identities"]);
    }

    #[test]
    fn test_table_filter_accepts_bare_public_names() {
        let mut options = MigrationOptions::new("src", "Copy of src", "acme");
        options.data_filters = vec![DataFilter {
            table: "users".into(),
            where_clause: "created_at > now() - interval '30 days'".into(),
        }];

        assert!(table_filter(&options, "public.users").is_some());
        assert!(table_filter(&options, "billing.users").is_none());
    }

    #[test]
    fn test_reset_clears_only_that_phase() {
        let mut state = PhaseState {
            target_ref: Some("tgt".into()),
            schema_statements_applied: 4,
            ..Default::default()
        };
        state.table_offsets.insert("public.users".into(), 500);
        state.completed_tables.insert("public.orders".into());

        state.reset(Phase::DataMigration);
        assert!(state.table_offsets.is_empty());
        assert!(state.completed_tables.is_empty());
        assert_eq!(state.schema_statements_applied, 4);
        assert_eq!(state.target_ref.as_deref(), Some("tgt"));
    }

    #[test]
    fn test_rollback_instructions_follow_phase_state() {
        let mut state = PhaseState::default();
        state.table_offsets.insert("public.users".into(), 100);
        state.completed_tables.insert("public.users".into());
        state.completed_tables.insert("billing.invoices".into());

        let options = MigrationOptions::new("src", "Copy of src", "acme");
        let truncates = rollback_instructions(Phase::DataMigration, &state, &options);
        assert_eq!(truncates.len(), 2);
        assert!(truncates.iter().all(|sql| sql.starts_with("TRUNCATE TABLE")));

        let mut schema = schema();
        schema.policies.push(Policy {
            schema: "public".into(),
            table: "users".into(),
            name: "own rows".into(),
            command: "SELECT".into(),
            permissive: true,
            roles: vec!["authenticated".into()],
            using: Some("auth.uid() = id".into()),
            with_check: None,
        });
        state.source_schema = Some(Arc::new(schema));
        assert_eq!(rollback_instructions(Phase::SchemaMigration, &state, &options).len(), 3);
        assert_eq!(rollback_instructions(Phase::SecurityMigration, &state, &options).len(), 1);
        assert!(rollback_instructions(Phase::Cutover, &state, &options).is_empty());
    }

    #[test]
    fn test_data_rollback_covers_every_table_before_any_copy() {
        let state = PhaseState {
            source_schema: Some(Arc::new(schema())),
            ..Default::default()
        };
        let mut options = MigrationOptions::new("src", "Copy of src", "acme");
        options.excluded_tables = vec!["audit_log".into()];

        let truncates = rollback_instructions(Phase::DataMigration, &state, &options);
        assert_eq!(
            truncates,
            vec![
                "TRUNCATE TABLE \"billing\".\"invoices\" CASCADE",
                "TRUNCATE TABLE \"public\".\"users\" CASCADE",
            ]
        );
    }

    #[test]
    fn test_checkpoint_blob_omits_credentials() {
        let state = PhaseState {
            target_ref: Some("tgt".into()),
            target_password: Some("secret".into()),
            ..Default::default()
        };
        let blob = state.checkpoint_blob();
        assert_eq!(blob["target_ref"], "tgt");
        assert!(!blob.to_string().contains("secret"));
    }

    #[test]
    fn test_reset_counters() {
        let mut counters = MigrationCounters {
            rows_migrated: 10,
            rows_total: 20,
            tables_migrated: 1,
            functions_migrated: 2,
            ..Default::default()
        };
        reset_counters(Phase::DataMigration, &mut counters);
        assert_eq!(counters.rows_migrated, 0);
        assert_eq!(counters.rows_total, 20);
        assert_eq!(counters.functions_migrated, 2);
    }

    #[test]
    fn test_generated_password() {
        let password = generate_password();
        assert_eq!(password.len(), TARGET_PASSWORD_LENGTH);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
