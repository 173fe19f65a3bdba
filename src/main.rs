// ABOUTME: Command-line entry point for cloning hosted projects
// ABOUTME: Wires the HTTP and PostgreSQL collaborators into the orchestrator and error monitor

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use project_migrator::audit::TracingAuditSink;
use project_migrator::config::Settings;
use project_migrator::logging;
use project_migrator::models::{JobStatus, MigrationOptions};
use project_migrator::monitoring::{
    ApiAvailabilityProbe, ConnectivityProbe, ErrorMonitor, HealthStatus, ResourceUsageProbe,
    StorageAccessProbe,
};
use project_migrator::orchestrator::{Collaborators, MigrationEvent, MigrationOrchestrator};
use project_migrator::recovery::{RecoveryEngine, SqlRollbackHooks};
use project_migrator::remote::{HttpProjectClient, PostgresInspector, PostgresTransfer};

const API_SLOW_THRESHOLD: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    name = "project-migrator",
    version,
    about = "Clone a hosted PostgreSQL project into a new project"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); overrides the settings file
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone a project as described by an options file
    Clone {
        /// Clone options (TOML or JSON)
        options: PathBuf,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
        /// Recorded in the audit trail
        #[arg(long, default_value = "cli")]
        requested_by: String,
    },
    /// Validate an options file without contacting any project
    Validate {
        /// Clone options (TOML or JSON)
        options: PathBuf,
    },
    /// Run the health probes once and print the results
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    let level = cli.log_level.as_deref().unwrap_or(&settings.log_level);
    logging::init(level, settings.json_logs());

    match cli.command {
        Commands::Clone {
            options,
            yes,
            requested_by,
        } => clone(&settings, &options, yes, &requested_by).await,
        Commands::Validate { options } => {
            let options = load_options(&options)?;
            options.validate()?;
            println!(
                "✓ Options are valid (estimated duration {} minutes)",
                options.estimated_duration().as_secs().div_ceil(60)
            );
            Ok(())
        }
        Commands::Health => health(&settings).await,
    }
}

fn load_options(path: &Path) -> Result<MigrationOptions> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read options file {}", path.display()))?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse options file {}", path.display()))
    } else {
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse options file {}", path.display()))
    }
}

fn api_client(settings: &Settings) -> Result<Arc<HttpProjectClient>> {
    let token = settings.api.access_token.clone().with_context(|| {
        format!(
            "No access token configured; set {}",
            project_migrator::config::ENV_ACCESS_TOKEN
        )
    })?;
    let client = HttpProjectClient::new(
        settings.api.base_url.clone(),
        token,
        settings.api.project_url_template.clone(),
        settings.api.request_timeout(),
    )?;
    Ok(Arc::new(client))
}

fn monitor(
    settings: &Settings,
    client: &Arc<HttpProjectClient>,
    orchestrator: Option<&MigrationOrchestrator>,
) -> Result<Arc<ErrorMonitor>> {
    let monitor = Arc::new(
        ErrorMonitor::new(settings.monitoring.clone()).with_audit(Arc::new(TracingAuditSink)),
    );
    monitor.add_probe(Arc::new(ConnectivityProbe::for_url(
        &settings.api.base_url,
        settings.monitoring.probe_timeout(),
    )?));
    monitor.add_probe(Arc::new(ApiAvailabilityProbe::new(
        client.clone(),
        API_SLOW_THRESHOLD,
    )));
    monitor.add_probe(Arc::new(StorageAccessProbe::new(
        client.clone(),
        settings.monitoring.reference_project_ref.clone(),
    )));
    if let Some(orchestrator) = orchestrator {
        monitor.add_probe(Arc::new(ResourceUsageProbe::new(Arc::new(
            orchestrator.clone(),
        ))));
    }
    Ok(monitor)
}

async fn clone(
    settings: &Settings,
    options_path: &Path,
    yes: bool,
    requested_by: &str,
) -> Result<()> {
    let options = load_options(options_path)?;
    options.validate()?;

    println!("Source project:  {}", options.source_project_ref);
    println!("Target project:  {} ({})", options.target_project_name, options.target_region);
    println!("Clone type:      {}", options.clone_type);
    println!(
        "Estimated time:  {} minutes",
        options.estimated_duration().as_secs().div_ceil(60)
    );

    if !yes {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt("Create the target project and start cloning?")
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            println!("Cancelled");
            return Ok(());
        }
    }

    let client = api_client(settings)?;
    let collaborators = Collaborators {
        projects: client.clone(),
        inspector: Arc::new(PostgresInspector::new()),
        transfer: Arc::new(PostgresTransfer::new()),
    };
    let engine = Arc::new(RecoveryEngine::new(
        settings.recovery.checkpoint_limit,
        Arc::new(SqlRollbackHooks::new(client.clone())),
    ));
    let orchestrator = MigrationOrchestrator::builder(settings.orchestrator.clone(), collaborators)
        .recovery(engine)
        .build();

    let monitor = monitor(settings, &client, Some(&orchestrator))?;
    let watcher = monitor.clone().watch(orchestrator.subscribe());
    let health = monitor.clone().start();

    let mut events = orchestrator.subscribe();
    let job_id = orchestrator.start(options, requested_by).await?;
    println!("Started job {}", job_id);

    follow(&mut events, &job_id).await?;

    health.abort();
    watcher.abort();

    let job = orchestrator
        .status(&job_id)
        .await
        .with_context(|| format!("Job {} disappeared", job_id))?;
    let alerts = monitor.active_alerts();
    if !alerts.is_empty() {
        println!("{} unresolved alerts:", alerts.len());
        for alert in alerts {
            println!("  [{}] {}: {}", alert.severity, alert.title, alert.message);
        }
    }

    match job.status {
        JobStatus::Completed => {
            println!(
                "✓ Clone complete: {} in {}s",
                job.target_project_ref.unwrap_or_default(),
                job.actual_duration_secs.unwrap_or_default()
            );
            Ok(())
        }
        status => {
            for record in &job.error_log {
                println!("  {} [{}] {}", record.phase, record.code, record.message);
            }
            bail!("Clone job {} ended as {}", job_id, status)
        }
    }
}

/// Render progress for `job_id` until it reaches a terminal event.
async fn follow(events: &mut broadcast::Receiver<MigrationEvent>, job_id: &str) -> Result<()> {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40}] {pos:>3}% {msg}")
            .context("Invalid progress template")?
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(200));

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if event.job_id() != job_id {
            continue;
        }

        match &event {
            MigrationEvent::ProgressUpdated { progress, .. } => {
                bar.set_position(progress.overall_percentage.round() as u64);
                if let Some(phase) = progress.current_phase {
                    bar.set_message(phase.display_name());
                }
            }
            MigrationEvent::FaultRecorded { error, .. } => {
                bar.println(format!("  ! {} [{}] {}", error.phase, error.code, error.message));
            }
            MigrationEvent::RetryScheduled {
                phase,
                attempt,
                delay_ms,
                ..
            } => {
                bar.println(format!(
                    "  ↻ retrying {} (attempt {}) in {}ms",
                    phase, attempt, delay_ms
                ));
            }
            MigrationEvent::ManualInterventionRequired { message, .. } => {
                bar.println(format!("  ✗ manual intervention required: {}", message));
            }
            _ => {}
        }

        if event.is_terminal() {
            break;
        }
    }

    bar.finish_and_clear();
    Ok(())
}

async fn health(settings: &Settings) -> Result<()> {
    let client = api_client(settings)?;
    let monitor = monitor(settings, &client, None)?;

    let mut critical = false;
    for check in monitor.run_health_checks().await {
        let marker = match check.status {
            HealthStatus::Healthy => "✓",
            HealthStatus::Warning => "!",
            HealthStatus::Critical => {
                critical = true;
                "✗"
            }
        };
        let timing = check
            .response_time_ms
            .map(|ms| format!(" ({}ms)", ms))
            .unwrap_or_default();
        match check.error {
            Some(error) => println!("{} {}{}: {}", marker, check.name, timing, error),
            None => println!("{} {}{}", marker, check.name, timing),
        }
    }

    if critical {
        bail!("One or more health checks are critical");
    }
    Ok(())
}
