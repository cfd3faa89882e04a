use redis::aio::ConnectionManager;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::EnvFilter;
use tribunal_common::config::{JudgeSettings, LanguageConfigManager};
use tribunal_common::redis as queue;
use tribunal_common::types::{JobRecord, JobReport, JobStatus, JudgeJob};
use tribunal_engine::JudgeService;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Tribunal worker booting...");

    let settings = JudgeSettings::from_env()?;
    let languages = LanguageConfigManager::load(&settings.languages_path).map_err(|e| {
        error!("Failed to load language configurations: {}", e);
        error!("Make sure {} exists", settings.languages_path.display());
        e
    })?;
    info!("Loaded language configurations for: {:?}", languages.list_languages());

    let redis_url = settings.redis_url.clone();
    let service = JudgeService::from_settings(settings, &languages)?;

    let client = ::redis::Client::open(redis_url.as_str())?;
    let mut redis_conn = ConnectionManager::new(client).await?;
    info!("Connected to Redis: {}", redis_url);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        warn!("Received shutdown signal, stopping after the current job...");
        let _ = shutdown_tx.send(true);
    });

    worker_loop(&mut redis_conn, &service, shutdown_rx).await;

    info!("Worker shutdown complete");
    Ok(())
}

/// Shutdown is only observed between jobs; a popped job always gets its record stored
async fn worker_loop(redis_conn: &mut ConnectionManager, service: &JudgeService, shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        // BLPOP with 5 second timeout for graceful shutdown
        match queue::pop_job(redis_conn, 5.0).await {
            Ok(Some(job)) => process_job(redis_conn, service, job).await,
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }
}

#[instrument(skip_all, fields(job_id = %job.id, kind = job.kind()))]
async fn process_job(redis_conn: &mut ConnectionManager, service: &JudgeService, job: JudgeJob) {
    let job_id = job.id;
    info!(submitted_at = %job.submitted_at, "Received job");

    if let Err(e) = queue::set_status(redis_conn, &job_id, JobStatus::Running).await {
        warn!(error = %e, "Failed to mark job running");
    }

    let start = std::time::Instant::now();
    let record = judge_job(service, job).await;
    info!(
        outcome = %record.report.outcome(),
        execution_ms = start.elapsed().as_millis() as u64,
        "Judging completed"
    );

    match queue::store_result(redis_conn, &record).await {
        Ok(_) => debug!("Result persisted to Redis"),
        // Non-fatal - worker continues
        Err(e) => error!(error = %e, "Failed to persist result"),
    }
}

/// Batch grading always runs every case
async fn judge_job(service: &JudgeService, job: JudgeJob) -> JobRecord {
    let job_id = job.id;
    let report = service.run_job(job).await;
    if let JobReport::Evaluate(response) = &report {
        debug!(
            passed_cases = response.passed_cases,
            total_cases = response.total_cases,
            "Evaluation summary"
        );
    }
    JobRecord::completed(job_id, report)
}
