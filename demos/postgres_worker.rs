//! PostgreSQL Worker Example
//!
//! Connects with `DATABASE_URL`, creates the job table and runs a pair of
//! workers against it. A stale worker whose reservation timed out loses its
//! commit with a lock conflict instead of overwriting the newer result.

use async_trait::async_trait;
use pullq::{
    Job, JobContext, JobHandler, JobRegistry, PostgresConfig, PostgresStorage, PullqError,
    QueueSystem, Result, Settings,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct GenerateReport;

#[async_trait]
impl JobHandler for GenerateReport {
    fn job_type(&self) -> &str {
        "generate_report"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<()> {
        let month = ctx.parameter_or("month", "unknown");
        for step in 1..=4 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.report_progress(step as f64 * 25.0).await;
        }
        ctx.finish_with_result(serde_json::json!({ "month": month, "rows": 1280 }));
        Ok(())
    }

    fn default_timeout_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(1)
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&settings.log_level))
        .init();

    println!("🚀 Starting pullq PostgreSQL demo");

    let mut config = PostgresConfig::new().with_auto_migrate(true);
    if let Some(url) = &settings.database_url {
        config = config.with_database_url(url.clone());
    }

    println!("🔗 Connecting to PostgreSQL...");
    let registry = Arc::new(JobRegistry::new().with::<GenerateReport>());
    let storage = PostgresStorage::new(registry, config).await?;
    println!("✅ Connected, job table is ready");

    let system = QueueSystem::new(Arc::new(storage));
    let reports = system.queue("reports");
    let id = reports
        .enqueue(&mut Job::new(GenerateReport).with_parameter("month", "2024-05"))
        .await?;
    println!("📝 Enqueued report job #{}", id);

    let slow = system.worker(None);
    let fast = system.worker(None);

    let mut stale = slow
        .reserve(false, Duration::ZERO)
        .await?
        .ok_or("nothing to reserve")?;
    println!("⏳ Worker {} reserved #{} and stalls", slow.id(), id);

    // Let the one-second reservation lapse.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let mut fresh = fast
        .reserve(true, settings.reserve_timeout)
        .await?
        .ok_or("job did not become eligible again")?;
    println!("⚡ Worker {} took over #{}", fast.id(), id);

    let outcome = fast.run(&mut fresh).await?;
    println!("✅ Fresh worker committed: {}", outcome.name());

    match slow.run(&mut stale).await {
        Err(PullqError::LockConflict { version, .. }) => {
            println!("🔒 Stale commit rejected (held version {})", version)
        }
        other => println!("⚠️  Unexpected result for stale commit: {:?}", other),
    }

    if let Some(job) = system.get_job_by_id(id).await? {
        println!(
            "📋 Stored job #{}: version {} progress {:?} result {:?}",
            id,
            job.version(),
            job.progress(),
            job.result()
        );
    }

    Ok(())
}
