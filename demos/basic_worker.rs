//! Basic Worker Example
//!
//! Enqueues a few jobs and drains them with one worker. The backend is
//! picked from the environment (`PULLQ_BACKEND`, `REDIS_URL`, `DATABASE_URL`),
//! defaulting to in-memory storage.
//!
//! ```text
//! PULLQ_LOG_LEVEL=debug cargo run --example basic_worker
//! ```

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use pullq::storage::StorageInstance;
use pullq::{Job, JobContext, JobHandler, JobRegistry, QueueSystem, Result, Settings};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct Double;

#[async_trait]
impl JobHandler for Double {
    fn job_type(&self) -> &str {
        "math"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<()> {
        let n: i64 = ctx.parameter_as("n")?.unwrap_or_default();
        ctx.finish_with_result(n * 2);
        Ok(())
    }
}

/// Fails twice before it gets through.
#[derive(Default)]
struct SendEmail;

#[async_trait]
impl JobHandler for SendEmail {
    fn job_type(&self) -> &str {
        "send_email"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<()> {
        let to = ctx.parameter_or("to", "nobody@example.com");
        if ctx.retry_count() < 2 {
            info!("📧 Mail server busy, will retry sending to {}", to);
            ctx.fail();
            ctx.then_retry();
            ctx.retry_after(ChronoDuration::seconds(1))?;
            return Ok(());
        }

        ctx.report_progress(50.0).await;
        info!("📧 Sent email to {}", to);
        ctx.finish();
        Ok(())
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&settings.log_level))
        .init();

    println!("🚀 Starting pullq basic worker demo ({:?} backend)", settings.backend);

    let registry = Arc::new(JobRegistry::new().with::<Double>().with::<SendEmail>());
    let storage = StorageInstance::from_config(settings.storage_config()?, registry).await?;
    let system = QueueSystem::new(Arc::new(storage));
    system.initial_setup().await?;

    let math = system.queue("math");
    let mail = system.queue("mail");
    let mut ids = Vec::new();
    for n in 1..=3 {
        ids.push(math.enqueue(&mut Job::new(Double).with_parameter("n", n)).await?);
    }
    ids.push(
        mail.enqueue(&mut Job::new(SendEmail).with_parameter("to", "user@example.com"))
            .await?,
    );
    println!("✅ Enqueued {} jobs", ids.len());

    let worker = system.worker(Some(vec!["math".to_string(), "mail".to_string()]));
    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.work().await })
    };

    // The email job sits out its retry delays in between.
    tokio::time::sleep(settings.reserve_timeout.min(Duration::from_secs(4))).await;
    worker.shutdown();
    let processed = handle.await??;
    println!("⚙️  Worker ran {} jobs", processed);

    for id in ids {
        if let Some(job) = system.get_job_by_id(id).await? {
            println!(
                "  #{} {} finished={} failed={} retries={} result={:?}",
                id,
                job.job_type(),
                job.is_finished(),
                job.is_failed(),
                job.retry_count(),
                job.result()
            );
        }
    }

    println!("🎉 Demo complete");
    Ok(())
}
