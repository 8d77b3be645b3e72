use pressroom_core::PressroomConfig;
use pressroom_orchestrator::{CollectionWorker, Collector, NullCollector};
use pressroom_queue::{AdmissionConfig, QueueManager, Scheduler};
use pressroom_workflow::WorkflowEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const MAINTENANCE_PERIOD: Duration = Duration::from_secs(30);
const WORKER_IDLE: Duration = Duration::from_millis(500);

/// Start `count` collection workers sharing `manager`. They stop when
/// `shutdown` flips to `true`.
fn spawn_collection_workers(
    manager: &Arc<QueueManager>,
    collector: Arc<dyn Collector>,
    count: usize,
    shutdown: &watch::Receiver<bool>,
    idle: Duration,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|_| {
            let worker = CollectionWorker::new(manager.clone(), collector.clone());
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown, idle).await })
        })
        .collect()
}

/// Run the scheduler and a collection worker pool sized by
/// `queue.max_concurrent` until Ctrl-C. Every maintenance period, stale
/// Processing tasks go back through the retry path and timed-out validations
/// are expired.
pub async fn run(config: PressroomConfig) -> anyhow::Result<()> {
    let broker = Arc::new(crate::open_broker(&config).await?);
    let manager = Arc::new(QueueManager::new(
        broker,
        AdmissionConfig::from(&config.queue),
    ));
    let engine = crate::open_engine(&config).await?;
    let scheduler = Scheduler::from_config(&config.scheduler, manager.clone())?;

    info!(
        data_dir = %config.data_dir.display(),
        sources = scheduler.sources().count(),
        workflows = ?engine.workflow_names(),
        "Starting Pressroom"
    );
    scheduler.start().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_collection_workers(
        &manager,
        Arc::new(NullCollector),
        config.queue.max_concurrent,
        &shutdown_rx,
        WORKER_IDLE,
    );
    info!(workers = workers.len(), "Collection workers started");

    let mut maintenance = tokio::time::interval(MAINTENANCE_PERIOD);
    maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = maintenance.tick() => {
                maintain(&manager, &engine, config.queue.visibility_timeout()).await;
            }
        }
    }

    info!("Shutting down");
    scheduler.stop().await;
    if shutdown_tx.send(true).is_err() {
        warn!("Collection workers already gone");
    }
    for handle in workers {
        if let Err(e) = handle.await {
            warn!(error = %e, "Collection worker panicked");
        }
    }
    info!(
        ticks = scheduler.ticks_completed(),
        skipped = scheduler.ticks_skipped(),
        "Scheduler stopped"
    );
    Ok(())
}

async fn maintain(manager: &QueueManager, engine: &WorkflowEngine, visibility_timeout: Duration) {
    match manager.reclaim_expired(visibility_timeout).await {
        Ok(ids) if !ids.is_empty() => info!(count = ids.len(), "Reclaimed stale tasks"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Reclaiming stale tasks failed"),
    }
    match engine.expire_stale().await {
        Ok(ids) if !ids.is_empty() => info!(count = ids.len(), "Expired stale validations"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Expiring stale validations failed"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pressroom_queue::{Broker, MemoryBroker};

    #[tokio::test]
    async fn test_worker_pool_drains_scheduled_jobs() {
        let broker = Arc::new(MemoryBroker::new());
        let manager = Arc::new(QueueManager::new(
            broker.clone(),
            AdmissionConfig {
                rate_limit: Duration::ZERO,
                ..AdmissionConfig::default()
            },
        ));
        for source in ["riot_news", "hltv", "liquipedia_valorant"] {
            manager.queue_collection_job(source, None).await.unwrap();
        }

        let (tx, rx) = watch::channel(false);
        let workers = spawn_collection_workers(
            &manager,
            Arc::new(NullCollector),
            2,
            &rx,
            Duration::from_millis(5),
        );
        assert_eq!(workers.len(), 2);

        for _ in 0..200 {
            if broker.counts().await.unwrap().completed == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(broker.counts().await.unwrap().completed, 3);
        assert_eq!(manager.in_flight().await, 0);

        tx.send(true).unwrap();
        for handle in workers {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
