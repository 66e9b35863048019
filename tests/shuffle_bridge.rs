//! Shuffle context bridge as seen from the shuffle master

mod support;

use jobmaster_core::common::{Error, JobEventKind, ResourceId, ResultPartitionId, SessionToken, ShuffleConfig};
use jobmaster_core::jobmaster::RunnerState;
use jobmaster_core::shuffle::{JobShuffleContext, PartitionTracker, TrackedPartition};
use std::time::Duration;
use support::{eventually, within, Harness, TestingTaskExecutor};

async fn running(h: &Harness) {
    h.runner.grant_leadership(SessionToken::new()).await.unwrap();
    h.wait_for_state(RunnerState::ProcessRunning).await;
}

fn tracked_ids(h: &Harness, service: usize) -> Vec<ResultPartitionId> {
    let mut ids: Vec<_> = h
        .services
        .service(service)
        .context
        .partitions
        .tracked_partitions()
        .into_iter()
        .map(|p| p.id)
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let h = Harness::start(vec![]);
    running(&h).await;

    let context = h.services.service(0).context.clone();
    let (a, b) = (ResultPartitionId::new(), ResultPartitionId::new());
    assert!(context.partition_produced(TrackedPartition::new(a, ResourceId::new("tm-1"))));
    assert!(context.partition_produced(TrackedPartition::new(b, ResourceId::new("tm-1"))));

    let bridge = h.shuffle_master.context(h.job_id).unwrap();
    assert_eq!(bridge.job_id(), h.job_id);

    bridge.stop_tracking_and_release_partitions(&[a]).await.unwrap();
    assert_eq!(tracked_ids(&h, 0), vec![b]);

    bridge.stop_tracking_and_release_partitions(&[a]).await.unwrap();
    assert_eq!(tracked_ids(&h, 0), vec![b]);

    // never-seen ids are fine too
    bridge
        .stop_tracking_and_release_partitions(&[ResultPartitionId::new()])
        .await
        .unwrap();
    assert_eq!(tracked_ids(&h, 0), vec![b]);

    let lost = context.lost_partitions.drain();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].id, a);
    assert_eq!(h.events.count(JobEventKind::PartitionsReleased), 1);
}

#[tokio::test]
async fn test_worker_loss_reaches_the_current_job() {
    let h = Harness::start(vec![]);
    let (tm1, tm2) = (TestingTaskExecutor::new("tm-1"), TestingTaskExecutor::new("tm-2"));
    h.workers.register(tm1.clone());
    h.workers.register(tm2.clone());
    running(&h).await;

    let context = h.services.service(0).context.clone();
    let (a, b) = (ResultPartitionId::new(), ResultPartitionId::new());
    context.partition_produced(TrackedPartition::new(a, ResourceId::new("tm-1")));
    context.partition_produced(TrackedPartition::new(b, ResourceId::new("tm-2")));
    tm1.hold(h.job_id, a);
    tm2.hold(h.job_id, b);

    let report = h.shuffle_master.notify_worker_lost(&ResourceId::new("tm-1")).await;
    assert_eq!(report.jobs_notified, vec![h.job_id]);
    assert!(report.jobs_rejected.is_empty());
    assert_eq!(report.partitions, 1);
    assert_eq!(tracked_ids(&h, 0), vec![b]);
    assert_eq!(h.events.count(JobEventKind::WorkerLost), 1);

    // consumers are marked before the release is acknowledged
    assert_eq!(context.lost_partitions.len(), 1);
    eventually(|| tm1.released() == vec![a]).await;
    assert!(tm2.released().is_empty());
}

#[tokio::test]
async fn test_bridge_rejects_calls_after_revoke() {
    let h = Harness::start(vec![]);
    running(&h).await;

    let context = h.services.service(0).context.clone();
    let a = ResultPartitionId::new();
    context.partition_produced(TrackedPartition::new(a, ResourceId::new("tm-1")));
    let bridge = h.shuffle_master.context(h.job_id).unwrap();

    h.runner.revoke_leadership().await.unwrap();
    h.wait_for_state(RunnerState::Idle).await;

    assert!(h.shuffle_master.context(h.job_id).is_none());
    let err = bridge.stop_tracking_and_release_partitions(&[a]).await.unwrap_err();
    assert!(err.is_not_leader_or_closed());
    let err = bridge
        .get_all_partition_with_metrics_on_task_managers()
        .await
        .unwrap_err();
    assert!(err.is_not_leader_or_closed());
    assert!(context.partitions.is_tracked(&a));

    // the job id stays readable
    assert_eq!(bridge.job_id(), h.job_id);
}

#[tokio::test]
async fn test_new_leader_gets_a_fresh_bridge() {
    let h = Harness::start(vec![]);
    running(&h).await;
    let old = h.shuffle_master.context(h.job_id).unwrap();

    h.runner.grant_leadership(SessionToken::new()).await.unwrap();
    h.wait_for_state(RunnerState::ProcessRunning).await;

    let new = h.shuffle_master.context(h.job_id).unwrap();
    assert!(matches!(
        old.stop_tracking_and_release_partitions(&[]).await,
        Err(Error::ShuffleContextUnavailable(_)) | Err(Error::StaleSession { .. })
    ));
    assert!(new.stop_tracking_and_release_partitions(&[]).await.is_ok());
}

#[tokio::test]
async fn test_metrics_query_returns_partial_result_within_bound() {
    let h = Harness::with_config(
        vec![],
        ShuffleConfig {
            metrics_query_timeout_ms: 100,
            release_partitions_on_workers: false,
        },
    );
    let workers = [
        TestingTaskExecutor::new("tm-1"),
        TestingTaskExecutor::new("tm-2"),
        TestingTaskExecutor::hanging("tm-3"),
    ];
    for worker in &workers {
        h.workers.register(worker.clone());
    }
    running(&h).await;

    let context = h.services.service(0).context.clone();
    for (i, worker) in workers.iter().enumerate() {
        let id = ResultPartitionId::new();
        context.partition_produced(TrackedPartition::new(id, ResourceId::new(format!("tm-{}", i + 1))));
        worker.hold(h.job_id, id);
    }

    let started = std::time::Instant::now();
    let report = within(h.shuffle_master.partition_metrics(h.job_id))
        .await
        .unwrap()
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!report.is_complete());
    assert_eq!(report.partitions.len(), 2);
    assert_eq!(report.unresponsive, vec![ResourceId::new("tm-3")]);
    assert_eq!(h.events.count(JobEventKind::PartitionMetricsIncomplete), 1);
}
