use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use dispatch_core::models::{
    ConnectionResult, Constraint, InstanceState, ReleaseEntity, SelectionLogBatch,
    SequenceIdentity, TaskStatus,
};
use dispatch_core::DispatchError;

use database_test_utils::{all_backends, shell_task};

#[tokio::test]
async fn test_task_status_cas() -> Result<()> {
    for (backend, repos, _db) in all_backends().await? {
        let task = repos.tasks.save(&shell_task("t1"), TaskStatus::Queued).await?;

        assert!(
            repos
                .tasks
                .update_status(&task.id, TaskStatus::Queued, TaskStatus::Aborted)
                .await?,
            "{backend}"
        );
        // 当前状态已不是QUEUED，第二次转换不生效
        assert!(
            !repos
                .tasks
                .update_status(&task.id, TaskStatus::Queued, TaskStatus::Started)
                .await?,
            "{backend}"
        );
        let stored = repos.tasks.get(&task.id).await?.unwrap();
        assert_eq!(stored.status, TaskStatus::Aborted, "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn test_concurrent_assign_has_single_winner() -> Result<()> {
    for (backend, repos, _db) in all_backends().await? {
        let task = repos.tasks.save(&shell_task("t1"), TaskStatus::Queued).await?;
        let now = Utc::now();

        let mut handles = Vec::new();
        for i in 0..8 {
            let tasks = Arc::clone(&repos.tasks);
            let id = task.id.clone();
            handles.push(tokio::spawn(async move {
                tasks
                    .assign(&id, &format!("w{i}"), now + Duration::minutes(1), now)
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await??.is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "{backend}");

        let stored = repos.tasks.get(&task.id).await?.unwrap();
        assert_eq!(stored.status, TaskStatus::Started, "{backend}");
        assert!(stored.worker_id.is_some(), "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn test_pinned_task_is_not_scheduled_for_broadcast() -> Result<()> {
    for (backend, repos, _db) in all_backends().await? {
        let mut task = shell_task("t1").pinned_to("w1");
        task.next_broadcast_at = Some(Utc::now());
        let saved = repos.tasks.save(&task, TaskStatus::Queued).await?;
        assert!(saved.next_broadcast_at.is_none(), "{backend}");

        let due = repos
            .tasks
            .find_due_for_broadcast(Utc::now() + Duration::hours(1), 10)
            .await?;
        assert!(due.is_empty(), "{backend}");

        let visible = repos
            .tasks
            .find_acquirable("t1", "default", "w2", Utc::now(), 10)
            .await?;
        assert!(visible.is_empty(), "{backend}");
        let visible = repos
            .tasks
            .find_acquirable("t1", "default", "w1", Utc::now(), 10)
            .await?;
        assert_eq!(visible.len(), 1, "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn test_validation_then_mark_tried() -> Result<()> {
    for (backend, repos, _db) in all_backends().await? {
        let task = repos.tasks.save(&shell_task("t1"), TaskStatus::Queued).await?;
        let now = Utc::now();

        assert!(repos.tasks.start_validation(&task.id, "w1", now).await?);
        let stored = repos.tasks.get(&task.id).await?.unwrap();
        assert!(stored.is_validating("w1"), "{backend}");
        assert_eq!(stored.status, TaskStatus::Queued, "{backend}");

        let tried = repos.tasks.mark_tried(&task.id, "w1", now).await?.unwrap();
        assert!(!tried.is_validating("w1"), "{backend}");
        assert_eq!(tried.already_tried, vec!["w1".to_string()], "{backend}");
        assert_eq!(tried.status, TaskStatus::Queued, "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn test_release_stale_validations() -> Result<()> {
    for (backend, repos, _db) in all_backends().await? {
        let now = Utc::now();
        let stale = repos.tasks.save(&shell_task("t1"), TaskStatus::Queued).await?;
        let fresh = repos.tasks.save(&shell_task("t1"), TaskStatus::Queued).await?;
        assert!(repos.tasks.start_validation(&stale.id, "w1", now - Duration::seconds(30)).await?);
        assert!(repos.tasks.start_validation(&fresh.id, "w2", now).await?);

        let released = repos
            .tasks
            .release_stale_validations(now - Duration::seconds(12), now)
            .await?;
        assert_eq!(released.len(), 1, "{backend}");
        assert_eq!(released[0].id, stale.id, "{backend}");

        let stored = repos.tasks.get(&stale.id).await?.unwrap();
        assert!(stored.validating_worker_ids.is_empty(), "{backend}");
        assert!(stored.validation_started_at.is_none(), "{backend}");
        assert!(stored.already_tried.is_empty(), "{backend}");
        assert_eq!(
            stored.next_broadcast_at.map(|at| at.timestamp_millis()),
            Some(now.timestamp_millis()),
            "{backend}"
        );
        assert!(repos.tasks.get(&fresh.id).await?.unwrap().is_validating("w2"), "{backend}");

        // 已释放的任务不会再次命中
        let again = repos
            .tasks
            .release_stale_validations(now - Duration::seconds(12), now)
            .await?;
        assert!(again.is_empty(), "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn test_mark_expired_reaps_timeouts_and_broadcast_bound() -> Result<()> {
    for (backend, repos, _db) in all_backends().await? {
        let now = Utc::now();

        let mut timed_out = shell_task("t1");
        timed_out.expires_at = now - Duration::seconds(1);
        let timed_out = repos.tasks.save(&timed_out, TaskStatus::Queued).await?;

        let over_broadcast = repos.tasks.save(&shell_task("t1"), TaskStatus::Queued).await?;
        for _ in 0..3 {
            repos
                .tasks
                .record_broadcast(&over_broadcast.id, Some(now), now)
                .await?;
        }

        let healthy = repos.tasks.save(&shell_task("t1"), TaskStatus::Queued).await?;

        let mut reaped: Vec<String> = repos
            .tasks
            .mark_expired(now, 3)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        reaped.sort();
        let mut expected = vec![timed_out.id.clone(), over_broadcast.id.clone()];
        expected.sort();
        assert_eq!(reaped, expected, "{backend}");

        let healthy = repos.tasks.get(&healthy.id).await?.unwrap();
        assert_eq!(healthy.status, TaskStatus::Queued, "{backend}");
        let timed_out = repos.tasks.get(&timed_out.id).await?.unwrap();
        assert_eq!(timed_out.status, TaskStatus::Error, "{backend}");

        // 再次回收不会重复返回
        assert!(repos.tasks.mark_expired(now, 3).await?.is_empty(), "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn test_requeue_and_complete_require_owner() -> Result<()> {
    for (backend, repos, _db) in all_backends().await? {
        let now = Utc::now();
        let task = repos.tasks.save(&shell_task("t1"), TaskStatus::Queued).await?;
        repos
            .tasks
            .assign(&task.id, "w1", now + Duration::minutes(1), now)
            .await?
            .unwrap();

        assert!(repos.tasks.requeue(&task.id, "w2", now).await?.is_none(), "{backend}");
        assert!(
            !repos
                .tasks
                .complete(&task.id, "w2", TaskStatus::Finished, now)
                .await?,
            "{backend}"
        );

        let requeued = repos.tasks.requeue(&task.id, "w1", now).await?.unwrap();
        assert_eq!(requeued.status, TaskStatus::Queued, "{backend}");
        assert!(requeued.worker_id.is_none(), "{backend}");
        assert!(requeued.has_tried("w1"), "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn test_sequence_insert_duplicate_and_rebind() -> Result<()> {
    for (backend, repos, _db) in all_backends().await? {
        let now = Utc::now();
        let identity = SequenceIdentity::new("t1", "ecs", 0, "tok-a", now - Duration::minutes(5));
        repos.sequences.insert(&identity).await?;

        let duplicate = SequenceIdentity::new("t1", "ecs", 0, "tok-b", now);
        let err = repos.sequences.insert(&duplicate).await.unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateKey(_)), "{backend}");

        let stale_before = now - Duration::seconds(100);
        assert!(
            repos
                .sequences
                .rebind_if_stale(&identity.id, "tok-b", stale_before, now)
                .await?,
            "{backend}"
        );
        // 已经刷新，第二个竞争者换绑失败
        assert!(
            !repos
                .sequences
                .rebind_if_stale(&identity.id, "tok-c", stale_before, now)
                .await?,
            "{backend}"
        );

        assert!(!repos.sequences.touch("t1", "ecs", 0, "tok-a", now).await?);
        assert!(repos.sequences.touch("t1", "ecs", 0, "tok-b", now).await?);
    }
    Ok(())
}

#[tokio::test]
async fn test_selection_logs_and_connection_results() -> Result<()> {
    for (backend, repos, _db) in all_backends().await? {
        let now = Utc::now();
        let mut batch = SelectionLogBatch::new("t1", "task-1", 0);
        batch.reject("w1", "missing selector");
        batch.accept("w2", "whitelisted");
        repos.selection_logs.save(&batch.seal(now)).await?;

        let logs = repos.selection_logs.list_by_task("t1", "task-1").await?;
        assert_eq!(logs.len(), 1, "{backend}");
        assert_eq!(logs[0].entries.len(), 2, "{backend}");

        assert_eq!(repos.selection_logs.purge_before(now).await?, 0, "{backend}");
        let purged = repos
            .selection_logs
            .purge_before(now + Duration::seconds(1))
            .await?;
        assert_eq!(purged, 1, "{backend}");
        assert!(repos.selection_logs.list_by_task("t1", "task-1").await?.is_empty(), "{backend}");

        let result = |criteria: &str, validated: bool| ConnectionResult {
            tenant_id: "t1".to_string(),
            worker_id: "w1".to_string(),
            criteria: criteria.to_string(),
            validated,
            last_updated_at: now,
        };
        repos
            .connection_results
            .upsert_all(&[result("a:22", false), result("b:443", true)])
            .await?;
        repos.connection_results.upsert_all(&[result("a:22", true)]).await?;

        let mut history = repos
            .connection_results
            .list("t1", "w1", &["a:22".to_string(), "b:443".to_string()])
            .await?;
        history.sort_by(|a, b| a.criteria.cmp(&b.criteria));
        assert_eq!(history.len(), 2, "{backend}");
        assert!(history.iter().all(|r| r.validated), "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn test_constraint_fifo_admission() -> Result<()> {
    for (backend, repos, _db) in all_backends().await? {
        let now = Utc::now();
        let constraint = Constraint::new("t1", "deploy-slots", 2);
        repos.constraints.insert(&constraint).await?;

        let err = repos
            .constraints
            .insert(&Constraint::new("t1", "deploy-slots", 5))
            .await
            .unwrap_err();
        assert!(err.is_race_loss(), "{backend}");

        let a = ReleaseEntity::new("exec-a", "WORKFLOW");
        let b = ReleaseEntity::new("exec-b", "WORKFLOW");
        let c = ReleaseEntity::new("exec-c", "WORKFLOW");

        let first = repos.constraints.acquire(&constraint.id, "infra", &a, 1, now).await?;
        let second = repos.constraints.acquire(&constraint.id, "infra", &b, 2, now).await?;
        let third = repos.constraints.acquire(&constraint.id, "infra", &c, 1, now).await?;
        assert_eq!(first.state, InstanceState::Active, "{backend}");
        assert_eq!(second.state, InstanceState::Blocked, "{backend}");
        // 容量还够，但前面有人排队
        assert_eq!(third.state, InstanceState::Blocked, "{backend}");

        // 重复申请返回已有实例
        let again = repos.constraints.acquire(&constraint.id, "infra", &a, 1, now).await?;
        assert_eq!(again.id, first.id, "{backend}");

        repos.constraints.release(&constraint.id, "infra", "exec-a").await?;
        let promoted = repos.constraints.promote(&constraint.id, "infra", now).await?;
        assert_eq!(promoted.len(), 1, "{backend}");
        assert_eq!(promoted[0].release_entity.id, "exec-b", "{backend}");

        let instances = repos.constraints.list_instances(&constraint.id, "infra").await?;
        let active: i32 = instances.iter().filter(|i| i.is_active()).map(|i| i.permits).sum();
        assert!(active <= 2, "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn test_capacity_update_below_usage_is_rejected() -> Result<()> {
    for (backend, repos, _db) in all_backends().await? {
        let now = Utc::now();
        let constraint = Constraint::new("t1", "slots", 3);
        repos.constraints.insert(&constraint).await?;
        repos
            .constraints
            .acquire(&constraint.id, "infra", &ReleaseEntity::new("e1", "PIPELINE"), 2, now)
            .await?;

        let err = repos
            .constraints
            .update_capacity(&constraint.id, 1, now)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ValidationError(_)), "{backend}");
        let unchanged = repos.constraints.get(&constraint.id).await?.unwrap();
        assert_eq!(unchanged.capacity, 3, "{backend}");

        let updated = repos.constraints.update_capacity(&constraint.id, 2, now).await?;
        assert_eq!(updated.capacity, 2, "{backend}");
    }
    Ok(())
}
