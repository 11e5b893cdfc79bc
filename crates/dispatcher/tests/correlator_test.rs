use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dispatch_core::models::{TaskResponse, TaskStatus};
use dispatch_core::traits::DriverCallback;
use dispatch_core::{DispatchError, DispatchResult};
use serde_json::json;

mod common;
use common::{shell_task, Harness, TENANT};

#[derive(Default)]
struct RecordingDriver {
    sync: Mutex<Vec<(String, Vec<u8>)>>,
    asynchronous: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl DriverCallback for RecordingDriver {
    fn driver_id(&self) -> &str {
        "pipeline-driver"
    }

    async fn publish_sync_task_response(&self, task_id: &str, payload: Vec<u8>) -> DispatchResult<()> {
        self.sync.lock().unwrap().push((task_id.to_string(), payload));
        Ok(())
    }

    async fn publish_async_task_response(
        &self,
        task_id: &str,
        payload: Vec<u8>,
    ) -> DispatchResult<()> {
        self.asynchronous
            .lock()
            .unwrap()
            .push((task_id.to_string(), payload));
        Ok(())
    }
}

async fn acquire_until_assigned(harness: &Harness, worker_id: &str) -> String {
    for _ in 0..100 {
        if let Some(package) = harness
            .engine
            .acquisition
            .acquire(TENANT, worker_id, "default")
            .await
            .unwrap()
        {
            return package.task.id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task was never submitted");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_execute_unblocked_by_worker_response() {
    let harness = Harness::new();
    let worker = harness.register_worker("pool-a", &[]).await;

    let submission = harness.engine.submission.clone();
    let caller = tokio::spawn(async move { submission.execute(shell_task()).await });

    let task_id = acquire_until_assigned(&harness, &worker.id).await;
    let response = TaskResponse::ok(&task_id, json!({"stdout": "hi"}));
    assert!(harness
        .engine
        .acquisition
        .submit_response(TENANT, &worker.id, response.clone())
        .await
        .unwrap());

    let delivered = caller.await.unwrap().unwrap();
    assert_eq!(delivered, response);
    assert!(harness.engine.correlator.waits().is_empty());
}

#[tokio::test]
async fn test_response_after_timeout_is_safe_noop() {
    let harness = Harness::new();

    let mut task = shell_task();
    task.data.timeout_ms = 50;
    let task_id = task.id.clone();

    let err = harness.engine.submission.execute(task).await.unwrap_err();
    assert!(matches!(err, DispatchError::Timeout(_)));
    assert!(!harness.engine.correlator.waits().is_waiting(&task_id));

    // 任务已过期，晚到的结果直接丢弃
    assert!(!harness
        .engine
        .correlator
        .process_response(&task_id, TaskResponse::ok(&task_id, json!(null))));
    let stored = harness.engine.submission.get(&task_id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Queued);
}

#[tokio::test]
async fn test_driver_routes_by_async_flag() {
    let harness = Harness::new();
    let driver = Arc::new(RecordingDriver::default());
    harness.engine.correlator.drivers().register(driver.clone());

    let sync_task = shell_task().with_driver("pipeline-driver");
    let mut async_task = shell_task().with_driver("pipeline-driver");
    async_task.data.is_async = true;

    let response = TaskResponse::ok(&sync_task.id, json!({"ok": true}));
    harness
        .engine
        .correlator
        .handle_driver_response(Some(&sync_task), Some(&response))
        .await
        .unwrap();
    let response = TaskResponse::ok(&async_task.id, json!({"ok": true}));
    harness
        .engine
        .correlator
        .handle_driver_response(Some(&async_task), Some(&response))
        .await
        .unwrap();

    let sync = driver.sync.lock().unwrap();
    assert_eq!(sync.len(), 1);
    assert_eq!(sync[0].0, sync_task.id);
    let decoded: TaskResponse = serde_json::from_slice(&sync[0].1).unwrap();
    assert_eq!(decoded.task_id, sync_task.id);
    assert_eq!(driver.asynchronous.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_driver_drops_response() {
    let harness = Harness::new();
    let task = shell_task().with_driver("gone");
    let response = TaskResponse::ok(&task.id, json!(1));
    harness
        .engine
        .correlator
        .handle_driver_response(Some(&task), Some(&response))
        .await
        .unwrap();
    harness
        .engine
        .correlator
        .handle_driver_response(Some(&task), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_completed_async_task_reaches_driver() {
    let harness = Harness::new();
    let driver = Arc::new(RecordingDriver::default());
    harness.engine.correlator.drivers().register(driver.clone());
    let worker = harness.register_worker("pool-a", &[]).await;

    let mut task = shell_task().with_driver("pipeline-driver");
    task.data.is_async = true;
    let task_id = harness.engine.submission.submit(task).await.unwrap();
    harness
        .engine
        .acquisition
        .acquire(TENANT, &worker.id, "default")
        .await
        .unwrap()
        .unwrap();
    harness
        .engine
        .acquisition
        .submit_response(TENANT, &worker.id, TaskResponse::failed(&task_id, "exit 1"))
        .await
        .unwrap();

    let delivered = driver.asynchronous.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, task_id);
    let stored = harness.engine.submission.get(&task_id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Error);
}
