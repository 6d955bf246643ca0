use std::collections::HashSet;

use isoqueue::*;
use serde_json::json;
use tempfile::tempdir;

fn task(id: &str, priority: TaskPriority) -> QueuedTask {
    QueuedTask::new(TaskType::Analysis, format!("analyse {}", id))
        .with_id(id)
        .with_priority(priority)
}

#[tokio::test]
async fn snapshot_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state").join("queue.json");

    let before = {
        let queue = PriorityTaskQueue::open(QueueConfig::with_file(&path)).await.unwrap();
        queue.put(task("low", TaskPriority::Low)).await.unwrap();
        queue.put(task("high", TaskPriority::High)).await.unwrap();
        queue
            .put(task("after-high", TaskPriority::High).with_dependencies(["high"]))
            .await
            .unwrap();
        queue.put(task("done", TaskPriority::Medium)).await.unwrap();

        // "high" sorts first, then "done"; finish the latter.
        assert_eq!(queue.get(false, None).await.unwrap().id, "high");
        assert_eq!(queue.get(false, None).await.unwrap().id, "done");
        assert!(queue.finish_task("done", Ok(json!({"lines": 3}))).await);
        assert!(queue.cancel_task("low").await);
        queue.put(task("low-again", TaskPriority::Low)).await.unwrap();
        queue.save_queue().await.unwrap();
        queue.get_all_tasks().await
    };
    assert!(path.exists());

    let queue = PriorityTaskQueue::open(QueueConfig::with_file(&path)).await.unwrap();
    assert_eq!(queue.get_all_tasks().await, before);

    let counts = queue.get_status_counts().await;
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.blocked, 1);
    assert_eq!(counts.running, 1);
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.cancelled, 1);
    assert_eq!(counts.total, 5);

    let done = queue.get_task("done").await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result, Some(json!({"lines": 3})));
    assert!(done.completed_at.is_some());

    // The reloaded dependency graph still unblocks.
    assert!(queue.task_completed("high", true).await);
    assert_eq!(queue.get(false, None).await.unwrap().id, "after-high");
    assert_eq!(queue.get(false, None).await.unwrap().id, "low-again");
    assert!(queue.get(false, None).await.is_none());
}

#[tokio::test]
async fn snapshot_is_a_json_array_of_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("queue.json");
    let queue = PriorityTaskQueue::open(QueueConfig::with_file(&path)).await.unwrap();
    queue.put(task("a", TaskPriority::Medium)).await.unwrap();
    queue.save_queue().await.unwrap();

    let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let records = raw.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], "a");
    assert_eq!(records[0]["type"], "analysis");
    assert_eq!(records[0]["priority"], "medium");
    assert_eq!(records[0]["status"], "pending");
}

#[tokio::test]
async fn missing_empty_and_corrupt_files_load_as_empty() {
    let dir = tempdir().unwrap();

    let missing = PriorityTaskQueue::open(QueueConfig::with_file(dir.path().join("nope.json")))
        .await
        .unwrap();
    assert!(missing.is_empty().await);

    let empty = dir.path().join("empty.json");
    std::fs::write(&empty, "  \n").unwrap();
    let queue = PriorityTaskQueue::open(QueueConfig::with_file(&empty)).await.unwrap();
    assert_eq!(queue.get_status_counts().await.total, 0);

    let corrupt = dir.path().join("corrupt.json");
    std::fs::write(&corrupt, "{ not json").unwrap();
    let queue = PriorityTaskQueue::open(QueueConfig::with_file(&corrupt)).await.unwrap();
    assert_eq!(queue.get_status_counts().await.total, 0);

    // The queue stays usable and overwrites the bad file.
    queue.put(task("fresh", TaskPriority::High)).await.unwrap();
    assert_eq!(queue.load_queue().await.unwrap(), 1);
}

#[tokio::test]
async fn validated_payloads_flow_into_the_queue() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("queue.json");
    let queue = PriorityTaskQueue::open(QueueConfig::with_file(&path)).await.unwrap();

    let code = validator::create_code_generation_task(
        "write a parser",
        "rust",
        Some("nom"),
        &["no unsafe".to_string()],
        TaskPriority::High,
    )
    .unwrap();
    let code_id = queue.put(code).await.unwrap();

    let tests = validator::create_test_generation_task("cover it", "src/parser.rs", None, Some(80.0), TaskPriority::Medium)
        .unwrap()
        .with_dependencies([code_id.clone()]);
    let tests_id = queue.put(tests).await.unwrap();

    assert_eq!(queue.get_task(&tests_id).await.unwrap().status, TaskStatus::Blocked);
    assert_eq!(
        queue.dependency_closure(&tests_id).await,
        HashSet::from([code_id.clone()])
    );

    let reopened = PriorityTaskQueue::open(QueueConfig::with_file(&path)).await.unwrap();
    let restored = reopened.get_task(&code_id).await.unwrap();
    assert_eq!(restored.task_type, TaskType::CodeGeneration);
    assert_eq!(restored.metadata["language"], "rust");
    assert_eq!(restored.metadata["framework"], "nom");
}
