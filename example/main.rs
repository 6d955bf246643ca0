use isoqueue::config::LoggingConfig;
use isoqueue::logging::init_logging;
use isoqueue::validator::{create_code_generation_task, create_task};
use isoqueue::*;
use serde_json::{Map, Value, json};
use std::time::Duration;

fn registry() -> FunctionRegistry {
    FunctionRegistry::new()
        .register("plan", |args| {
            let description = args.arg(0)?.as_str().unwrap_or_default().to_string();
            std::thread::sleep(Duration::from_millis(100));
            Ok(json!({ "steps": ["outline", "implement", "verify"], "for": description }))
        })
        .register("generate_code", |args| {
            let language = args.kwarg("language").and_then(Value::as_str).unwrap_or("rust");
            std::thread::sleep(Duration::from_millis(150));
            Ok(json!({ "language": language, "lines": 42 }))
        })
        .register("write_docs", |_| Err("ValueError: boom".to_string()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Worker processes are this same binary relaunched by the executor.
    if let Some(code) = serve_if_worker(&registry()) {
        std::process::exit(code);
    }

    init_logging(&LoggingConfig::default());

    let queue = PriorityTaskQueue::in_memory();
    let executor = IsolatedExecutor::new(ExecutorConfig::default(), registry())?;

    let plan = create_task(TaskType::Planning, "plan the feature", TaskPriority::Medium, &[], Map::new())?;
    let plan_id = queue.put(plan).await?;

    let mut code = create_code_generation_task("write the code", "rust", None, &[], TaskPriority::High)?;
    code.dependencies = vec![plan_id.clone()];
    let code_id = queue.put(code).await?;

    let docs = create_task(
        TaskType::Documentation,
        "document it",
        TaskPriority::Low,
        &[code_id.clone()],
        Map::new(),
    )?;
    queue.put(docs).await?;

    println!("=== queue ===");
    for task in queue.get_all_tasks().await {
        println!("{:<28} {:<16} {:<6} deps={:?}", task.id, task.task_type.as_str(), task.priority.as_str(), task.dependencies);
    }

    let start = std::time::Instant::now();
    while let Some(task) = queue.get(true, Some(Duration::from_secs(2))).await {
        let function = match task.task_type {
            TaskType::Planning => "plan",
            TaskType::CodeGeneration => "generate_code",
            _ => "write_docs",
        };
        let mut spec = TaskSpec::new(function)
            .with_id(task.id.clone())
            .with_task_type(task.task_type.as_str())
            .with_args(vec![json!(task.description)])
            .with_timeout(Duration::from_secs(10));
        if let Some(language) = task.metadata.get("language") {
            spec = spec.with_kwarg("language", language.clone());
        }

        let id = executor.create_task(spec).await?;
        let outcome = executor.execute_task(&id).await.map_err(|e| e.to_string());
        println!("{} -> {:?}", task.id, outcome);
        queue.finish_task(&task.id, outcome).await;
    }

    println!("=== done in {:?} ===", start.elapsed());
    println!("queue: {:?}", queue.get_status_counts().await);
    println!("executor: {:#?}", executor.get_stats().await);

    executor.cleanup().await;
    Ok(())
}
