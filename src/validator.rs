//! Task payload validation and factory helpers.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use jsonschema::error::ValidationErrorKind;
use jsonschema::{Draft, Validator};
use serde_json::{Map, Value, json};

use crate::{QueuedTask, TaskPriority, TaskStatus, TaskType, ValidationError};

static COUNTER: AtomicU64 = AtomicU64::new(1);

static TASK_SCHEMA: LazyLock<Result<Validator, String>> = LazyLock::new(|| compile(&task_schema()));
static CODE_GENERATION_SCHEMA: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    compile(&json!({
        "type": "object",
        "required": ["language"],
        "properties": {
            "language": { "type": "string" },
            "framework": { "type": "string" },
            "file_path": { "type": "string" },
            "requirements": { "type": "array", "items": { "type": "string" } }
        }
    }))
});
static TEST_GENERATION_SCHEMA: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    compile(&json!({
        "type": "object",
        "required": ["target_file"],
        "properties": {
            "target_file": { "type": "string" },
            "test_framework": { "type": "string" },
            "coverage_target": { "type": "number", "minimum": 0, "maximum": 100 }
        }
    }))
});
static REFACTORING_SCHEMA: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    compile(&json!({
        "type": "object",
        "required": ["target_files"],
        "properties": {
            "target_files": { "type": "array", "items": { "type": "string" }, "minItems": 1 },
            "refactoring_type": {
                "enum": ["extract_method", "rename", "restructure", "simplify", "optimize"]
            }
        }
    }))
});

fn task_schema() -> Value {
    let task_types: Vec<&str> = TaskType::ALL.iter().map(TaskType::as_str).collect();
    let priorities: Vec<&str> = TaskPriority::ALL.iter().map(TaskPriority::as_str).collect();
    let timestamp = json!({ "type": ["string", "null"], "format": "date-time" });
    let strings = json!({ "type": "array", "items": { "type": "string" } });

    json!({
        "type": "object",
        "required": ["task_id", "task_type", "description", "priority", "status"],
        "properties": {
            "task_id": { "type": "string", "minLength": 1, "maxLength": 100 },
            "task_type": { "enum": task_types },
            "description": { "type": "string", "minLength": 1, "maxLength": 1000 },
            "priority": { "enum": priorities },
            "status": { "enum": ["pending", "blocked", "running", "completed", "failed", "cancelled"] },
            "dependencies": strings,
            "tags": strings,
            "created_at": timestamp,
            "updated_at": timestamp,
            "retry_count": { "type": "integer", "minimum": 0 },
            "max_retries": { "type": "integer", "minimum": 0, "maximum": 10 },
            "metadata": { "type": ["object", "null"] }
        }
    })
}

fn compile(schema: &Value) -> Result<Validator, String> {
    jsonschema::options()
        .with_draft(Draft::Draft7)
        .should_validate_formats(true)
        .build(schema)
        .map_err(|e| format!("invalid task schema: {}", e))
}

/// Time-based queue task id, unique within the process.
pub fn next_task_id() -> String {
    let count = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("task_{}_{}", Utc::now().timestamp_millis(), count)
}

pub fn validate_task(task_data: &Value) -> Result<(), ValidationError> {
    check(&TASK_SCHEMA, task_data, "")?;

    let retry_count = task_data.get("retry_count").and_then(Value::as_u64).unwrap_or(0);
    let max_retries = task_data.get("max_retries").and_then(Value::as_u64).unwrap_or(3);
    if retry_count > max_retries {
        return Err(ValidationError::new("retry_count", "must not exceed max_retries"));
    }

    let Some(metadata) = task_data.get("metadata").filter(|m| m.is_object()) else {
        return Ok(());
    };
    let task_type = task_data
        .get("task_type")
        .and_then(Value::as_str)
        .and_then(|t| t.parse::<TaskType>().ok());
    match task_type {
        Some(TaskType::CodeGeneration) => check(&CODE_GENERATION_SCHEMA, metadata, "metadata"),
        Some(TaskType::TestGeneration) => check(&TEST_GENERATION_SCHEMA, metadata, "metadata"),
        Some(TaskType::Refactoring) => check(&REFACTORING_SCHEMA, metadata, "metadata"),
        _ => Ok(()),
    }
}

fn check(schema: &Result<Validator, String>, instance: &Value, prefix: &str) -> Result<(), ValidationError> {
    let validator = schema
        .as_ref()
        .map_err(|e| ValidationError::new("$schema", e.clone()))?;
    validator
        .validate(instance)
        .map_err(|error| ValidationError::new(field_path(prefix, &error), error.to_string()))
}

/// Dotted field path for an error, e.g. `metadata.language` or
/// `dependencies[1]`. Missing properties name the property itself.
fn field_path(prefix: &str, error: &jsonschema::ValidationError<'_>) -> String {
    fn push_key(path: &mut String, key: &str) {
        if !path.is_empty() {
            path.push('.');
        }
        path.push_str(key);
    }

    let mut path = prefix.to_string();

    let pointer = error.instance_path.to_string();
    for segment in pointer.split('/').filter(|s| !s.is_empty()) {
        if segment.bytes().all(|b| b.is_ascii_digit()) {
            path.push_str(&format!("[{}]", segment));
        } else {
            push_key(&mut path, segment);
        }
    }
    if let ValidationErrorKind::Required { property } = &error.kind {
        if let Some(name) = property.as_str() {
            push_key(&mut path, name);
        }
    }

    if path.is_empty() { "$".to_string() } else { path }
}

/// Validated payload → record.
pub fn into_queued_task(task_data: Value) -> Result<QueuedTask, ValidationError> {
    validate_task(&task_data)?;
    serde_json::from_value(task_data).map_err(|e| ValidationError::new("$", e.to_string()))
}

/// Builds a pending task with default fields and validates it.
pub fn create_task(
    task_type: TaskType,
    description: &str,
    priority: TaskPriority,
    dependencies: &[String],
    metadata: Map<String, Value>,
) -> Result<QueuedTask, ValidationError> {
    let now = Utc::now().to_rfc3339();
    let payload = json!({
        "task_id": next_task_id(),
        "task_type": task_type.as_str(),
        "description": description,
        "priority": priority.as_str(),
        "status": TaskStatus::Pending.as_str(),
        "dependencies": dependencies,
        "tags": [],
        "created_at": now,
        "updated_at": now,
        "retry_count": 0,
        "max_retries": 3,
        "metadata": metadata,
    });
    into_queued_task(payload)
}

pub fn create_code_generation_task(
    description: &str,
    language: &str,
    framework: Option<&str>,
    requirements: &[String],
    priority: TaskPriority,
) -> Result<QueuedTask, ValidationError> {
    let mut metadata = Map::new();
    metadata.insert("language".into(), json!(language));
    if let Some(framework) = framework {
        metadata.insert("framework".into(), json!(framework));
    }
    metadata.insert("requirements".into(), json!(requirements));
    create_task(TaskType::CodeGeneration, description, priority, &[], metadata)
}

pub fn create_test_generation_task(
    description: &str,
    target_file: &str,
    test_framework: Option<&str>,
    coverage_target: Option<f64>,
    priority: TaskPriority,
) -> Result<QueuedTask, ValidationError> {
    let mut metadata = Map::new();
    metadata.insert("target_file".into(), json!(target_file));
    if let Some(framework) = test_framework {
        metadata.insert("test_framework".into(), json!(framework));
    }
    if let Some(coverage) = coverage_target {
        metadata.insert("coverage_target".into(), json!(coverage));
    }
    create_task(TaskType::TestGeneration, description, priority, &[], metadata)
}

pub fn create_refactoring_task(
    description: &str,
    target_files: &[String],
    refactoring_type: Option<&str>,
    priority: TaskPriority,
) -> Result<QueuedTask, ValidationError> {
    let mut metadata = Map::new();
    metadata.insert("target_files".into(), json!(target_files));
    if let Some(kind) = refactoring_type {
        metadata.insert("refactoring_type".into(), json!(kind));
    }
    create_task(TaskType::Refactoring, description, priority, &[], metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Value {
        json!({
            "task_id": "t-1",
            "task_type": "analysis",
            "description": "look at the logs",
            "priority": "low",
            "status": "pending"
        })
    }

    fn with(mut payload: Value, key: &str, value: Value) -> Value {
        payload[key] = value;
        payload
    }

    #[test]
    fn accepts_minimal_payload() {
        assert!(validate_task(&base()).is_ok());
    }

    #[test]
    fn rejects_missing_required_field() {
        let mut payload = base();
        payload.as_object_mut().unwrap().remove("priority");
        let err = validate_task(&payload).unwrap_err();
        assert_eq!(err.path, "priority");
    }

    #[test]
    fn rejects_unknown_enum_values() {
        let err = validate_task(&with(base(), "status", json!("sleeping"))).unwrap_err();
        assert_eq!(err.path, "status");
        let err = validate_task(&with(base(), "task_type", json!("poetry"))).unwrap_err();
        assert_eq!(err.path, "task_type");
    }

    #[test]
    fn enforces_description_bounds() {
        assert!(validate_task(&with(base(), "description", json!(""))).is_err());
        let long = "x".repeat(1001);
        assert!(validate_task(&with(base(), "description", json!(long))).is_err());
        let max = "x".repeat(1000);
        assert!(validate_task(&with(base(), "description", json!(max))).is_ok());
    }

    #[test]
    fn retry_count_cannot_exceed_max() {
        let payload = with(with(base(), "retry_count", json!(4)), "max_retries", json!(3));
        assert_eq!(validate_task(&payload).unwrap_err().path, "retry_count");
    }

    #[test]
    fn dependencies_must_be_strings() {
        let err = validate_task(&with(base(), "dependencies", json!(["a", 2]))).unwrap_err();
        assert_eq!(err.path, "dependencies[1]");
    }

    #[test]
    fn timestamps_must_parse() {
        assert!(validate_task(&with(base(), "created_at", json!("yesterday"))).is_err());
        assert!(validate_task(&with(base(), "created_at", json!("2024-05-01T12:00:00Z"))).is_ok());
    }

    #[test]
    fn code_generation_requires_language() {
        let payload = with(with(base(), "task_type", json!("code_generation")), "metadata", json!({}));
        assert_eq!(validate_task(&payload).unwrap_err().path, "metadata.language");
    }

    #[test]
    fn nested_metadata_errors_name_the_element() {
        let payload = with(
            with(base(), "task_type", json!("code_generation")),
            "metadata",
            json!({ "language": "rust", "requirements": ["fast", 7] }),
        );
        assert_eq!(validate_task(&payload).unwrap_err().path, "metadata.requirements[1]");
    }

    #[test]
    fn wrong_top_level_type_is_reported_at_the_root() {
        assert_eq!(validate_task(&json!(["not", "an", "object"])).unwrap_err().path, "$");
    }

    #[test]
    fn refactoring_checks_kind_and_files() {
        let payload = with(
            with(base(), "task_type", json!("refactoring")),
            "metadata",
            json!({ "target_files": [], "refactoring_type": "rename" }),
        );
        assert_eq!(validate_task(&payload).unwrap_err().path, "metadata.target_files");

        let payload = with(
            with(base(), "task_type", json!("refactoring")),
            "metadata",
            json!({ "target_files": ["a.rs"], "refactoring_type": "rewrite_everything" }),
        );
        assert_eq!(validate_task(&payload).unwrap_err().path, "metadata.refactoring_type");
    }

    #[test]
    fn metadata_of_other_types_is_unchecked() {
        let payload = with(base(), "metadata", json!({ "anything": [1, 2, 3] }));
        assert!(validate_task(&payload).is_ok());
    }

    #[test]
    fn factories_return_pending_records() {
        let task = create_code_generation_task(
            "write a parser",
            "rust",
            Some("nom"),
            &["no panics".to_string()],
            TaskPriority::High,
        )
        .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.task_type, TaskType::CodeGeneration);
        assert_eq!(task.retry_count, 0);
        assert!(task.id.starts_with("task_"));
        assert!(task.created_at.is_some());
        assert_eq!(task.metadata["language"], "rust");

        let test_task =
            create_test_generation_task("cover it", "src/lib.rs", None, Some(80.0), TaskPriority::Low).unwrap();
        assert_eq!(test_task.metadata["coverage_target"], 80.0);

        assert!(create_test_generation_task("cover it", "src/lib.rs", None, Some(120.0), TaskPriority::Low).is_err());
        assert!(create_refactoring_task("tidy", &[], None, TaskPriority::Medium).is_err());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(next_task_id(), next_task_id());
    }
}
