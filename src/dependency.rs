use std::collections::{HashMap, HashSet};

use crate::QueuedTask;

/// Every task id that must complete before `task_id` can run, following
/// dependencies transitively. Ids that are referenced but unknown are still
/// included; their own dependencies cannot be followed. Cycles terminate the
/// walk, and a task that depends on itself through a cycle appears in its own
/// closure.
pub fn get_dependencies_closure(
    tasks: &HashMap<String, QueuedTask>,
    task_id: &str,
) -> HashSet<String> {
    let mut closure = HashSet::new();
    let mut stack: Vec<&str> = match tasks.get(task_id) {
        Some(task) => task.dependencies.iter().map(String::as_str).collect(),
        None => return closure,
    };

    while let Some(dep) = stack.pop() {
        if !closure.insert(dep.to_string()) {
            continue;
        }
        if let Some(task) = tasks.get(dep) {
            stack.extend(task.dependencies.iter().map(String::as_str));
        }
    }

    closure
}

/// Whether any dependency chain loops back on itself. The queue never calls
/// this on admission; tasks caught in a cycle stay blocked.
pub fn has_cycle(tasks: &HashMap<String, QueuedTask>) -> bool {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();

    fn dfs<'a>(
        task_id: &'a str,
        tasks: &'a HashMap<String, QueuedTask>,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
    ) -> bool {
        if rec_stack.contains(task_id) {
            return true;
        }
        if visited.contains(task_id) {
            return false;
        }

        visited.insert(task_id);
        rec_stack.insert(task_id);

        if let Some(task) = tasks.get(task_id) {
            for dep in &task.dependencies {
                if dfs(dep, tasks, visited, rec_stack) {
                    return true;
                }
            }
        }

        rec_stack.remove(task_id);
        false
    }

    tasks
        .keys()
        .any(|id| !visited.contains(id.as_str()) && dfs(id, tasks, &mut visited, &mut rec_stack))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskType;

    fn graph(edges: &[(&str, &[&str])]) -> HashMap<String, QueuedTask> {
        edges
            .iter()
            .map(|(id, deps)| {
                let task = QueuedTask::new(TaskType::Custom, *id)
                    .with_id(*id)
                    .with_dependencies(deps.iter().copied());
                (id.to_string(), task)
            })
            .collect()
    }

    #[test]
    fn closure_follows_transitive_dependencies() {
        let tasks = graph(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("d", &["c", "a"]),
        ]);
        let closure = get_dependencies_closure(&tasks, "d");
        let expected: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(closure, expected);
        assert!(get_dependencies_closure(&tasks, "a").is_empty());
    }

    #[test]
    fn closure_includes_unknown_ids_and_survives_cycles() {
        let tasks = graph(&[("x", &["y", "ghost"]), ("y", &["x"])]);
        let closure = get_dependencies_closure(&tasks, "x");
        assert!(closure.contains("ghost"));
        assert!(closure.contains("y"));
        assert!(closure.contains("x"));
    }

    #[test]
    fn detects_cycles() {
        assert!(!has_cycle(&graph(&[("a", &[]), ("b", &["a"])])));
        assert!(has_cycle(&graph(&[("a", &["b"]), ("b", &["a"])])));
        assert!(has_cycle(&graph(&[("a", &["a"])])));
    }
}
