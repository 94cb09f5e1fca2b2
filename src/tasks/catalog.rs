use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::TaskError;
use crate::tasks::shutdown::Shutdown;

/// Keyword arguments of a job, as configured.
pub type TaskArgs = Map<String, Value>;

pub type TaskFn = Arc<dyn Fn(&TaskContext, &TaskArgs) -> Result<(), TaskError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TaskContext {
    pub name: String,
    pub shutdown: Shutdown,
}

/// Name → function table populated once at startup.
#[derive(Clone, Default)]
pub struct TaskCatalog {
    tasks: HashMap<String, TaskFn>,
}

impl TaskCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, task: F)
    where
        F: Fn(&TaskContext, &TaskArgs) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.tasks.insert(name.to_string(), Arc::new(task));
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.tasks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }
}

pub fn arg_str<'a>(args: &'a TaskArgs, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

pub fn arg_u64(args: &TaskArgs, key: &str) -> Option<u64> {
    match args.get(key)? {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
