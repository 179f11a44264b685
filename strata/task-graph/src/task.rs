use std::sync::Mutex;

use thiserror::Error;

/// The failure payload a task closure may return.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{0}")]
pub struct TaskError(pub String);

impl TaskError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        TaskError(message.into())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
}

type TaskFn = Box<dyn FnOnce() -> Result<(), TaskError> + Send>;

/// One unit of work in a [TaskGraph](crate::TaskGraph): a fallible
/// closure plus its position in the dependency graph.
pub struct Task {
    id: u64,
    name: String,
    func: Mutex<Option<TaskFn>>,
    status: Mutex<TaskStatus>,
    predecessors: Mutex<Vec<u64>>,
    successors: Mutex<Vec<u64>>,
}

impl Task {
    pub(crate) fn new<F>(id: u64, name: &str, func: F) -> Self
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        Task {
            id,
            name: name.to_owned(),
            func: Mutex::new(Some(Box::new(func))),
            status: Mutex::new(TaskStatus::NotStarted),
            predecessors: Mutex::new(Vec::new()),
            successors: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock().unwrap()
    }

    pub fn predecessors(&self) -> Vec<u64> {
        self.predecessors.lock().unwrap().clone()
    }

    pub fn successors(&self) -> Vec<u64> {
        self.successors.lock().unwrap().clone()
    }

    pub(crate) fn add_predecessor(&self, id: u64) {
        self.predecessors.lock().unwrap().push(id);
    }

    pub(crate) fn add_successor(&self, id: u64) {
        self.successors.lock().unwrap().push(id);
    }

    /// Runs the stored closure. A task executes at most once; re-running
    /// an executed task is a no-op success.
    pub(crate) fn execute(&self) -> Result<(), TaskError> {
        let func = self.func.lock().unwrap().take();
        let Some(func) = func else {
            return Ok(());
        };
        *self.status.lock().unwrap() = TaskStatus::Running;
        let result = func();
        *self.status.lock().unwrap() = match result {
            Ok(()) => TaskStatus::Completed,
            Err(_) => TaskStatus::Failed,
        };
        result
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}
