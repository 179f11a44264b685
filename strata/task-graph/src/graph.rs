use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::task::{Task, TaskError};
use crate::Error;

/// A directed acyclic graph of [Task]s. The graph is built up front
/// (tasks do not spawn tasks) and checked for cycles at execution time.
#[derive(Default)]
pub struct TaskGraph {
    tasks: Mutex<HashMap<u64, Arc<Task>>>,
    next_id: AtomicU64,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a task and adds it to the graph.
    pub fn emplace<F>(&self, func: F, name: &str) -> Arc<Task>
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(Task::new(id, name, func));
        self.tasks.lock().unwrap().insert(id, Arc::clone(&task));
        task
    }

    pub fn task_num(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub(crate) fn task(&self, id: u64) -> Option<Arc<Task>> {
        self.tasks.lock().unwrap().get(&id).cloned()
    }

    fn check_member(&self, task: &Arc<Task>) -> Result<(), Error> {
        if self.tasks.lock().unwrap().contains_key(&task.id()) {
            Ok(())
        } else {
            Err(Error::UnknownTask(task.id()))
        }
    }

    /// Makes `pred` a predecessor of `task`.
    pub fn succeeds(
        &self,
        task: &Arc<Task>,
        pred: &Arc<Task>,
    ) -> Result<(), Error> {
        self.check_member(task)?;
        self.check_member(pred)?;
        task.add_predecessor(pred.id());
        pred.add_successor(task.id());
        Ok(())
    }

    /// Makes `succ` a successor of `task`.
    pub fn precedes(
        &self,
        task: &Arc<Task>,
        succ: &Arc<Task>,
    ) -> Result<(), Error> {
        self.succeeds(succ, task)
    }

    /// The tasks with no predecessors.
    pub fn roots(&self) -> Vec<Arc<Task>> {
        let tasks = self.tasks.lock().unwrap();
        let mut roots = tasks
            .values()
            .filter(|t| t.predecessors().is_empty())
            .cloned()
            .collect::<Vec<_>>();
        roots.sort_by_key(|t| t.id());
        roots
    }

    /// Cycle detection via iterative topological elimination: the graph
    /// is cyclic iff some task can never reach in-degree zero.
    pub fn is_cyclic(&self) -> bool {
        let tasks = self.tasks.lock().unwrap();
        let mut in_degree = tasks
            .values()
            .map(|t| (t.id(), t.predecessors().len()))
            .collect::<HashMap<_, _>>();

        let mut queue = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect::<VecDeque<_>>();

        let mut eliminated = 0;
        while let Some(id) = queue.pop_front() {
            eliminated += 1;
            let Some(task) = tasks.get(&id) else { continue };
            for succ in task.successors() {
                if let Some(d) = in_degree.get_mut(&succ) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(succ);
                    }
                }
            }
        }

        eliminated != tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emplace_assigns_increasing_ids() {
        let graph = TaskGraph::new();
        let a = graph.emplace(|| Ok(()), "a");
        let b = graph.emplace(|| Ok(()), "b");
        assert_eq!(0, a.id());
        assert_eq!(1, b.id());
        assert_eq!(2, graph.task_num());
    }

    #[test]
    fn edges_and_roots() {
        let graph = TaskGraph::new();
        let a = graph.emplace(|| Ok(()), "a");
        let b = graph.emplace(|| Ok(()), "b");
        let c = graph.emplace(|| Ok(()), "c");
        graph.precedes(&a, &b).unwrap();
        graph.succeeds(&c, &b).unwrap();

        assert_eq!(vec![a.id()], b.predecessors());
        assert_eq!(vec![b.id()], a.successors());
        assert_eq!(vec![b.id()], c.predecessors());

        let roots = graph.roots();
        assert_eq!(vec![a.id()], roots.iter().map(|t| t.id()).collect::<Vec<_>>());
    }

    #[test]
    fn foreign_tasks_are_rejected() {
        let graph = TaskGraph::new();
        let other = TaskGraph::new();
        let a = graph.emplace(|| Ok(()), "a");
        let x = other.emplace(|| Ok(()), "x");
        assert_eq!(
            Err(Error::UnknownTask(x.id())),
            graph.precedes(&a, &x)
        );
    }

    #[test]
    fn cycle_detection() {
        let graph = TaskGraph::new();
        let a = graph.emplace(|| Ok(()), "a");
        let b = graph.emplace(|| Ok(()), "b");
        let c = graph.emplace(|| Ok(()), "c");
        graph.precedes(&a, &b).unwrap();
        graph.precedes(&b, &c).unwrap();
        assert!(!graph.is_cyclic());

        graph.precedes(&c, &a).unwrap();
        assert!(graph.is_cyclic());
    }

    #[test]
    fn empty_graph_is_acyclic() {
        assert!(!TaskGraph::new().is_cyclic());
    }
}
