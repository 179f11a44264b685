use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam_channel::Sender;

use crate::task::{Task, TaskError};
use crate::{Error, TaskGraph};

type Job = Box<dyn FnOnce() + Send>;

/// A fixed set of workers draining one job mailbox. Dropping the pool
/// closes the mailbox and joins the workers.
pub struct ThreadPool {
    sender: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(thread_num: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let workers = (0..thread_num.max(1))
            .map(|_| {
                let receiver = receiver.clone();
                thread::spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
            })
            .collect();
        ThreadPool {
            sender: Some(sender),
            workers,
        }
    }

    fn sender(&self) -> &Sender<Job> {
        // present from construction until drop
        self.sender.as_ref().unwrap()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

struct ExecInner {
    /// Completed-predecessor count per task id.
    predecessors_done: HashMap<u64, usize>,
    /// Tasks submitted to the pool and not yet finished.
    active: usize,
    completed: usize,
    error: Option<(String, TaskError)>,
}

struct ExecState {
    graph: Arc<TaskGraph>,
    inner: Mutex<ExecInner>,
    cv: Condvar,
}

/// Runs a [TaskGraph] on a [ThreadPool].
///
/// A task is admitted once its completed-predecessor count reaches its
/// in-degree. After a failure no further tasks are admitted; already
/// running tasks drain, and the first failure is returned.
pub struct TaskGraphExecutor {
    pool: ThreadPool,
}

impl TaskGraphExecutor {
    pub fn new(thread_num: usize) -> Self {
        TaskGraphExecutor {
            pool: ThreadPool::new(thread_num),
        }
    }

    /// Executes the whole graph and blocks until it settles.
    pub fn execute(&self, graph: Arc<TaskGraph>) -> Result<(), Error> {
        if graph.is_cyclic() {
            return Err(Error::CyclicGraph);
        }

        let total = graph.task_num();
        if total == 0 {
            return Ok(());
        }

        let state = Arc::new(ExecState {
            graph: Arc::clone(&graph),
            inner: Mutex::new(ExecInner {
                predecessors_done: HashMap::new(),
                active: 0,
                completed: 0,
                error: None,
            }),
            cv: Condvar::new(),
        });

        let roots = graph.roots();
        {
            let mut inner = state.inner.lock().unwrap();
            inner.active = roots.len();
        }
        for root in roots {
            spawn_task(
                Arc::clone(&state),
                self.pool.sender().clone(),
                root,
            );
        }

        // Settled when nothing is in flight and either everything
        // completed or a failure stopped admissions.
        let mut inner = state.inner.lock().unwrap();
        while inner.active != 0
            || (inner.error.is_none() && inner.completed != total)
        {
            inner = state.cv.wait(inner).unwrap();
        }

        match inner.error.take() {
            None => Ok(()),
            Some((name, source)) => Err(Error::TaskFailed { name, source }),
        }
    }
}

/// Submits one task to the pool; on completion, newly-ready successors
/// are submitted from the worker itself.
fn spawn_task(state: Arc<ExecState>, sender: Sender<Job>, task: Arc<Task>) {
    let job_sender = sender.clone();
    let job: Job = Box::new(move || {
        let result = task.execute();

        let ready = {
            let mut inner = state.inner.lock().unwrap();
            inner.active -= 1;
            let mut ready = Vec::new();
            match result {
                Ok(()) => {
                    inner.completed += 1;
                    for succ_id in task.successors() {
                        let done = inner
                            .predecessors_done
                            .entry(succ_id)
                            .or_insert(0);
                        *done += 1;
                        let done = *done;
                        let Some(succ) = state.graph.task(succ_id)
                        else {
                            continue;
                        };
                        if done == succ.predecessors().len()
                            && inner.error.is_none()
                        {
                            inner.active += 1;
                            ready.push(succ);
                        }
                    }
                }
                Err(e) => {
                    if inner.error.is_none() {
                        inner.error = Some((task.name().to_owned(), e));
                    }
                }
            }
            state.cv.notify_all();
            ready
        };

        for succ in ready {
            spawn_task(Arc::clone(&state), job_sender.clone(), succ);
        }
    });
    let _ = sender.send(job);
}
