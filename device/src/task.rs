//! Task DAG on top of the rayon worker pool.
//!
//! The CPU backend models a device queue as a chain of tasks: every
//! asynchronous host operation is a task that depends on zero or more earlier
//! tasks and consists of `blocks` independent work items. A task is handed to
//! the pool once all of its dependencies have completed; work items never
//! block inside the pool, so the DAG cannot deadlock regardless of pool size.
//!
//! Reference counting is `Arc` semantics: cloning a `Task` retains it,
//! dropping releases it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

type TaskFn = Box<dyn Fn(u32) + Send + Sync>;

struct TaskState {
    done: bool,
    /// Tasks waiting on this one. Registered only while `done == false`.
    dependents: Vec<Arc<TaskInner>>,
}

struct TaskInner {
    func: Option<TaskFn>,
    blocks: u32,
    /// Incomplete dependencies plus one submission sentinel.
    remaining_deps: AtomicU32,
    /// Work items still running once the task has been scheduled.
    remaining_blocks: AtomicU32,
    state: Mutex<TaskState>,
    cv: Condvar,
}

/// Handle to a submitted task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("blocks", &self.inner.blocks)
            .field("done", &self.inner.state.lock().done)
            .finish()
    }
}

impl Task {
    /// Submit a task with dependencies.
    ///
    /// `func` is invoked once per block index in `0..blocks`, potentially
    /// concurrently. `blocks == 0` turns the task into a pure barrier that
    /// completes as soon as its dependencies do.
    pub fn submit<F>(deps: &[&Task], blocks: u32, func: F) -> Task
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        Self::submit_impl(deps, blocks, Some(Box::new(func)))
    }

    /// Submit a barrier that completes once all dependencies have completed.
    pub fn barrier(deps: &[&Task]) -> Task {
        Self::submit_impl(deps, 0, None)
    }

    fn submit_impl(deps: &[&Task], blocks: u32, func: Option<TaskFn>) -> Task {
        let inner = Arc::new(TaskInner {
            func,
            blocks,
            // The sentinel keeps the task from firing while dependencies are
            // still being registered.
            remaining_deps: AtomicU32::new(1),
            remaining_blocks: AtomicU32::new(blocks),
            state: Mutex::new(TaskState { done: false, dependents: Vec::new() }),
            cv: Condvar::new(),
        });

        for dep in deps {
            let mut state = dep.inner.state.lock();
            if !state.done {
                inner.remaining_deps.fetch_add(1, Ordering::AcqRel);
                state.dependents.push(Arc::clone(&inner));
            }
        }

        dep_resolved(&inner);
        Task { inner }
    }

    /// Block the calling thread until the task has completed.
    ///
    /// Must not be called from inside a pool worker.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while !state.done {
            self.inner.cv.wait(&mut state);
        }
    }

    /// Non-blocking completion check.
    pub fn completed(&self) -> bool {
        self.inner.state.lock().done
    }
}

fn dep_resolved(inner: &Arc<TaskInner>) {
    if inner.remaining_deps.fetch_sub(1, Ordering::AcqRel) == 1 {
        schedule(inner);
    }
}

fn schedule(inner: &Arc<TaskInner>) {
    if inner.blocks == 0 || inner.func.is_none() {
        complete(inner);
        return;
    }

    for block in 0..inner.blocks {
        let task = Arc::clone(inner);
        rayon::spawn(move || {
            if let Some(func) = &task.func {
                func(block);
            }
            if task.remaining_blocks.fetch_sub(1, Ordering::AcqRel) == 1 {
                complete(&task);
            }
        });
    }
}

fn complete(inner: &Arc<TaskInner>) {
    let dependents = {
        let mut state = inner.state.lock();
        state.done = true;
        inner.cv.notify_all();
        std::mem::take(&mut state.dependents)
    };
    for dep in dependents {
        dep_resolved(&dep);
    }
}

/// Number of workers in the pool.
pub fn pool_size() -> u32 {
    rayon::current_num_threads() as u32
}

/// Raw pointer wrapper that may cross thread boundaries.
///
/// The task scheduler guarantees exclusive or read-only access for the
/// lifetime of the submitted closure; the wrapper only exists to satisfy the
/// `Send`/`Sync` bounds on task closures.
#[derive(Clone, Copy)]
pub struct SendPtr<T>(pub *mut T);

unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

impl<T> SendPtr<T> {
    #[inline]
    pub fn get(self) -> *mut T {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn single_task_runs_all_blocks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let task = Task::submit(&[], 16, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        task.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn dependencies_order_execution() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let l1 = Arc::clone(&log);
        let first = Task::submit(&[], 4, move |_| l1.lock().push(1u32));

        let l2 = Arc::clone(&log);
        let second = Task::submit(&[&first], 1, move |_| l2.lock().push(2u32));

        second.wait();
        let log = log.lock();
        assert_eq!(log.len(), 5);
        assert_eq!(log[4], 2);
    }

    #[test]
    fn barrier_joins_multiple_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Task> = (0..4)
            .map(|_| {
                let c = Arc::clone(&counter);
                Task::submit(&[], 2, move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        let refs: Vec<&Task> = tasks.iter().collect();
        let barrier = Task::barrier(&refs);
        barrier.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn completed_dependency_does_not_stall() {
        let first = Task::submit(&[], 1, |_| {});
        first.wait();

        let flag = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&flag);
        let second = Task::submit(&[&first], 1, move |_| {
            f.store(7, Ordering::SeqCst);
        });
        second.wait();
        assert_eq!(flag.load(Ordering::SeqCst), 7);
    }
}
