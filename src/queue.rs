use std::collections::VecDeque;

use tokio::sync::Mutex;

use crate::package::Testcase;

/// One unit of work: a solution on one testcase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationJob {
    /// Index of the solution in the package
    pub solution: usize,
    /// Index of the group in the package
    pub group: usize,
    pub group_name: String,
    /// Index of the testcase within its group
    pub index: usize,
    pub testcase: Testcase,
}

impl EvaluationJob {
    /// Declared order of the job in the run report
    pub fn order_key(&self) -> (usize, usize, usize) {
        (self.solution, self.group, self.index)
    }
}

pub struct JobQueue {
    queue: Mutex<VecDeque<EvaluationJob>>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn push(&self, job: EvaluationJob) {
        self.queue.lock().await.push_back(job);
    }

    /// Next job in declared order, or `None` once everything was handed out
    pub async fn pop(&self) -> Option<EvaluationJob> {
        self.queue.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Drops every queued job; returns how many were discarded
    pub async fn clear(&self) -> usize {
        let mut queue = self.queue.lock().await;
        let discarded = queue.len();
        queue.clear();
        discarded
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn job(solution: usize, index: usize) -> EvaluationJob {
        EvaluationJob {
            solution,
            group: 0,
            group_name: "samples".to_string(),
            index,
            testcase: Testcase {
                input_path: PathBuf::from(format!("{index}.in")),
                output_path: None,
            },
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = JobQueue::new();
        queue.push(job(0, 0)).await;
        queue.push(job(0, 1)).await;
        queue.push(job(1, 0)).await;
        assert_eq!(queue.len().await, 3);

        assert_eq!(queue.pop().await.map(|j| j.order_key()), Some((0, 0, 0)));
        assert_eq!(queue.pop().await.map(|j| j.order_key()), Some((0, 0, 1)));
        assert_eq!(queue.pop().await.map(|j| j.order_key()), Some((1, 0, 0)));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_clear() {
        let queue = JobQueue::new();
        queue.push(job(0, 0)).await;
        queue.push(job(0, 1)).await;
        assert_eq!(queue.clear().await, 2);
        assert_eq!(queue.pop().await, None);
    }
}
