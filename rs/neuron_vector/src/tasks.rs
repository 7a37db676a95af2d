use crate::guard::{BillingLogicGuard, TimerLogicGuard};
use crate::logs::Priority;
use crate::state::read_state;
use crate::CanisterRuntime;
use canlog::log;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

pub const BILLING_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10 * 60);

thread_local! {
    pub static TASKS: RefCell<TaskQueue> = RefCell::default();
}

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum TaskType {
    /// Run a synchronization cycle for every due node.
    ProcessNodes,
    /// Charge each active node its accrued operating cost.
    CollectBilling,
    /// Expire temporary nodes and forget old request ids.
    Maintenance,
}

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct Task {
    pub execute_at: u64,
    pub task_type: TaskType,
}

/// A queue of deduplicated tasks ordered by execution deadline. At most one
/// instance of each task type is scheduled; a later request with an earlier
/// deadline replaces the scheduled one.
#[derive(Default)]
pub struct TaskQueue {
    queue: BTreeSet<Task>,
    pub deadline_by_task: BTreeMap<TaskType, u64>,
}

impl TaskQueue {
    /// Schedules the given task at the specified time. Returns the new
    /// earliest deadline in the queue.
    pub fn schedule_at(&mut self, execute_at: u64, task_type: TaskType) -> u64 {
        let old_deadline = self
            .deadline_by_task
            .get(&task_type)
            .copied()
            .unwrap_or(u64::MAX);

        if execute_at <= old_deadline {
            self.queue.remove(&Task {
                execute_at: old_deadline,
                task_type: task_type.clone(),
            });
            self.deadline_by_task.insert(task_type.clone(), execute_at);
            self.queue.insert(Task {
                execute_at,
                task_type,
            });
        }

        self.next_deadline()
            .expect("BUG: schedule_at must leave the queue non-empty")
    }

    /// Removes the first task if its deadline is in the past.
    pub fn pop_if_ready(&mut self, now: u64) -> Option<Task> {
        if self.queue.first()?.execute_at <= now {
            let task = self
                .queue
                .pop_first()
                .expect("BUG: first() returned Some on an empty queue");
            self.deadline_by_task.remove(&task.task_type);
            return Some(task);
        }
        None
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.first().map(|task| task.execute_at)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Arms the recurring tasks. Called once on init and again after every
/// upgrade, since the task queue lives on the heap.
pub fn setup_tasks<R: CanisterRuntime>(runtime: &R) {
    schedule_now(TaskType::ProcessNodes, runtime);
    schedule_after(BILLING_INTERVAL, TaskType::CollectBilling, runtime);
    schedule_after(MAINTENANCE_INTERVAL, TaskType::Maintenance, runtime);
}

pub fn schedule_now<R: CanisterRuntime>(task_type: TaskType, runtime: &R) {
    schedule_after(Duration::ZERO, task_type, runtime)
}

pub fn schedule_after<R: CanisterRuntime>(delay: Duration, task_type: TaskType, runtime: &R) {
    let now = runtime.time();
    let execute_at = now.saturating_add(delay.as_nanos() as u64);
    let deadline = TASKS.with(|t| t.borrow_mut().schedule_at(execute_at, task_type));
    runtime.global_timer_set(deadline);
}

/// Pops the first task whose deadline passed and re-arms the global timer
/// for whatever remains scheduled.
pub fn pop_if_ready<R: CanisterRuntime>(runtime: &R) -> Option<Task> {
    let now = runtime.time();
    let task = TASKS.with(|t| t.borrow_mut().pop_if_ready(now))?;
    if let Some(deadline) = TASKS.with(|t| t.borrow().next_deadline()) {
        runtime.global_timer_set(deadline);
    }
    Some(task)
}

pub async fn run_task<R: CanisterRuntime>(task: Task, runtime: R) {
    match task.task_type {
        TaskType::ProcessNodes => {
            let interval = read_state(|s| s.config.process_interval_seconds);
            schedule_after(
                Duration::from_secs(interval),
                TaskType::ProcessNodes,
                &runtime,
            );
            let _guard = match TimerLogicGuard::new() {
                Some(guard) => guard,
                None => {
                    log!(Priority::Debug, "Node processing already in progress");
                    return;
                }
            };
            crate::sync::process_due_nodes(&runtime).await;
        }
        TaskType::CollectBilling => {
            schedule_after(BILLING_INTERVAL, TaskType::CollectBilling, &runtime);
            let _guard = match BillingLogicGuard::new() {
                Some(guard) => guard,
                None => {
                    log!(Priority::Debug, "Billing run already in progress");
                    return;
                }
            };
            crate::billing::charge_nodes(&runtime).await;
        }
        TaskType::Maintenance => {
            schedule_after(MAINTENANCE_INTERVAL, TaskType::Maintenance, &runtime);
            crate::commands::run_maintenance(runtime.id(), runtime.time());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{init_state, mock::MockCanisterRuntime};

    #[test]
    fn schedule_deduplicates_task_types() {
        let mut queue = TaskQueue::default();
        queue.schedule_at(10, TaskType::ProcessNodes);
        queue.schedule_at(20, TaskType::ProcessNodes);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(10));
    }

    #[test]
    fn earlier_deadline_replaces_later_one() {
        let mut queue = TaskQueue::default();
        queue.schedule_at(20, TaskType::ProcessNodes);
        let deadline = queue.schedule_at(10, TaskType::ProcessNodes);
        assert_eq!(deadline, 10);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_if_ready(15).map(|t| t.execute_at), Some(10));
        assert_eq!(queue.pop_if_ready(15), None);
    }

    #[test]
    fn pop_respects_deadlines() {
        let mut queue = TaskQueue::default();
        queue.schedule_at(10, TaskType::ProcessNodes);
        queue.schedule_at(5, TaskType::CollectBilling);
        assert_eq!(queue.pop_if_ready(4), None);
        assert_eq!(
            queue.pop_if_ready(7).map(|t| t.task_type),
            Some(TaskType::CollectBilling)
        );
        assert_eq!(queue.pop_if_ready(7), None);
        assert_eq!(
            queue.pop_if_ready(10).map(|t| t.task_type),
            Some(TaskType::ProcessNodes)
        );
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn should_reschedule_process_nodes_when_guard_is_held() {
        init_state();
        let mut runtime = MockCanisterRuntime::new();
        runtime.expect_time().return_const(0_u64);
        runtime.expect_global_timer_set().return_const(());
        schedule_now(TaskType::ProcessNodes, &runtime);

        let _guard_mocking_already_running_task = crate::guard::TimerLogicGuard::new().unwrap();
        let task = pop_if_ready(&runtime).unwrap();
        assert_eq!(
            task,
            Task {
                execute_at: 0,
                task_type: TaskType::ProcessNodes,
            }
        );
        assert_eq!(task_deadline_from_state(&TaskType::ProcessNodes), None);

        run_task(task, runtime).await;

        let interval = read_state(|s| s.config.process_interval_seconds);
        assert_eq!(
            task_deadline_from_state(&TaskType::ProcessNodes),
            Some(Duration::from_secs(interval).as_nanos() as u64)
        );
    }

    #[tokio::test]
    async fn should_reschedule_billing_when_guard_is_held() {
        init_state();
        let mut runtime = MockCanisterRuntime::new();
        runtime.expect_time().return_const(0_u64);
        runtime.expect_global_timer_set().return_const(());
        schedule_now(TaskType::CollectBilling, &runtime);

        let _guard_mocking_already_running_task = crate::guard::BillingLogicGuard::new().unwrap();
        let task = pop_if_ready(&runtime).unwrap();
        run_task(task, runtime).await;

        assert_eq!(
            task_deadline_from_state(&TaskType::CollectBilling),
            Some(BILLING_INTERVAL.as_nanos() as u64)
        );
    }

    fn task_deadline_from_state(task: &TaskType) -> Option<u64> {
        TASKS.with(|t| t.borrow().deadline_by_task.get(task).cloned())
    }
}
