//! The table mapping observed task state to the next action. Kept as a pure
//! function of the runtime snapshot plus timing signals so every row is
//! testable in isolation; the side-effecting action bodies live on the
//! goal-state driver.

use strum::Display;

use crate::data_model::{TaskRuntime, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum TaskAction {
    NoAction,
    Killed,
    Start,
    Stop,
    Preempt,
    Initialize,
    ReloadRuntime,
    Fail,
    LaunchRetry,
    NotifyLaunchedTasks,
    FailRetry,
}

/// Timing and bookkeeping signals that feed the decision alongside the
/// runtime itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskSignals {
    /// The task has sat in LAUNCHED longer than the launch timeout.
    pub launch_timed_out: bool,
    /// The resource manager was already told about this launch.
    pub launch_notified: bool,
    /// Retries allowed before a failed task stays failed.
    pub failure_retry_limit: u32,
}

/// Next action for a task given its cached runtime. Callers resolve a `None`
/// cached runtime to [`TaskAction::ReloadRuntime`] before calling this.
pub fn suggest_task_action(runtime: &TaskRuntime, signals: &TaskSignals) -> TaskAction {
    let state = runtime.state;
    let goal = runtime.goal_state;

    // settled terminal states first
    if state == TaskState::Killed && goal == TaskState::Killed {
        return TaskAction::Killed;
    }
    if state.is_terminal() && (state == goal || goal == TaskState::Deleted) {
        return TaskAction::NoAction;
    }

    if state == TaskState::Preempting {
        // the preemption policy read happens inside the action
        return TaskAction::Preempt;
    }

    if matches!(goal, TaskState::Killed | TaskState::Deleted) && !state.is_terminal() {
        return TaskAction::Stop;
    }

    if runtime.needs_config_update() && !state.is_terminal() {
        return TaskAction::Initialize;
    }

    match state {
        TaskState::Initialized
            if matches!(goal, TaskState::Running | TaskState::Succeeded) =>
        {
            TaskAction::Start
        }
        TaskState::Pending => TaskAction::NoAction,
        TaskState::Launched if !signals.launch_notified => TaskAction::NotifyLaunchedTasks,
        TaskState::Launched if signals.launch_timed_out => TaskAction::LaunchRetry,
        TaskState::Launched => TaskAction::NoAction,
        // a killed run whose goal is still up restarts the same way a
        // failed one does; kills never count against the retry budget
        TaskState::Failed | TaskState::Lost | TaskState::Killed
            if matches!(goal, TaskState::Running | TaskState::Succeeded) =>
        {
            if state == TaskState::Killed
                || runtime.failure_count < signals.failure_retry_limit
            {
                TaskAction::FailRetry
            } else {
                TaskAction::Fail
            }
        }
        _ => TaskAction::NoAction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::{JobId, MesosTaskId};

    fn runtime(state: TaskState, goal: TaskState) -> TaskRuntime {
        TaskRuntime {
            state,
            goal_state: goal,
            mesos_task_id: Some(MesosTaskId::new(&JobId::from("job1"), 0, 1)),
            config_version: 1,
            desired_config_version: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_decision_table() {
        struct Case {
            description: &'static str,
            runtime: TaskRuntime,
            signals: TaskSignals,
            expected: TaskAction,
        }
        let retry = TaskSignals {
            failure_retry_limit: 3,
            launch_notified: true,
            ..Default::default()
        };
        let cases = vec![
            Case {
                description: "initialized toward running starts",
                runtime: runtime(TaskState::Initialized, TaskState::Running),
                signals: retry,
                expected: TaskAction::Start,
            },
            Case {
                description: "initialized toward succeeded starts",
                runtime: runtime(TaskState::Initialized, TaskState::Succeeded),
                signals: retry,
                expected: TaskAction::Start,
            },
            Case {
                description: "launched past timeout retries the launch",
                runtime: runtime(TaskState::Launched, TaskState::Running),
                signals: TaskSignals {
                    launch_timed_out: true,
                    launch_notified: true,
                    failure_retry_limit: 3,
                },
                expected: TaskAction::LaunchRetry,
            },
            Case {
                description: "launched within timeout waits",
                runtime: runtime(TaskState::Launched, TaskState::Running),
                signals: retry,
                expected: TaskAction::NoAction,
            },
            Case {
                description: "unnotified launch tells the resource manager",
                runtime: runtime(TaskState::Launched, TaskState::Running),
                signals: TaskSignals {
                    failure_retry_limit: 3,
                    ..Default::default()
                },
                expected: TaskAction::NotifyLaunchedTasks,
            },
            Case {
                description: "running with kill goal stops",
                runtime: runtime(TaskState::Running, TaskState::Killed),
                signals: retry,
                expected: TaskAction::Stop,
            },
            Case {
                description: "failed below retry limit retries",
                runtime: runtime(TaskState::Failed, TaskState::Running),
                signals: retry,
                expected: TaskAction::FailRetry,
            },
            Case {
                description: "failed at retry limit stays failed",
                runtime: {
                    let mut r = runtime(TaskState::Failed, TaskState::Running);
                    r.failure_count = 3;
                    r
                },
                signals: retry,
                expected: TaskAction::Fail,
            },
            Case {
                description: "lost task retries like failed",
                runtime: runtime(TaskState::Lost, TaskState::Succeeded),
                signals: retry,
                expected: TaskAction::FailRetry,
            },
            Case {
                description: "killed task with a live goal restarts",
                runtime: runtime(TaskState::Killed, TaskState::Running),
                signals: retry,
                expected: TaskAction::FailRetry,
            },
            Case {
                description: "kills never exhaust the retry budget",
                runtime: {
                    let mut r = runtime(TaskState::Killed, TaskState::Running);
                    r.failure_count = 99;
                    r
                },
                signals: retry,
                expected: TaskAction::FailRetry,
            },
            Case {
                description: "terminal at matching goal settles",
                runtime: runtime(TaskState::Succeeded, TaskState::Succeeded),
                signals: retry,
                expected: TaskAction::NoAction,
            },
            Case {
                description: "killed at kill goal clears attempts",
                runtime: runtime(TaskState::Killed, TaskState::Killed),
                signals: retry,
                expected: TaskAction::Killed,
            },
            Case {
                description: "removed instance done once terminal",
                runtime: runtime(TaskState::Killed, TaskState::Deleted),
                signals: retry,
                expected: TaskAction::NoAction,
            },
            Case {
                description: "config mismatch re-initializes",
                runtime: {
                    let mut r = runtime(TaskState::Running, TaskState::Running);
                    r.desired_config_version = 2;
                    r
                },
                signals: retry,
                expected: TaskAction::Initialize,
            },
            Case {
                description: "kill goal beats config mismatch",
                runtime: {
                    let mut r = runtime(TaskState::Running, TaskState::Killed);
                    r.desired_config_version = 2;
                    r
                },
                signals: retry,
                expected: TaskAction::Stop,
            },
            Case {
                description: "preempting defers to the preemption policy",
                runtime: runtime(TaskState::Preempting, TaskState::Running),
                signals: retry,
                expected: TaskAction::Preempt,
            },
            Case {
                description: "pending waits on the resource manager",
                runtime: runtime(TaskState::Pending, TaskState::Succeeded),
                signals: retry,
                expected: TaskAction::NoAction,
            },
            Case {
                description: "running toward succeeded waits",
                runtime: runtime(TaskState::Running, TaskState::Succeeded),
                signals: retry,
                expected: TaskAction::NoAction,
            },
        ];

        for case in cases {
            assert_eq!(
                suggest_task_action(&case.runtime, &case.signals),
                case.expected,
                "{}",
                case.description
            );
        }
    }
}
