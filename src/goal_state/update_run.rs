//! One evaluation of a rolling workflow. Invoked by the update goal-state
//! engine; each run classifies in-flight instances, enforces the failure
//! policy, admits the next batch, and ends with a single progress write plus
//! a re-enqueue.

use std::{
    collections::BTreeSet,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use tracing::{info, warn};

use crate::{
    data_model::{
        default_task_goal_state, InstanceId, JobId, TaskRuntime, TaskState, UpdateId, UpdateInfo,
        UpdateState,
    },
    goal_state::driver::GoalStateDriver,
    tracker::RuntimeDiff,
};

/// Partitions the instance space of a config change into the added, updated
/// and removed sets used to seed an update record.
pub fn compute_instance_sets(
    old_instance_count: u32,
    new_instance_count: u32,
) -> (Vec<InstanceId>, Vec<InstanceId>, Vec<InstanceId>) {
    let added: Vec<InstanceId> = (old_instance_count..new_instance_count).collect();
    let updated: Vec<InstanceId> = (0..old_instance_count.min(new_instance_count)).collect();
    let removed: Vec<InstanceId> = (new_instance_count..old_instance_count).collect();
    (added, updated, removed)
}

/// An instance is complete when it reached the target version and settled at
/// its goal. Instances whose goal is itself terminal count as complete once
/// the task is terminal, whatever version they stopped at.
pub fn is_instance_complete(target_config_version: u64, runtime: &TaskRuntime) -> bool {
    match runtime.goal_state {
        TaskState::Deleted => runtime.state.is_terminal(),
        goal if goal.is_terminal() && runtime.state.is_terminal() => true,
        TaskState::Running => {
            runtime.config_version == target_config_version
                && runtime.state == TaskState::Running
                && runtime.healthy == crate::data_model::HealthState::Healthy
        }
        TaskState::Succeeded => {
            runtime.config_version == target_config_version
                && runtime.state == TaskState::Succeeded
        }
        _ => false,
    }
}

/// An instance counts against the update's failure budget once its task has
/// burned through `max_instance_attempts` runs. Zero means unlimited
/// attempts: the instance keeps retrying and never marks the update failed.
pub fn is_instance_failed(runtime: &TaskRuntime, max_instance_attempts: u32) -> bool {
    if max_instance_attempts == 0 {
        return false;
    }
    matches!(runtime.state, TaskState::Failed | TaskState::Lost)
        && runtime.failure_count >= max_instance_attempts
}

enum InstanceKind {
    Added,
    Updated,
    Removed,
}

pub async fn run_update(
    driver: &Arc<GoalStateDriver>,
    update_id: &UpdateId,
    job_id: &JobId,
) -> Result<Option<Duration>> {
    driver.metrics_update_run();

    let tracked = driver.tracker.get_or_create_update(update_id, job_id);
    let Some(mut info) = driver.tracker.update_info(&tracked).await? else {
        driver.tracker.untrack_update(update_id);
        return Ok(None);
    };

    if info.state.is_terminal() {
        driver.tracker.untrack_update(update_id);
        return Ok(None);
    }
    if info.state == UpdateState::Paused {
        return Ok(None);
    }

    // the job must still exist; otherwise the workflow aborts
    let job = driver.tracker.get_or_create_job(job_id);
    let job_config = match driver.tracker.job_config(&job).await {
        Ok(config) => config,
        Err(err) => {
            warn!(update = %update_id, job = %job_id, error = %err, "job gone, aborting update");
            driver
                .update_store
                .write_progress(
                    update_id,
                    UpdateState::Aborted,
                    &info.instances_done,
                    &info.instances_failed,
                    &[],
                )
                .await?;
            driver.tracker.untrack_update(update_id);
            return Ok(None);
        }
    };

    if info.state == UpdateState::Initialized {
        info.state = UpdateState::RollingForward;
    }

    // finalization pass: the previous run recorded every instance done
    if info.instances_done.len() == info.instances_total.len() {
        let final_state = if info.state == UpdateState::RollingBackward {
            UpdateState::Failed
        } else {
            UpdateState::Succeeded
        };
        info!(update = %update_id, job = %job_id, state = %final_state, "update complete");
        driver
            .update_store
            .write_progress(
                update_id,
                final_state,
                &info.instances_done,
                &info.instances_failed,
                &[],
            )
            .await?;
        tracked.invalidate().await;
        driver.tracker.untrack_update(update_id);
        return Ok(None);
    }

    // classify the in-flight instances
    let mut done: BTreeSet<InstanceId> = info.instances_done.iter().copied().collect();
    let mut failed: BTreeSet<InstanceId> = info.instances_failed.iter().copied().collect();
    let mut current: Vec<InstanceId> = vec![];

    for &instance_id in &info.instances_current {
        let runtime = match driver
            .tracker
            .get_or_create_task(job_id, instance_id)
            .await?
            .runtime()
            .await
        {
            Some(runtime) => runtime,
            None => {
                driver
                    .task_store
                    .get_task_runtime(job_id, instance_id)
                    .await?
            }
        };
        if is_instance_complete(info.target_config_version, &runtime) {
            done.insert(instance_id);
        } else if runtime.config_version == info.target_config_version
            && is_instance_failed(&runtime, info.config.max_instance_attempts)
        {
            // only failures at the target version count; after a rollback
            // the instances that failed at the abandoned version retry at
            // the restored one instead of re-tripping the budget
            failed.insert(instance_id);
        } else {
            current.push(instance_id);
        }
    }

    // failure policy
    if info.config.max_failure_instances > 0
        && failed.len() as u32 >= info.config.max_failure_instances
    {
        if info.config.rollback_on_failure && info.state == UpdateState::RollingForward {
            info!(
                update = %update_id,
                job = %job_id,
                failed = failed.len(),
                "failure budget exhausted, rolling back"
            );
            // versions swap exactly once; the guard above keeps a second
            // pass from swapping again
            std::mem::swap(
                &mut info.target_config_version,
                &mut info.source_config_version,
            );
            info.state = UpdateState::RollingBackward;
            info.instances_done.clear();
            info.instances_failed.clear();
            info.instances_current.clear();
            driver.update_store.update_update(&info).await?;
            tracked.set_cached(info).await;
            return Ok(Some(Duration::ZERO));
        }

        info!(update = %update_id, job = %job_id, failed = failed.len(), "update failed");
        let done_list: Vec<InstanceId> = done.into_iter().collect();
        let failed_list: Vec<InstanceId> = failed.into_iter().collect();
        driver
            .update_store
            .write_progress(update_id, UpdateState::Failed, &done_list, &failed_list, &current)
            .await?;
        tracked.invalidate().await;
        driver.tracker.untrack_update(update_id);
        return Ok(None);
    }

    // admit the next instances, lowest id first within each set
    let capacity = if info.config.batch_size == 0 {
        usize::MAX
    } else {
        (info.config.batch_size as usize).saturating_sub(current.len())
    };

    let in_flight: BTreeSet<InstanceId> = current.iter().copied().collect();
    let mut pending: Vec<(InstanceId, InstanceKind)> = vec![];
    for &i in &info.instances_added {
        pending.push((i, InstanceKind::Added));
    }
    for &i in &info.instances_updated {
        pending.push((i, InstanceKind::Updated));
    }
    for &i in &info.instances_removed {
        pending.push((i, InstanceKind::Removed));
    }
    pending.retain(|(i, _)| !done.contains(i) && !failed.contains(i) && !in_flight.contains(i));

    let mut admitted = 0usize;
    for (instance_id, kind) in pending {
        if admitted >= capacity {
            break;
        }
        admit_instance(driver, &info, &job_config, instance_id, &kind).await?;
        current.push(instance_id);
        admitted += 1;
    }

    // single progress write per run
    let done_list: Vec<InstanceId> = done.iter().copied().collect();
    let failed_list: Vec<InstanceId> = failed.iter().copied().collect();
    driver
        .update_store
        .write_progress(update_id, info.state, &done_list, &failed_list, &current)
        .await?;
    info.instances_done = done_list;
    info.instances_failed = failed_list;
    info.instances_current = current;
    let all_done = info.instances_done.len() == info.instances_total.len();
    tracked.set_cached(info).await;

    let delay = if all_done {
        Duration::ZERO
    } else {
        Duration::from_secs(driver.config.update_run_interval_sec)
    };
    Ok(Some(delay))
}

/// Applies the admission write for one instance. Under ROLLING_BACKWARD the
/// roles invert: added instances tear down, removed instances come back.
async fn admit_instance(
    driver: &Arc<GoalStateDriver>,
    info: &UpdateInfo,
    job_config: &crate::data_model::JobConfig,
    instance_id: InstanceId,
    kind: &InstanceKind,
) -> Result<()> {
    let job_id = &info.job_id;
    let rolling_back = info.state == UpdateState::RollingBackward;

    let diff = match kind {
        InstanceKind::Added if !rolling_back => {
            match driver.task_store.get_task_runtime(job_id, instance_id).await {
                Err(err) if err.is_not_found() => {
                    // brand new instance: create it at the target version and
                    // let the start action push it to the resource manager
                    let target_config = driver
                        .job_store
                        .get_job_config(job_id, Some(info.target_config_version))
                        .await?;
                    let mut runtime = crate::data_model::new_initializing_runtime(
                        job_id,
                        instance_id,
                        &target_config,
                    );
                    runtime.config_version = info.target_config_version;
                    runtime.desired_config_version = info.target_config_version;
                    let task_info = crate::data_model::TaskInfo {
                        job_id: job_id.clone(),
                        instance_id,
                        config: target_config.task_config(instance_id).clone(),
                        runtime,
                    };
                    driver
                        .task_store
                        .create_task(job_id, instance_id, &task_info, &target_config.owning_team)
                        .await?;
                    driver.tracker.schedule_task(&task_info.key(), Duration::ZERO);
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
                // a prior attempt already created it; drive it to the target
                Ok(_) => RuntimeDiff {
                    desired_config_version: Some(info.target_config_version),
                    ..Default::default()
                },
            }
        }
        InstanceKind::Added => RuntimeDiff {
            // rolling back an added instance deletes it again
            goal_state: Some(TaskState::Deleted),
            desired_config_version: Some(info.target_config_version),
            ..Default::default()
        },
        InstanceKind::Updated => RuntimeDiff {
            desired_config_version: Some(info.target_config_version),
            ..Default::default()
        },
        InstanceKind::Removed if !rolling_back => RuntimeDiff {
            goal_state: Some(TaskState::Deleted),
            desired_config_version: Some(info.target_config_version),
            ..Default::default()
        },
        InstanceKind::Removed => RuntimeDiff {
            // rolling back a removal restores the instance
            goal_state: Some(default_task_goal_state(job_config.job_type)),
            desired_config_version: Some(info.target_config_version),
            ..Default::default()
        },
    };

    driver
        .tracker
        .patch_tasks(job_id, [(instance_id, diff)].into_iter().collect())
        .await
}
