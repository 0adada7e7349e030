//! Batch first-fit placement. Fills each offer with as many tasks as fit,
//! walking both lists in input order; the first assignment that does not fit
//! ends the offer's round so queue order stays fair.
//!
//! The strategy is pure over its inputs and safe to run concurrently per
//! filter group.

use tracing::debug;

use crate::{
    data_model::{
        resources::{ScalarResources, DEFAULT_ROLE},
        Offer, TaskInfo,
    },
    rpc::LaunchableTask,
};

/// A task awaiting a host.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub task: TaskInfo,
}

impl Assignment {
    pub fn new(task: TaskInfo) -> Self {
        Self { task }
    }
}

/// One offer being filled during a placement round, with running resource
/// and port accounting.
pub struct PlacementHost {
    pub offer: Offer,
    remaining: ScalarResources,
    remaining_ports: Vec<u32>,
    pub selected: Vec<LaunchableTask>,
}

impl PlacementHost {
    pub fn new(offer: Offer) -> Self {
        let remaining = offer
            .resources
            .scalars
            .get(DEFAULT_ROLE)
            .copied()
            .unwrap_or_default();
        let remaining_ports = offer
            .resources
            .ports
            .iter()
            .flat_map(|range| range.begin..=range.end)
            .collect();
        Self {
            offer,
            remaining,
            remaining_ports,
            selected: vec![],
        }
    }

    pub fn has_selection(&self) -> bool {
        !self.selected.is_empty()
    }
}

pub struct BatchStrategy;

impl BatchStrategy {
    pub fn new() -> Self {
        Self
    }

    /// Assigns in sequence as many tasks as possible to the given offer and
    /// returns the tail that did not fit.
    pub fn fill_offer(
        &self,
        host: &mut PlacementHost,
        unassigned: Vec<Assignment>,
    ) -> Vec<Assignment> {
        for (i, assignment) in unassigned.iter().enumerate() {
            let config = &assignment.task.config;

            let ports_demand = config.num_ports as usize;
            if ports_demand > host.remaining_ports.len() {
                debug!(
                    hostname = %host.offer.hostname,
                    available = host.remaining_ports.len(),
                    demand = ports_demand,
                    "insufficient ports"
                );
                return unassigned[i..].to_vec();
            }

            if let Err(reason) = host.remaining.consume(&config.resource) {
                debug!(hostname = %host.offer.hostname, %reason, "insufficient resources");
                return unassigned[i..].to_vec();
            }

            let selected_ports: Vec<u32> =
                host.remaining_ports.drain(..ports_demand).collect();
            host.selected.push(LaunchableTask {
                task: assignment.task.clone(),
                selected_ports,
            });
        }
        vec![]
    }

    /// Runs one pass over every host, in order, consuming from the shared
    /// unassigned queue. Returns the assignments no host could take.
    pub fn place_once(
        &self,
        mut unassigned: Vec<Assignment>,
        hosts: &mut [PlacementHost],
    ) -> Vec<Assignment> {
        for host in hosts.iter_mut() {
            if unassigned.is_empty() {
                break;
            }
            unassigned = self.fill_offer(host, unassigned);
        }
        unassigned
    }
}

impl Default for BatchStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::{
        new_initializing_runtime, test_objects::tests::*, JobId, JobType, TaskConfig,
    };

    fn assignment(job_id: &JobId, instance_id: u32, config: TaskConfig) -> Assignment {
        let job_config = mock_job_config(JobType::Batch, 10);
        Assignment::new(TaskInfo {
            job_id: job_id.clone(),
            instance_id,
            config,
            runtime: new_initializing_runtime(job_id, instance_id, &job_config),
        })
    }

    use crate::data_model::TaskInfo;

    #[test]
    fn test_exact_fit_places_everything() {
        let job_id = mock_job_id("job1");
        let offer = mock_offer("offer1", "host1", 4.0, 4096.0, &[(100, 103)]);
        let mut host = PlacementHost::new(offer);

        let unassigned = vec![
            assignment(&job_id, 0, mock_task_config(2.0, 1024.0, 2)),
            assignment(&job_id, 1, mock_task_config(2.0, 1024.0, 2)),
        ];
        let leftover = BatchStrategy::new().fill_offer(&mut host, unassigned);

        assert!(leftover.is_empty());
        assert_eq!(host.selected.len(), 2);
        assert_eq!(host.selected[0].selected_ports, vec![100, 101]);
        assert_eq!(host.selected[1].selected_ports, vec![102, 103]);
    }

    #[test]
    fn test_port_starvation_returns_tail() {
        let job_id = mock_job_id("job1");
        let offer = mock_offer("offer1", "host1", 8.0, 8192.0, &[(100, 100)]);
        let mut host = PlacementHost::new(offer);

        let unassigned = vec![
            assignment(&job_id, 0, mock_task_config(1.0, 1.0, 1)),
            assignment(&job_id, 1, mock_task_config(1.0, 1.0, 1)),
        ];
        let leftover = BatchStrategy::new().fill_offer(&mut host, unassigned);

        assert_eq!(host.selected.len(), 1);
        assert_eq!(leftover.len(), 1);
        assert_eq!(leftover[0].task.instance_id, 1);
    }

    #[test]
    fn test_placement_never_oversubscribes() {
        let job_id = mock_job_id("job1");
        let offer = mock_offer("offer1", "host1", 4.0, 2048.0, &[(100, 109)]);
        let total_cpus = 4.0;
        let total_mem = 2048.0;
        let total_ports = 10u32;
        let mut host = PlacementHost::new(offer);

        let unassigned: Vec<Assignment> = (0..8)
            .map(|i| assignment(&job_id, i, mock_task_config(1.0, 512.0, 2)))
            .collect();
        let _ = BatchStrategy::new().fill_offer(&mut host, unassigned);

        let used_cpus: f64 = host
            .selected
            .iter()
            .map(|t| t.task.config.resource.cpu_limit)
            .sum();
        let used_mem: f64 = host
            .selected
            .iter()
            .map(|t| t.task.config.resource.mem_limit_mb)
            .sum();
        let used_ports: u32 = host.selected.iter().map(|t| t.task.config.num_ports).sum();

        assert!(used_cpus <= total_cpus);
        assert!(used_mem <= total_mem);
        assert!(used_ports <= total_ports);
        // 4 cpus / 1 cpu per task bounds the batch at 4
        assert_eq!(host.selected.len(), 4);
    }

    #[test]
    fn test_place_once_walks_hosts_in_order() {
        let job_id = mock_job_id("job1");
        let mut hosts = vec![
            PlacementHost::new(mock_offer("offer1", "host1", 2.0, 2048.0, &[])),
            PlacementHost::new(mock_offer("offer2", "host2", 2.0, 2048.0, &[])),
        ];
        let unassigned: Vec<Assignment> = (0..3)
            .map(|i| assignment(&job_id, i, mock_task_config(1.0, 512.0, 0)))
            .collect();

        let leftover = BatchStrategy::new().place_once(unassigned, &mut hosts);

        assert_eq!(hosts[0].selected.len(), 2);
        assert_eq!(hosts[1].selected.len(), 1);
        assert!(leftover.is_empty());
        // first-fit keeps input order: instances 0,1 on the first host
        assert_eq!(hosts[0].selected[0].task.instance_id, 0);
        assert_eq!(hosts[0].selected[1].task.instance_id, 1);
        assert_eq!(hosts[1].selected[0].task.instance_id, 2);
    }

    #[test]
    fn test_leftover_preserves_order() {
        let job_id = mock_job_id("job1");
        let mut hosts = vec![PlacementHost::new(mock_offer(
            "offer1", "host1", 1.0, 1024.0,
            &[],
        ))];
        let unassigned: Vec<Assignment> = (0..4)
            .map(|i| assignment(&job_id, i, mock_task_config(1.0, 256.0, 0)))
            .collect();

        let leftover = BatchStrategy::new().place_once(unassigned, &mut hosts);
        let ids: Vec<u32> = leftover.iter().map(|a| a.task.instance_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
