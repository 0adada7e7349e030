#[cfg(test)]
pub mod tests {
    use crate::data_model::{
        resources::{HostResources, PortRange, ResourceSpec, ScalarResources},
        JobConfig, JobId, JobType, Offer, OfferId, Revision, SlaConfig, TaskConfig,
    };

    pub const TEST_TEAM: &str = "infra-compute";

    pub fn mock_task_config(cpus: f64, mem_mb: f64, num_ports: u32) -> TaskConfig {
        TaskConfig {
            name: "task".to_string(),
            resource: ResourceSpec {
                cpu_limit: cpus,
                mem_limit_mb: mem_mb,
                disk_limit_mb: 10.0,
                gpu_limit: 0.0,
                fd_limit: 10,
            },
            command: vec!["/bin/echo".to_string(), "hello".to_string()],
            num_ports,
            ..Default::default()
        }
    }

    pub fn mock_job_config(job_type: JobType, instance_count: u32) -> JobConfig {
        JobConfig {
            name: "test-job".to_string(),
            owning_team: TEST_TEAM.to_string(),
            job_type,
            instance_count,
            sla: SlaConfig {
                priority: 1,
                preemptible: true,
            },
            default_config: mock_task_config(1.0, 128.0, 0),
            change_log: Revision::new(1),
            ..Default::default()
        }
    }

    pub fn mock_offer(id: &str, hostname: &str, cpus: f64, mem_mb: f64, ports: &[(u32, u32)]) -> Offer {
        Offer {
            id: OfferId::from(id),
            hostname: hostname.to_string(),
            agent_id: format!("agent-{hostname}"),
            resources: HostResources::unreserved(
                ScalarResources {
                    cpus,
                    mem_mb,
                    disk_mb: 100_000.0,
                    gpu: 0.0,
                    fd: 100_000,
                },
                ports
                    .iter()
                    .map(|&(begin, end)| PortRange { begin, end })
                    .collect(),
            ),
            attributes: vec![],
        }
    }

    pub fn mock_job_id(name: &str) -> JobId {
        JobId::from(name)
    }
}
