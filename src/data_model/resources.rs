use std::collections::HashMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Role every unreserved resource is offered under.
pub const DEFAULT_ROLE: &str = "*";

/// Resource demand declared by a task config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceSpec {
    pub cpu_limit: f64,
    pub mem_limit_mb: f64,
    pub disk_limit_mb: f64,
    pub gpu_limit: f64,
    pub fd_limit: u32,
}

/// Scalar resources available under one role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ScalarResources {
    pub cpus: f64,
    pub mem_mb: f64,
    pub disk_mb: f64,
    pub gpu: f64,
    pub fd: u64,
}

impl ScalarResources {
    // If the demand doesn't fit, returns an error naming the short resource.
    pub fn can_handle(&self, request: &ResourceSpec) -> Result<()> {
        if self.cpus < request.cpu_limit {
            return Err(anyhow!(
                "not enough cpus, {} < {}",
                self.cpus,
                request.cpu_limit
            ));
        }
        if self.mem_mb < request.mem_limit_mb {
            return Err(anyhow!(
                "not enough memory, {} < {}",
                self.mem_mb,
                request.mem_limit_mb
            ));
        }
        if self.disk_mb < request.disk_limit_mb {
            return Err(anyhow!(
                "not enough disk, {} < {}",
                self.disk_mb,
                request.disk_limit_mb
            ));
        }
        if self.gpu < request.gpu_limit {
            return Err(anyhow!(
                "not enough gpus, {} < {}",
                self.gpu,
                request.gpu_limit
            ));
        }
        if self.fd < u64::from(request.fd_limit) {
            return Err(anyhow!(
                "not enough file descriptors, {} < {}",
                self.fd,
                request.fd_limit
            ));
        }
        Ok(())
    }

    /// Subtracts the demand. All checks run before anything is deducted so a
    /// failed consume leaves the scalars untouched; callers rely on this.
    pub fn consume(&mut self, request: &ResourceSpec) -> Result<()> {
        self.can_handle(request)?;

        self.cpus -= request.cpu_limit;
        self.mem_mb -= request.mem_limit_mb;
        self.disk_mb -= request.disk_limit_mb;
        self.gpu -= request.gpu_limit;
        self.fd -= u64::from(request.fd_limit);
        Ok(())
    }

    pub fn free(&mut self, request: &ResourceSpec) {
        self.cpus += request.cpu_limit;
        self.mem_mb += request.mem_limit_mb;
        self.disk_mb += request.disk_limit_mb;
        self.gpu += request.gpu_limit;
        self.fd += u64::from(request.fd_limit);
    }
}

/// Contiguous port range `[begin, end]`, both inclusive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub begin: u32,
    pub end: u32,
}

impl PortRange {
    pub fn len(&self) -> u64 {
        u64::from(self.end.saturating_sub(self.begin)) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.begin
    }
}

/// Resources declared by one host offer: scalars keyed by role plus port
/// ranges. Task demand is satisfied from the unreserved role only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HostResources {
    pub scalars: HashMap<String, ScalarResources>,
    pub ports: Vec<PortRange>,
}

impl HostResources {
    pub fn unreserved(scalars: ScalarResources, ports: Vec<PortRange>) -> Self {
        let mut map = HashMap::new();
        map.insert(DEFAULT_ROLE.to_string(), scalars);
        Self { scalars: map, ports }
    }

    pub fn available_ports(&self) -> u64 {
        self.ports.iter().map(PortRange::len).sum()
    }

    pub fn can_handle(&self, request: &ResourceSpec) -> Result<()> {
        match self.scalars.get(DEFAULT_ROLE) {
            Some(scalars) => scalars.can_handle(request),
            None => Err(anyhow!("no unreserved resources in offer")),
        }
    }

    pub fn consume(&mut self, request: &ResourceSpec) -> Result<()> {
        match self.scalars.get_mut(DEFAULT_ROLE) {
            Some(scalars) => scalars.consume(request),
            None => Err(anyhow!("no unreserved resources in offer")),
        }
    }

    /// Merges another offer's resources in, summing scalars per role and
    /// concatenating port ranges.
    pub fn add(&mut self, other: &HostResources) {
        for (role, scalars) in &other.scalars {
            let entry = self.scalars.entry(role.clone()).or_default();
            entry.cpus += scalars.cpus;
            entry.mem_mb += scalars.mem_mb;
            entry.disk_mb += scalars.disk_mb;
            entry.gpu += scalars.gpu;
            entry.fd += scalars.fd;
        }
        self.ports.extend_from_slice(&other.ports);
    }
}
