//! Resource-pool specs and the validation run before a pool is forwarded to
//! the resource manager. The pool tree itself lives in the resource manager;
//! this side only rejects specs that could never be admitted.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Resource kinds a pool may reserve.
pub const RESOURCE_KINDS: [&str; 4] = ["cpu", "memory", "disk", "gpu"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RespoolResource {
    pub kind: String,
    pub reservation: f64,
    pub limit: f64,
    pub share: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RespoolConfig {
    pub name: String,
    /// Slash-separated path of the parent pool, e.g. `/compute/batch`.
    pub parent_path: String,
    pub resources: Vec<RespoolResource>,
    pub description: String,
}

/// Validates a pool spec before it is sent to the resource manager.
pub fn validate_respool_config(config: &RespoolConfig) -> Result<()> {
    if config.name.is_empty() {
        bail!("resource pool name must not be empty");
    }
    if config.name.contains('/') {
        bail!("resource pool name must not contain '/': {}", config.name);
    }
    if !config.parent_path.starts_with('/') {
        bail!(
            "parent path must be absolute, got {:?}",
            config.parent_path
        );
    }
    if config.resources.is_empty() {
        bail!("resource pool must reserve at least one resource kind");
    }

    for resource in &config.resources {
        if !RESOURCE_KINDS.contains(&resource.kind.as_str()) {
            bail!("unknown resource kind {:?}", resource.kind);
        }
        if resource.reservation < 0.0 {
            bail!(
                "resource {} reservation must be non-negative, got {}",
                resource.kind,
                resource.reservation
            );
        }
        // limit below reservation can never be satisfied
        if resource.limit < resource.reservation {
            bail!(
                "resource {} limit {} below reservation {}",
                resource.kind,
                resource.limit,
                resource.reservation
            );
        }
        if resource.share < 0.0 {
            bail!(
                "resource {} share must be non-negative, got {}",
                resource.kind,
                resource.share
            );
        }
    }

    let mut kinds: Vec<&str> = config.resources.iter().map(|r| r.kind.as_str()).collect();
    kinds.sort_unstable();
    kinds.dedup();
    if kinds.len() != config.resources.len() {
        bail!("duplicate resource kinds in pool config");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> RespoolConfig {
        RespoolConfig {
            name: "batch".to_string(),
            parent_path: "/".to_string(),
            resources: vec![
                RespoolResource {
                    kind: "cpu".to_string(),
                    reservation: 10.0,
                    limit: 100.0,
                    share: 1.0,
                },
                RespoolResource {
                    kind: "memory".to_string(),
                    reservation: 1024.0,
                    limit: 8192.0,
                    share: 1.0,
                },
            ],
            description: String::new(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_respool_config(&valid_config()).is_ok());
    }

    #[test]
    fn test_rejections() {
        struct Case {
            description: &'static str,
            mutate: fn(&mut RespoolConfig),
        }
        let cases = vec![
            Case {
                description: "empty name",
                mutate: |c| c.name.clear(),
            },
            Case {
                description: "name with slash",
                mutate: |c| c.name = "a/b".to_string(),
            },
            Case {
                description: "relative parent path",
                mutate: |c| c.parent_path = "compute".to_string(),
            },
            Case {
                description: "no resources",
                mutate: |c| c.resources.clear(),
            },
            Case {
                description: "unknown kind",
                mutate: |c| c.resources[0].kind = "tape".to_string(),
            },
            Case {
                description: "limit below reservation",
                mutate: |c| c.resources[0].limit = 1.0,
            },
            Case {
                description: "duplicate kinds",
                mutate: |c| c.resources[1].kind = "cpu".to_string(),
            },
        ];
        for case in cases {
            let mut config = valid_config();
            (case.mutate)(&mut config);
            assert!(
                validate_respool_config(&config).is_err(),
                "{} should be rejected",
                case.description
            );
        }
    }
}
