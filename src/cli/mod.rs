//! Command-line surface. `serve` runs the manager; everything else talks to
//! a running manager over its HTTP API. Exit codes: 0 success, 1 transport
//! failure, 2 validation failure.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;

use crate::{
    api_objects::{
        CreateJobRequest, CreateJobResponse, CreateRespoolResponse, InstancesRequest, JobResponse,
        QueryJobsRequest, QueryJobsResponse, TasksResponse,
    },
    cli::client::{ApiClient, CliError, FailureKind},
    data_model::{JobConfig, Label},
    respool::RespoolConfig,
};

pub mod client;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_TRANSPORT: i32 = 1;
pub const EXIT_VALIDATION: i32 = 2;

#[derive(Parser)]
#[command(name = "peloton", version, about = "Cluster workload orchestrator")]
pub struct Cli {
    /// Manager endpoint for client subcommands.
    #[arg(long, global = true, default_value = "http://127.0.0.1:5292")]
    pub address: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the job manager.
    Serve {
        /// YAML config file; defaults apply when omitted.
        #[arg(short, long, value_name = "config file")]
        config: Option<PathBuf>,
    },
    /// Job operations.
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },
    /// Task operations.
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Resource pool operations.
    Respool {
        #[command(subcommand)]
        command: RespoolCommand,
    },
}

#[derive(Subcommand)]
pub enum JobCommand {
    /// Submit a job from a YAML spec.
    Create {
        /// Path to the job config YAML.
        #[arg(short, long)]
        spec: PathBuf,
        /// Explicit job id; generated when omitted.
        #[arg(long)]
        id: Option<String>,
    },
    /// Show a job's config and runtime.
    Get { job_id: String },
    /// List jobs matching all given labels (key=value).
    Query {
        #[arg(short, long)]
        label: Vec<String>,
    },
    /// Delete a terminal job.
    Delete { job_id: String },
}

#[derive(Args)]
pub struct InstanceSelection {
    /// Comma-separated instance ids; all instances when omitted.
    #[arg(long, value_delimiter = ',')]
    pub instances: Option<Vec<u32>>,
}

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Show one task.
    Get { job_id: String, instance_id: u32 },
    /// List a job's tasks.
    List {
        job_id: String,
        #[arg(long, default_value_t = 0)]
        from: u32,
        #[arg(long)]
        to: Option<u32>,
    },
    /// Start tasks that were stopped.
    Start {
        job_id: String,
        #[command(flatten)]
        selection: InstanceSelection,
    },
    /// Stop tasks.
    Stop {
        job_id: String,
        #[command(flatten)]
        selection: InstanceSelection,
    },
    /// Restart tasks.
    Restart {
        job_id: String,
        #[command(flatten)]
        selection: InstanceSelection,
    },
}

#[derive(Subcommand)]
pub enum RespoolCommand {
    /// Create a resource pool from a YAML spec.
    Create {
        #[arg(short, long)]
        spec: PathBuf,
    },
}

fn parse_labels(raw: &[String]) -> Result<Vec<Label>, CliError> {
    raw.iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => Ok(Label {
                key: key.to_string(),
                value: value.to_string(),
            }),
            None => Err(CliError {
                kind: FailureKind::Validation,
                message: format!("label {pair:?} is not key=value"),
            }),
        })
        .collect()
}

fn load_yaml_spec<T: DeserializeOwned>(path: &PathBuf) -> Result<T, CliError> {
    use figment::providers::Format as _;

    let raw = std::fs::read_to_string(path).map_err(|err| CliError {
        kind: FailureKind::Validation,
        message: format!("reading {}: {err}", path.display()),
    })?;
    figment::Figment::from(figment::providers::Yaml::string(&raw))
        .extract()
        .map_err(|err| CliError {
            kind: FailureKind::Validation,
            message: format!("parsing {}: {err}", path.display()),
        })
}

/// Runs a client subcommand and returns the process exit code.
pub async fn run_client_command(address: &str, command: Command) -> i32 {
    let client = match ApiClient::new(address) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("error: {err}");
            return EXIT_TRANSPORT;
        }
    };

    let result = dispatch(&client, command).await;
    match result {
        Ok(output) => {
            println!("{output}");
            EXIT_SUCCESS
        }
        Err(err) => {
            eprintln!("error: {}", err.message);
            match err.kind {
                FailureKind::Transport => EXIT_TRANSPORT,
                FailureKind::Validation => EXIT_VALIDATION,
            }
        }
    }
}

async fn dispatch(client: &ApiClient, command: Command) -> Result<String, CliError> {
    match command {
        Command::Serve { .. } => unreachable!("serve is handled by main"),
        Command::Job { command } => match command {
            JobCommand::Create { spec, id } => {
                let config: JobConfig = load_yaml_spec(&spec)?;
                let response: CreateJobResponse = client
                    .post("/v1/jobs", &CreateJobRequest { job_id: id, config })
                    .await?;
                Ok(format!("created job {}", response.job_id))
            }
            JobCommand::Get { job_id } => {
                let response: JobResponse = client.get(&format!("/v1/jobs/{job_id}")).await?;
                serde_json::to_string_pretty(&response).map_err(|err| CliError {
                    kind: FailureKind::Transport,
                    message: err.to_string(),
                })
            }
            JobCommand::Query { label } => {
                let labels = parse_labels(&label)?;
                let response: QueryJobsResponse = client
                    .post("/v1/jobs/query", &QueryJobsRequest { labels })
                    .await?;
                Ok(response.job_ids.join("\n"))
            }
            JobCommand::Delete { job_id } => {
                client.delete(&format!("/v1/jobs/{job_id}")).await?;
                Ok(format!("deleted job {job_id}"))
            }
        },
        Command::Task { command } => match command {
            TaskCommand::Get {
                job_id,
                instance_id,
            } => {
                let response: serde_json::Value = client
                    .get(&format!("/v1/jobs/{job_id}/tasks/{instance_id}"))
                    .await?;
                serde_json::to_string_pretty(&response).map_err(|err| CliError {
                    kind: FailureKind::Transport,
                    message: err.to_string(),
                })
            }
            TaskCommand::List { job_id, from, to } => {
                let mut path = format!("/v1/jobs/{job_id}/tasks?from={from}");
                if let Some(to) = to {
                    path.push_str(&format!("&to={to}"));
                }
                let response: TasksResponse = client.get(&path).await?;
                let mut lines = vec![];
                for task in response.tasks {
                    lines.push(format!(
                        "{}-{}\t{}\t{}\t{}",
                        task.job_id,
                        task.instance_id,
                        task.runtime.state,
                        task.runtime.goal_state,
                        task.runtime.host.as_deref().unwrap_or("-"),
                    ));
                }
                Ok(lines.join("\n"))
            }
            TaskCommand::Start { job_id, selection } => {
                client
                    .post::<_, serde_json::Value>(
                        &format!("/v1/jobs/{job_id}/tasks/start"),
                        &InstancesRequest {
                            instances: selection.instances,
                        },
                    )
                    .await?;
                Ok(format!("started tasks of job {job_id}"))
            }
            TaskCommand::Stop { job_id, selection } => {
                client
                    .post::<_, serde_json::Value>(
                        &format!("/v1/jobs/{job_id}/tasks/stop"),
                        &InstancesRequest {
                            instances: selection.instances,
                        },
                    )
                    .await?;
                Ok(format!("stopped tasks of job {job_id}"))
            }
            TaskCommand::Restart { job_id, selection } => {
                client
                    .post::<_, serde_json::Value>(
                        &format!("/v1/jobs/{job_id}/tasks/restart"),
                        &InstancesRequest {
                            instances: selection.instances,
                        },
                    )
                    .await?;
                Ok(format!("restarted tasks of job {job_id}"))
            }
        },
        Command::Respool { command } => match command {
            RespoolCommand::Create { spec } => {
                let config: RespoolConfig = load_yaml_spec(&spec)?;
                let response: CreateRespoolResponse =
                    client.post("/v1/respools", &config).await?;
                Ok(format!("created resource pool {}", response.respool_id))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_labels() {
        let labels = parse_labels(&["team=infra".to_string(), "tier=batch".to_string()]).unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].key, "team");
        assert_eq!(labels[0].value, "infra");

        let err = parse_labels(&["notalabel".to_string()]).unwrap_err();
        assert_eq!(err.kind, FailureKind::Validation);
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "peloton", "task", "stop", "job1", "--instances", "0,2,4",
        ])
        .unwrap();
        match cli.command {
            Command::Task {
                command: TaskCommand::Stop { job_id, selection },
            } => {
                assert_eq!(job_id, "job1");
                assert_eq!(selection.instances, Some(vec![0, 2, 4]));
            }
            _ => panic!("unexpected command"),
        }

        let cli = Cli::try_parse_from(["peloton", "serve", "-c", "/etc/peloton.yaml"]).unwrap();
        match cli.command {
            Command::Serve { config } => {
                assert_eq!(config.unwrap().to_str().unwrap(), "/etc/peloton.yaml");
            }
            _ => panic!("unexpected command"),
        }
    }
}
