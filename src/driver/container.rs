//! Container-job driver: executes a node as a Kubernetes Job and streams
//! its pod's log output through the same NDJSON parsing pipeline as the
//! local driver. Enabled by the `k8s-driver` feature; reaches for `kube`
//! and `k8s-openapi`, the crates the broader example pack uses for this
//! exact job-submission-and-log-tail shape.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PodSecurityContext, PodSpec, PodTemplateSpec, ResourceRequirements,
    SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, LogParams, PostParams};
use kube::Client;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::driver::{
    parse::parse_line, Driver, DriverContext, DriverEvent, DriverOutcome, EXIT_CODE_CANCELLED,
};
use crate::error::{CoreError, Result};

/// Namespace and resource defaults for container-job execution, normally
/// sourced from `config::K8sDriverConfig`.
pub struct ContainerJobDriver {
    pub namespace: String,
    pub service_account: Option<String>,
    pub image_pull_secrets: Vec<String>,
    pub cpu_request: String,
    pub memory_request: String,
    pub cpu_limit: String,
    pub memory_limit: String,
    pub active_deadline_secs: i64,
    pub ttl_seconds_after_finished: i32,
}

impl ContainerJobDriver {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            service_account: None,
            image_pull_secrets: Vec::new(),
            cpu_request: "100m".to_string(),
            memory_request: "128Mi".to_string(),
            cpu_limit: "1".to_string(),
            memory_limit: "512Mi".to_string(),
            active_deadline_secs: 900,
            ttl_seconds_after_finished: 300,
        }
    }

    /// Job names must satisfy the cluster's DNS-1123 label grammar; a hash
    /// of run+node keeps retries and re-dispatches idempotent.
    fn job_name(run_id: &str, node_id: &str) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        (run_id, node_id).hash(&mut hasher);
        let hash = hasher.finish();

        let sanitize = |s: &str| {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
                .collect::<String>()
        };
        let mut name = format!("mentatlab-{}-{}-{:x}", sanitize(run_id), sanitize(node_id), hash);
        name.truncate(63);
        name.trim_end_matches('-').to_string()
    }

    fn build_job(&self, ctx: &DriverContext) -> Result<Job> {
        let name = Self::job_name(&ctx.run_id, &ctx.node.id);
        let image = ctx.node.image.clone().ok_or_else(|| {
            CoreError::Validation(format!("node {} has no image for the container driver", ctx.node.id))
        })?;

        let mut env: Vec<EnvVar> = ctx
            .env
            .iter()
            .map(|(k, v)| EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                ..Default::default()
            })
            .collect();
        env.push(EnvVar {
            name: "RUN_ID".to_string(),
            value: Some(ctx.run_id.clone()),
            ..Default::default()
        });
        env.push(EnvVar {
            name: "NODE_ID".to_string(),
            value: Some(ctx.node.id.clone()),
            ..Default::default()
        });

        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), k8s_openapi::apimachinery::pkg::api::resource::Quantity(self.cpu_request.clone()));
        requests.insert("memory".to_string(), k8s_openapi::apimachinery::pkg::api::resource::Quantity(self.memory_request.clone()));
        let mut limits = BTreeMap::new();
        limits.insert("cpu".to_string(), k8s_openapi::apimachinery::pkg::api::resource::Quantity(self.cpu_limit.clone()));
        limits.insert("memory".to_string(), k8s_openapi::apimachinery::pkg::api::resource::Quantity(self.memory_limit.clone()));

        let container = Container {
            name: "node".to_string(),
            image: Some(image),
            command: if ctx.node.command.is_empty() { None } else { Some(ctx.node.command.clone()) },
            env: Some(env),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                limits: Some(limits),
                ..Default::default()
            }),
            security_context: Some(SecurityContext {
                run_as_non_root: Some(true),
                read_only_root_filesystem: Some(true),
                allow_privilege_escalation: Some(false),
                capabilities: Some(k8s_openapi::api::core::v1::Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    add: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let pod_spec = PodSpec {
            containers: vec![container],
            restart_policy: Some("Never".to_string()),
            service_account_name: self.service_account.clone(),
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(true),
                ..Default::default()
            }),
            image_pull_secrets: if self.image_pull_secrets.is_empty() {
                None
            } else {
                Some(
                    self.image_pull_secrets
                        .iter()
                        .map(|s| k8s_openapi::api::core::v1::LocalObjectReference { name: s.clone() })
                        .collect(),
                )
            },
            ..Default::default()
        };

        let mut labels = BTreeMap::new();
        labels.insert("mentatlab.dev/run-id".to_string(), ctx.run_id.clone());
        labels.insert("mentatlab.dev/node-id".to_string(), ctx.node.id.clone());

        Ok(Job {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                active_deadline_seconds: Some(self.active_deadline_secs),
                ttl_seconds_after_finished: Some(self.ttl_seconds_after_finished),
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

#[async_trait]
impl Driver for ContainerJobDriver {
    async fn execute(
        &self,
        ctx: DriverContext,
        events: mpsc::Sender<DriverEvent>,
    ) -> Result<DriverOutcome> {
        let client = Client::try_default()
            .await
            .map_err(|e| CoreError::DriverFailure(format!("kube client: {e}")))?;
        let jobs: Api<Job> = Api::namespaced(client.clone(), &self.namespace);

        let job = self.build_job(&ctx)?;
        let job_name = job.metadata.name.clone().unwrap();

        jobs.create(&PostParams::default(), &job)
            .await
            .map_err(|e| CoreError::DriverFailure(format!("job create: {e}")))?;
        info!(run_id = %ctx.run_id, node_id = %ctx.node.id, job = %job_name, "submitted container job");

        let pods: Api<k8s_openapi::api::core::v1::Pod> = Api::namespaced(client, &self.namespace);

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                let _ = jobs.delete(&job_name, &DeleteParams::background()).await;
                return Ok(DriverOutcome { exit_code: EXIT_CODE_CANCELLED, timed_out: false, cancelled: true });
            }
            outcome = self.stream_and_wait(&jobs, &pods, &job_name, &ctx.node.id, &events) => outcome,
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(job = %job_name, error = %e, "container job execution failed");
                Err(e)
            }
        }
    }
}

impl ContainerJobDriver {
    async fn stream_and_wait(
        &self,
        jobs: &Api<Job>,
        pods: &Api<k8s_openapi::api::core::v1::Pod>,
        job_name: &str,
        label_node_id: &str,
        events: &mpsc::Sender<DriverEvent>,
    ) -> Result<DriverOutcome> {
        let list_params = kube::api::ListParams::default()
            .labels(&format!("job-name={job_name}"));

        let pod_name = loop {
            let pod_list = pods
                .list(&list_params)
                .await
                .map_err(|e| CoreError::DriverFailure(format!("pod list: {e}")))?;
            if let Some(pod) = pod_list.items.into_iter().next() {
                if let Some(name) = pod.metadata.name {
                    break name;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        };

        let log_params = LogParams {
            follow: true,
            container: Some("node".to_string()),
            ..Default::default()
        };
        let mut log_stream = pods
            .log_stream(&pod_name, &log_params)
            .await
            .map_err(|e| CoreError::DriverFailure(format!("log stream: {e}")))?
            .lines();

        while let Some(line) = log_stream
            .try_next()
            .await
            .map_err(|e| CoreError::DriverFailure(format!("log read: {e}")))?
        {
            let _ = events.send(parse_line(&line)).await;
        }

        loop {
            let job = jobs
                .get(job_name)
                .await
                .map_err(|e| CoreError::DriverFailure(format!("job get: {e}")))?;
            if let Some(status) = job.status {
                if status.succeeded.unwrap_or(0) > 0 {
                    let _ = label_node_id;
                    return Ok(DriverOutcome { exit_code: 0, timed_out: false, cancelled: false });
                }
                if status.failed.unwrap_or(0) > 0 {
                    return Ok(DriverOutcome { exit_code: 1, timed_out: false, cancelled: false });
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    }
}
