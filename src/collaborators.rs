//! Collaborator interfaces named in spec §1/§6 as external systems this
//! core treats as opaque dependencies: the Flow Store, the Agent
//! Registry, and the Artifact Store. All three are explicitly out of
//! scope for this crate's implementation, but `subflow` nodes need a
//! `FlowStore` to resolve their `flow_id` and a checkpoint's
//! `artifact_ref` needs an `ArtifactStore` shape to type-check against,
//! so both are modeled here as `#[async_trait]` traits with an
//! in-process stub implementation for local/dev runs — mirroring the
//! teacher's `TaskExecutor` trait-with-default-impl pattern in `lib.rs`.
//!
//! A production deployment is expected to supply real implementations
//! backed by the flow definition store, the agent metadata service, and
//! the object store named in spec §1; nothing in this crate depends on
//! the stub beyond satisfying the trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::model::Plan;

/// A stored flow definition. `graph` is the DAG a `subflow` node's nested
/// Scheduler instance runs; the wire name mirrors the Flow Store's own
/// `{id,name,graph,layout?,metadata?,timestamps,createdBy?}` shape even
/// though it is just a `Plan` from this crate's point of view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub name: String,
    #[serde(rename = "graph")]
    pub plan: Plan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    pub fn new(id: impl Into<String>, name: impl Into<String>, plan: Plan) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            plan,
            layout: None,
            metadata: HashMap::new(),
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// CRUD lookup over flow definitions, used by `subflow` nodes to resolve
/// `SubflowConfig::flow_id` (spec §4.3 step 7).
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn create_flow(&self, flow: Flow) -> Result<()>;
    async fn get_flow(&self, id: &str) -> Result<Flow>;
    async fn update_flow(&self, flow: Flow) -> Result<()>;
    async fn delete_flow(&self, id: &str) -> Result<()>;
    async fn list_flows(&self) -> Result<Vec<Flow>>;
}

/// In-process stub satisfying `FlowStore` for local/dev runs and tests.
pub struct InMemoryFlowStore {
    flows: DashMap<String, Flow>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self { flows: DashMap::new() }
    }
}

impl Default for InMemoryFlowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn create_flow(&self, flow: Flow) -> Result<()> {
        if self.flows.contains_key(&flow.id) {
            return Err(CoreError::AlreadyExists(format!("flow {}", flow.id)));
        }
        self.flows.insert(flow.id.clone(), flow);
        Ok(())
    }

    async fn get_flow(&self, id: &str) -> Result<Flow> {
        self.flows
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| CoreError::NotFound(format!("flow {id}")))
    }

    async fn update_flow(&self, mut flow: Flow) -> Result<()> {
        if !self.flows.contains_key(&flow.id) {
            return Err(CoreError::NotFound(format!("flow {}", flow.id)));
        }
        flow.updated_at = Utc::now();
        self.flows.insert(flow.id.clone(), flow);
        Ok(())
    }

    async fn delete_flow(&self, id: &str) -> Result<()> {
        self.flows
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("flow {id}")))
    }

    async fn list_flows(&self) -> Result<Vec<Flow>> {
        Ok(self.flows.iter().map(|entry| entry.value().clone()).collect())
    }
}

/// Static description of an agent, as looked up from the Agent Registry
/// (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
}

/// CRUD-plus-`exists` lookup over agent metadata.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn create_agent(&self, agent: AgentDescriptor) -> Result<()>;
    async fn get_agent(&self, id: &str) -> Result<AgentDescriptor>;
    async fn update_agent(&self, agent: AgentDescriptor) -> Result<()>;
    async fn delete_agent(&self, id: &str) -> Result<()>;
    async fn list_agents(&self) -> Result<Vec<AgentDescriptor>>;
    async fn exists(&self, id: &str) -> Result<bool>;
}

/// In-process stub satisfying `AgentRegistry`.
pub struct InMemoryAgentRegistry {
    agents: DashMap<String, AgentDescriptor>,
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self { agents: DashMap::new() }
    }
}

impl Default for InMemoryAgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRegistry for InMemoryAgentRegistry {
    async fn create_agent(&self, agent: AgentDescriptor) -> Result<()> {
        if self.agents.contains_key(&agent.id) {
            return Err(CoreError::AlreadyExists(format!("agent {}", agent.id)));
        }
        self.agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> Result<AgentDescriptor> {
        self.agents
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))
    }

    async fn update_agent(&self, agent: AgentDescriptor) -> Result<()> {
        if !self.agents.contains_key(&agent.id) {
            return Err(CoreError::NotFound(format!("agent {}", agent.id)));
        }
        self.agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn delete_agent(&self, id: &str) -> Result<()> {
        self.agents
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))
    }

    async fn list_agents(&self) -> Result<Vec<AgentDescriptor>> {
        Ok(self.agents.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.agents.contains_key(id))
    }
}

/// An opaque handle identifying a blob in the external artifact store
/// (spec GLOSSARY). Resolvable back into a presigned URL but never a raw
/// path, since the store may be any of several blob backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: String,
    pub content_type: String,
    pub size_bytes: u64,
}

/// `Put/Get/Delete/List` plus presigned URL production (spec §6).
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, path: &str, content: Vec<u8>, content_type: &str) -> Result<ArtifactRef>;
    async fn get(&self, reference: &ArtifactRef) -> Result<Vec<u8>>;
    async fn delete(&self, reference: &ArtifactRef) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactRef>>;
    async fn presign_get(&self, reference: &ArtifactRef, expiry_secs: u64) -> Result<String>;
    async fn presign_put(&self, path: &str, expiry_secs: u64) -> Result<String>;
}

/// In-process stub satisfying `ArtifactStore`, backing "presigned" URLs
/// with a fake `memory://` scheme — adequate for local runs and tests,
/// never for production (nothing actually serves that URL).
pub struct InMemoryArtifactStore {
    blobs: DashMap<String, (Vec<u8>, String)>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self { blobs: DashMap::new() }
    }
}

impl Default for InMemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, path: &str, content: Vec<u8>, content_type: &str) -> Result<ArtifactRef> {
        let reference = ArtifactRef {
            key: path.to_string(),
            content_type: content_type.to_string(),
            size_bytes: content.len() as u64,
        };
        self.blobs.insert(path.to_string(), (content, content_type.to_string()));
        Ok(reference)
    }

    async fn get(&self, reference: &ArtifactRef) -> Result<Vec<u8>> {
        self.blobs
            .get(&reference.key)
            .map(|entry| entry.0.clone())
            .ok_or_else(|| CoreError::NotFound(format!("artifact {}", reference.key)))
    }

    async fn delete(&self, reference: &ArtifactRef) -> Result<()> {
        self.blobs
            .remove(&reference.key)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("artifact {}", reference.key)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactRef>> {
        Ok(self
            .blobs
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| ArtifactRef {
                key: entry.key().clone(),
                content_type: entry.value().1.clone(),
                size_bytes: entry.value().0.len() as u64,
            })
            .collect())
    }

    async fn presign_get(&self, reference: &ArtifactRef, expiry_secs: u64) -> Result<String> {
        Ok(format!("memory://{}?op=get&expiry={}", reference.key, expiry_secs))
    }

    async fn presign_put(&self, path: &str, expiry_secs: u64) -> Result<String> {
        Ok(format!("memory://{path}?op=put&expiry={expiry_secs}"))
    }
}

/// Shared handle to every collaborator, constructed once at startup and
/// threaded explicitly through the API/Scheduler layers (spec §9: no
/// ambient globals).
#[derive(Clone)]
pub struct Collaborators {
    pub flows: Arc<dyn FlowStore>,
    pub agents: Arc<dyn AgentRegistry>,
    pub artifacts: Arc<dyn ArtifactStore>,
}

impl Collaborators {
    pub fn in_memory() -> Self {
        Self {
            flows: Arc::new(InMemoryFlowStore::new()),
            agents: Arc::new(InMemoryAgentRegistry::new()),
            artifacts: Arc::new(InMemoryArtifactStore::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Plan;

    #[tokio::test]
    async fn flow_store_create_get_round_trips() {
        let store = InMemoryFlowStore::new();
        store.create_flow(Flow::new("f1", "greet", Plan::default())).await.unwrap();
        let flow = store.get_flow("f1").await.unwrap();
        assert_eq!(flow.name, "greet");
    }

    #[tokio::test]
    async fn flow_store_duplicate_create_fails() {
        let store = InMemoryFlowStore::new();
        store.create_flow(Flow::new("f1", "greet", Plan::default())).await.unwrap();
        assert!(matches!(
            store.create_flow(Flow::new("f1", "greet2", Plan::default())).await,
            Err(CoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn agent_registry_exists_reflects_membership() {
        let registry = InMemoryAgentRegistry::new();
        assert!(!registry.exists("a1").await.unwrap());
        registry
            .create_agent(AgentDescriptor {
                id: "a1".into(),
                name: "echo".into(),
                version: "1.0.0".into(),
                image: None,
                command: vec!["echo".into()],
                capabilities: vec![],
                schema: None,
            })
            .await
            .unwrap();
        assert!(registry.exists("a1").await.unwrap());
    }

    #[tokio::test]
    async fn artifact_store_put_get_round_trips() {
        let store = InMemoryArtifactStore::new();
        let reference = store.put("runs/r1/out.txt", b"hello".to_vec(), "text/plain").await.unwrap();
        assert_eq!(reference.size_bytes, 5);
        let content = store.get(&reference).await.unwrap();
        assert_eq!(content, b"hello");
    }

    #[tokio::test]
    async fn artifact_store_list_filters_by_prefix() {
        let store = InMemoryArtifactStore::new();
        store.put("runs/r1/a.txt", b"a".to_vec(), "text/plain").await.unwrap();
        store.put("runs/r2/b.txt", b"b".to_vec(), "text/plain").await.unwrap();
        let refs = store.list("runs/r1/").await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].key, "runs/r1/a.txt");
    }
}
