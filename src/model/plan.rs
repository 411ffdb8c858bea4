//! Plan: the immutable DAG of NodeSpecs and edges a Run executes.
//!
//! Grounded on the teacher's `execution::workflow_engine::{WorkflowNode,
//! WorkflowEdge}` shape, generalized from a flat node/edge pair into the
//! full NodeSpec with at most one control-flow config, per spec §3.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Agent,
    Conditional,
    ForEach,
    Subflow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ConditionalType {
    If,
    Switch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalBranch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalConfig {
    #[serde(rename = "type")]
    pub kind: ConditionalType,
    pub expression: String,
    pub branches: HashMap<String, ConditionalBranch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForEachConfig {
    pub collection: String,
    pub item_var: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_var: Option<String>,
    #[serde(default)]
    pub max_parallel: u32,
    pub body: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubflowConfig {
    pub flow_id: String,
    #[serde(default)]
    pub input_mapping: HashMap<String, String>,
    #[serde(default)]
    pub output_mapping: HashMap<String, String>,
}

/// At most one of these is set on a given NodeSpec (enforced by
/// `Plan::validate`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlFlow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditional: Option<ConditionalConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub for_each: Option<ForEachConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subflow: Option<SubflowConfig>,
}

impl ControlFlow {
    fn configured_count(&self) -> usize {
        [
            self.conditional.is_some(),
            self.for_each.is_some(),
            self.subflow.is_some(),
        ]
        .into_iter()
        .filter(|b| *b)
        .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub control_flow: ControlFlow,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            agent_id: None,
            image: None,
            command: Vec::new(),
            env: HashMap::new(),
            timeout: None,
            retries: 0,
            control_flow: ControlFlow::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

impl Plan {
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn outgoing(&self, id: &str) -> impl Iterator<Item = &EdgeSpec> {
        self.edges.iter().filter(move |e| e.from == id)
    }

    pub fn incoming_count(&self, id: &str) -> usize {
        self.edges.iter().filter(|e| e.to == id).count()
    }

    /// Root nodes: no incoming edges.
    pub fn roots(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|n| n.id.clone())
            .filter(|id| self.incoming_count(id) == 0)
            .collect()
    }

    /// Plan validation per spec §4.3 step 1: unique ids, edges reference
    /// known nodes, no cycles (Kahn), at most one control-flow config per
    /// node, branch/target references resolve.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(CoreError::Validation(format!(
                    "duplicate node id: {}",
                    node.id
                )));
            }
            if node.control_flow.configured_count() > 1 {
                return Err(CoreError::Validation(format!(
                    "node {} has more than one control-flow config",
                    node.id
                )));
            }
        }

        let known: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        for edge in &self.edges {
            if !known.contains(edge.from.as_str()) {
                return Err(CoreError::Validation(format!(
                    "edge references unknown node: {}",
                    edge.from
                )));
            }
            if !known.contains(edge.to.as_str()) {
                return Err(CoreError::Validation(format!(
                    "edge references unknown node: {}",
                    edge.to
                )));
            }
        }

        for node in &self.nodes {
            if let Some(cond) = &node.control_flow.conditional {
                for (key, branch) in &cond.branches {
                    for target in &branch.targets {
                        if !known.contains(target.as_str()) {
                            return Err(CoreError::Validation(format!(
                                "node {} branch {} targets unknown node {}",
                                node.id, key, target
                            )));
                        }
                    }
                }
                if let Some(default) = &cond.default {
                    if !cond.branches.contains_key(default) {
                        return Err(CoreError::Validation(format!(
                            "node {} default branch {} is not defined",
                            node.id, default
                        )));
                    }
                }
            }
            if let Some(for_each) = &node.control_flow.for_each {
                for body_id in &for_each.body {
                    if !known.contains(body_id.as_str()) {
                        return Err(CoreError::Validation(format!(
                            "node {} body references unknown node {}",
                            node.id, body_id
                        )));
                    }
                }
            }
        }

        self.check_acyclic()
    }

    /// Topological order of node ids (Kahn's algorithm), used to render
    /// `mode=plan`'s `{plan:{steps:[...]}}` response. Callers must run
    /// `validate()` first; a cyclic plan yields a partial, meaningless
    /// order here.
    pub fn topological_order(&self) -> Vec<String> {
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        for edge in &self.edges {
            *in_degree.entry(edge.to.as_str()).or_insert(0) += 1;
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::new();
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for edge in self.outgoing(id) {
                let deg = in_degree.get_mut(edge.to.as_str()).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(edge.to.as_str());
                }
            }
        }
        order
    }

    /// Kahn's algorithm: if not every node can be removed, a cycle exists.
    fn check_acyclic(&self) -> Result<()> {
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        for edge in &self.edges {
            *in_degree.entry(edge.to.as_str()).or_insert(0) += 1;
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for edge in self.outgoing(id) {
                let deg = in_degree.get_mut(edge.to.as_str()).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(edge.to.as_str());
                }
            }
        }

        if visited != self.nodes.len() {
            return Err(CoreError::Validation("plan contains a cycle".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_plan() -> Plan {
        Plan {
            nodes: vec![
                NodeSpec::new("A", NodeType::Agent),
                NodeSpec::new("B", NodeType::Agent),
            ],
            edges: vec![EdgeSpec {
                from: "A".into(),
                to: "B".into(),
            }],
        }
    }

    #[test]
    fn linear_plan_validates() {
        assert!(linear_plan().validate().is_ok());
    }

    #[test]
    fn roots_are_nodes_with_no_incoming_edges() {
        assert_eq!(linear_plan().roots(), vec!["A".to_string()]);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut plan = linear_plan();
        plan.edges.push(EdgeSpec {
            from: "B".into(),
            to: "A".into(),
        });
        assert!(matches!(plan.validate(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn unknown_edge_target_is_rejected() {
        let mut plan = linear_plan();
        plan.edges.push(EdgeSpec {
            from: "A".into(),
            to: "Z".into(),
        });
        assert!(matches!(plan.validate(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let mut plan = linear_plan();
        plan.nodes.push(NodeSpec::new("A", NodeType::Agent));
        assert!(matches!(plan.validate(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn topological_order_respects_edges() {
        let plan = linear_plan();
        assert_eq!(plan.topological_order(), vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn more_than_one_control_flow_config_is_rejected() {
        let mut plan = linear_plan();
        plan.nodes[0].control_flow.for_each = Some(ForEachConfig {
            collection: "inputs.items".into(),
            item_var: "item".into(),
            index_var: None,
            max_parallel: 1,
            body: vec!["B".into()],
        });
        plan.nodes[0].control_flow.conditional = Some(ConditionalConfig {
            kind: ConditionalType::If,
            expression: "true".into(),
            branches: HashMap::new(),
            default: None,
        });
        assert!(matches!(plan.validate(), Err(CoreError::Validation(_))));
    }
}
