//! Scheduler: executes a validated Plan against a Run, in dataflow order.
//!
//! Grounded on the teacher's `execution::workflow_engine::WorkflowExecutionEngine`
//! (`find_next_nodes`, one `execute_node` entry point, a `step` counter) but
//! generalized from a linear edge walk into full in-degree dataflow
//! scheduling with a bounded worker pool and the control-flow node types
//! the original engine never had (conditional, for_each, subflow).

pub mod expr;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collaborators::FlowStore;
use crate::driver::{Driver, DriverContext, DriverEvent, DriverOutcome};
use crate::error::{CoreError, Result};
use crate::model::{
    ConditionalType, EventInput, EventType, NodeSpec, NodeState, NodeStatus, NodeType, Plan,
    RunStatus,
};
use crate::store::RunStore;

/// How a `for_each` node aggregates its iterations' outcomes. Only
/// `FailFast` is implemented; spec.md leaves a relaxed mode as an open
/// question for a later release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForEachFailureMode {
    FailFast,
}

pub struct SchedulerConfig {
    pub max_parallel_nodes: usize,
    pub for_each_failure_mode: ForEachFailureMode,
    pub retry_base_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: num_cpus(),
            for_each_failure_mode: ForEachFailureMode::FailFast,
            retry_base_delay: Duration::from_millis(200),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// Executes one Plan against one Run id. Stateless across runs; owns no
/// per-run data beyond what's threaded through `run()`.
pub struct Scheduler {
    store: Arc<dyn RunStore>,
    driver: Arc<dyn Driver>,
    flow_store: Arc<dyn FlowStore>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RunStore>,
        driver: Arc<dyn Driver>,
        flow_store: Arc<dyn FlowStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self { store, driver, flow_store, config }
    }

    /// Drive `plan` to completion for `run_id`. The run must already exist
    /// in `queued` status; this call transitions it through `running` to a
    /// terminal status.
    pub async fn run(&self, run_id: &str, plan: Plan, cancel: CancellationToken) -> Result<()> {
        plan.validate()?;
        self.store.set_status(run_id, RunStatus::Running).await?;

        let mut engine = Engine::new(&plan);
        let mut results: HashMap<String, expr::Value> = HashMap::new();
        let mut ready: Vec<String> = plan.roots();
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_nodes.max(1)));
        let mut in_flight: JoinSet<Result<NodeOutcome>> = JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                engine.cancel_remaining(&self.store, run_id).await?;
                break;
            }

            while let Some(node_id) = ready.pop() {
                let node = plan.node(&node_id).cloned().expect("ready id must exist in plan");
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let store = self.store.clone();
                let driver = self.driver.clone();
                let flow_store = self.flow_store.clone();
                let run_id_owned = run_id.to_string();
                let node_cancel = cancel.clone();
                let context = results.clone();
                let config_snapshot = (self.config.for_each_failure_mode, self.config.retry_base_delay);

                engine.mark_running(&node_id);
                store
                    .append_event(
                        run_id,
                        EventInput::new(EventType::NodeStatus)
                            .with_node(node_id.clone())
                            .with_data(serde_json::json!({"status": "running"})),
                    )
                    .await?;

                let plan_for_task = plan.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    execute_node(
                        &store,
                        &driver,
                        &flow_store,
                        &run_id_owned,
                        &plan_for_task,
                        &node,
                        &context,
                        node_cancel,
                        config_snapshot.0,
                        config_snapshot.1,
                    )
                    .await
                });
            }

            if in_flight.is_empty() {
                break;
            }

            match in_flight.join_next().await {
                Some(Ok(Ok(outcome))) => {
                    results.insert(outcome.node_id.clone(), outcome.result.clone());
                    let (newly_ready, newly_skipped) = engine.complete(&plan, &outcome);
                    for node_id in &newly_skipped {
                        self.store
                            .append_event(
                                run_id,
                                EventInput::new(EventType::NodeStatus)
                                    .with_node(node_id.clone())
                                    .with_data(serde_json::json!({"status": "skipped"})),
                            )
                            .await?;
                    }
                    ready.extend(newly_ready);
                }
                Some(Ok(Err(e))) => {
                    warn!(run_id, error = %e, "node task returned an error");
                }
                Some(Err(join_err)) => {
                    warn!(run_id, error = %join_err, "node task panicked");
                }
                None => break,
            }
        }

        let final_status = if engine.all_non_skipped_succeeded() {
            RunStatus::Succeeded
        } else if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };
        self.store.set_status(run_id, final_status).await?;
        info!(run_id, status = final_status.as_str(), "run finished");
        Ok(())
    }
}

struct NodeOutcome {
    node_id: String,
    status: NodeStatus,
    result: expr::Value,
    /// Branch targets a conditional node decided NOT to take. Empty for
    /// every other node type. The engine marks these (and everything
    /// reachable from them) `skipped` instead of walking them through the
    /// normal in-degree countdown.
    skip_targets: Vec<String>,
}

/// Private scheduler state: node states and the in-degree table, guarded
/// by ordinary `&mut self` access since the owning `run()` loop is the
/// sole mutator (driver execution happens inside spawned tasks, outside
/// this state, per spec's concurrency note).
struct Engine {
    node_states: HashMap<String, NodeState>,
    in_degree: HashMap<String, i64>,
    /// How many of a node's now-resolved incoming edges arrived from a
    /// branch that actually ran, as opposed to one routed through
    /// `skip_targets`. A node is only ever marked `skipped` once its
    /// in-degree has fully drained AND none of those edges were live —
    /// this is what lets a diamond/merge node with one live parent and
    /// one skipped parent still run (spec §4.3 step 5 only skips a
    /// subtree with no remaining live path in).
    live_count: HashMap<String, u32>,
}

impl Engine {
    fn new(plan: &Plan) -> Self {
        let node_states = plan
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeState::pending(n.id.clone())))
            .collect();
        let in_degree = plan
            .nodes
            .iter()
            .map(|n| (n.id.clone(), plan.incoming_count(&n.id) as i64))
            .collect();
        let live_count = plan.nodes.iter().map(|n| (n.id.clone(), 0u32)).collect();
        Self { node_states, in_degree, live_count }
    }

    fn mark_running(&mut self, node_id: &str) {
        if let Some(state) = self.node_states.get_mut(node_id) {
            state.mark_running();
        }
    }

    /// Apply a finished node's outcome, resolving each outgoing edge
    /// against the target's in-degree and returning the set that became
    /// ready or skipped as a result. An edge into `outcome.skip_targets`
    /// resolves as non-live: it still drains the target's in-degree so the
    /// DAG can progress past the branch not taken, but it never counts as
    /// the live completion a node needs to run. A node becomes `skipped`
    /// only once its in-degree fully drains with zero live edges among
    /// them; a merge node with at least one live parent still runs.
    /// Returns `(newly_ready, newly_skipped)`. The caller emits
    /// `node_status` events for both (spec §8 S2: a skipped node still gets
    /// a `node_status{status:"skipped"}` frame).
    fn complete(&mut self, plan: &Plan, outcome: &NodeOutcome) -> (Vec<String>, Vec<String>) {
        if let Some(state) = self.node_states.get_mut(&outcome.node_id) {
            state.mark_terminal(outcome.status, None, None, None);
        }

        let mut ready = Vec::new();
        let mut skipped = Vec::new();
        let mut work: Vec<(String, bool)> = plan
            .outgoing(&outcome.node_id)
            .map(|edge| (edge.to.clone(), !outcome.skip_targets.iter().any(|t| t == &edge.to)))
            .collect();

        while let Some((node_id, live)) = work.pop() {
            self.resolve_edge(plan, &node_id, live, &mut ready, &mut skipped, &mut work);
        }
        (ready, skipped)
    }

    /// Resolve one incoming edge into `node_id`: drain its in-degree, and
    /// once fully drained, decide ready vs. skipped by whether any of its
    /// resolved edges were live. A freshly-skipped node's own outgoing
    /// edges are queued onto `work` as non-live, continuing the skip
    /// propagation without re-deriving the full reachable subtree up
    /// front (which is what let a merge node get skipped prematurely).
    fn resolve_edge(
        &mut self,
        plan: &Plan,
        node_id: &str,
        live: bool,
        ready: &mut Vec<String>,
        skipped: &mut Vec<String>,
        work: &mut Vec<(String, bool)>,
    ) {
        let already_terminal = self
            .node_states
            .get(node_id)
            .map(|s| s.status.is_terminal())
            .unwrap_or(true);
        if already_terminal {
            return;
        }

        if let Some(deg) = self.in_degree.get_mut(node_id) {
            *deg -= 1;
        }
        if live {
            *self.live_count.entry(node_id.to_string()).or_insert(0) += 1;
        }

        if self.in_degree.get(node_id).copied().unwrap_or(0) > 0 {
            return;
        }

        if self.live_count.get(node_id).copied().unwrap_or(0) > 0 {
            ready.push(node_id.to_string());
            return;
        }

        if let Some(state) = self.node_states.get_mut(node_id) {
            state.mark_terminal(NodeStatus::Skipped, None, None, Some("branch not selected".to_string()));
        }
        skipped.push(node_id.to_string());
        for edge in plan.outgoing(node_id) {
            work.push((edge.to.clone(), false));
        }
    }

    fn all_non_skipped_succeeded(&self) -> bool {
        self.node_states
            .values()
            .filter(|s| s.status != NodeStatus::Skipped)
            .all(|s| s.status == NodeStatus::Succeeded)
    }

    async fn cancel_remaining(&mut self, store: &Arc<dyn RunStore>, run_id: &str) -> Result<()> {
        let pending: Vec<String> = self
            .node_states
            .iter()
            .filter(|(_, s)| !s.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for node_id in pending {
            if let Some(state) = self.node_states.get_mut(&node_id) {
                state.mark_terminal(NodeStatus::Failed, None, None, Some("cancelled".to_string()));
            }
            store
                .append_event(
                    run_id,
                    EventInput::new(EventType::NodeStatus)
                        .with_node(node_id)
                        .with_data(serde_json::json!({"status": "failed", "reason": "cancelled"})),
                )
                .await?;
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute_node(
    store: &Arc<dyn RunStore>,
    driver: &Arc<dyn Driver>,
    flow_store: &Arc<dyn FlowStore>,
    run_id: &str,
    plan: &Plan,
    node: &NodeSpec,
    context: &HashMap<String, expr::Value>,
    cancel: CancellationToken,
    for_each_mode: ForEachFailureMode,
    retry_base_delay: Duration,
) -> Result<NodeOutcome> {
    let mut skip_targets = Vec::new();
    let (status, result) = match node.node_type {
        NodeType::Agent => execute_agent_node(store, driver, run_id, node, cancel, retry_base_delay).await?,
        NodeType::Conditional => {
            let (status, result, skipped) = execute_conditional_node(store, run_id, node, context).await?;
            skip_targets = skipped;
            (status, result)
        }
        NodeType::ForEach => {
            execute_for_each_node(store, driver, run_id, plan, node, context, cancel, for_each_mode, retry_base_delay)
                .await?
        }
        NodeType::Subflow => execute_subflow_node(store, driver, flow_store, run_id, node, context, cancel).await?,
    };

    let mut data = serde_json::json!({"status": status.as_str()});
    if status == NodeStatus::Failed {
        if let Some(reason) = failure_reason(&result) {
            data["reason"] = serde_json::Value::String(reason);
        }
    }
    store
        .append_event(
            run_id,
            EventInput::new(EventType::NodeStatus).with_node(node.id.clone()).with_data(data),
        )
        .await?;

    Ok(NodeOutcome { node_id: node.id.clone(), status, result, skip_targets })
}

/// Pull the `reason` string `failure_result` stashed in a failed node's
/// result value, so the terminal `node_status` event can carry it (spec
/// §4.2/§5, scenario S4's `reason:"cancelled"`).
fn failure_reason(result: &expr::Value) -> Option<String> {
    match result {
        expr::Value::Object(map) => match map.get("reason") {
            Some(expr::Value::String(reason)) => Some(reason.clone()),
            _ => None,
        },
        _ => None,
    }
}

async fn execute_agent_node(
    store: &Arc<dyn RunStore>,
    driver: &Arc<dyn Driver>,
    run_id: &str,
    node: &NodeSpec,
    cancel: CancellationToken,
    retry_base_delay: Duration,
) -> Result<(NodeStatus, expr::Value)> {
    let mut attempt = 0u32;
    loop {
        let (tx, mut rx) = tokio::sync::mpsc::channel(256);
        let ctx = DriverContext {
            run_id: run_id.to_string(),
            node: node.clone(),
            env: node.env.clone(),
            cancel: cancel.clone(),
        };

        let driver = driver.clone();
        let forward_store = store.clone();
        let forward_run = run_id.to_string();
        let forward_node = node.id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let input = match event {
                    DriverEvent::Log { message } => EventInput::new(EventType::Log)
                        .with_data(serde_json::json!({"message": message})),
                    DriverEvent::Progress { data } => EventInput::new(EventType::Progress).with_data(data),
                    DriverEvent::Checkpoint { data } => EventInput::new(EventType::Checkpoint).with_data(data),
                    DriverEvent::StreamData { data } => EventInput::new(EventType::StreamData).with_data(data),
                    DriverEvent::Error { message } => EventInput::new(EventType::Error)
                        .with_data(serde_json::json!({"message": message})),
                };
                let _ = forward_store
                    .append_event(&forward_run, input.with_node(forward_node.clone()))
                    .await;
            }
        });

        let outcome = driver.execute(ctx, tx).await?;
        let _ = forwarder.await;

        if outcome.succeeded() {
            let result = expr::Value::Object(HashMap::from([
                ("exit_code".to_string(), expr::Value::Number(outcome.exit_code as f64)),
                ("status".to_string(), expr::Value::String("succeeded".to_string())),
            ]));
            return Ok((NodeStatus::Succeeded, result));
        }

        if outcome.cancelled {
            return Ok((NodeStatus::Failed, failure_result("cancelled")));
        }
        if outcome.timed_out {
            return Ok((NodeStatus::Failed, failure_result("timeout")));
        }

        if attempt < node.retries {
            attempt += 1;
            store
                .append_event(
                    run_id,
                    EventInput::new(EventType::Log)
                        .with_node(node.id.clone())
                        .with_data(serde_json::json!({
                            "message": format!("retrying after exit_code {}", outcome.exit_code),
                            "attempt": attempt,
                        })),
                )
                .await?;
            tokio::time::sleep(retry_base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))).await;
            continue;
        }

        return Ok((NodeStatus::Failed, failure_result("exit_code")));
    }
}

fn failure_result(reason: &str) -> expr::Value {
    expr::Value::Object(HashMap::from([
        ("status".to_string(), expr::Value::String("failed".to_string())),
        ("reason".to_string(), expr::Value::String(reason.to_string())),
    ]))
}

async fn execute_conditional_node(
    store: &Arc<dyn RunStore>,
    run_id: &str,
    node: &NodeSpec,
    context: &HashMap<String, expr::Value>,
) -> Result<(NodeStatus, expr::Value, Vec<String>)> {
    let cond = node
        .control_flow
        .conditional
        .as_ref()
        .ok_or_else(|| CoreError::Validation(format!("node {} has no conditional config", node.id)))?;

    let value = expr::evaluate(&cond.expression, context)?;
    store
        .append_event(
            run_id,
            EventInput::new(EventType::ConditionEvaluated)
                .with_node(node.id.clone())
                .with_data(serde_json::json!({"value": value.to_json()})),
        )
        .await?;

    let branch_key = match cond.kind {
        ConditionalType::If => {
            if value.is_truthy() { "true".to_string() } else { "false".to_string() }
        }
        ConditionalType::Switch => {
            let key = value.as_switch_key();
            if cond.branches.contains_key(&key) {
                key
            } else {
                cond.default.clone().unwrap_or(key)
            }
        }
    };

    let mut skip_targets = Vec::new();
    for (key, branch) in &cond.branches {
        let event_type = if *key == branch_key { EventType::BranchSelected } else { EventType::BranchSkipped };
        if *key != branch_key {
            skip_targets.extend(branch.targets.iter().cloned());
        }
        store
            .append_event(
                run_id,
                EventInput::new(event_type)
                    .with_node(node.id.clone())
                    .with_data(serde_json::json!({"branch": key})),
            )
            .await?;
    }

    Ok((
        NodeStatus::Succeeded,
        expr::Value::Object(HashMap::from([("branch".to_string(), expr::Value::String(branch_key))])),
        skip_targets,
    ))
}

#[allow(clippy::too_many_arguments)]
async fn execute_for_each_node(
    store: &Arc<dyn RunStore>,
    driver: &Arc<dyn Driver>,
    run_id: &str,
    plan: &Plan,
    node: &NodeSpec,
    context: &HashMap<String, expr::Value>,
    cancel: CancellationToken,
    failure_mode: ForEachFailureMode,
    retry_base_delay: Duration,
) -> Result<(NodeStatus, expr::Value)> {
    let config = node
        .control_flow
        .for_each
        .as_ref()
        .ok_or_else(|| CoreError::Validation(format!("node {} has no for_each config", node.id)))?;

    let collection = expr::evaluate(&config.collection, context)?;
    let items = match collection {
        expr::Value::Array(items) => items,
        _ => return Err(CoreError::Validation(format!("node {}: collection is not an array", node.id))),
    };

    store
        .append_event(
            run_id,
            EventInput::new(EventType::LoopStarted)
                .with_node(node.id.clone())
                .with_data(serde_json::json!({"total": items.len()})),
        )
        .await?;

    let max_parallel = config.max_parallel.max(1) as usize;
    let semaphore = Arc::new(Semaphore::new(max_parallel));
    let mut join_set: JoinSet<Result<bool>> = JoinSet::new();
    let mut any_failed = false;

    for (index, item) in items.into_iter().enumerate() {
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
        let mut iter_context = context.clone();
        iter_context.insert(config.item_var.clone(), item);
        if let Some(index_var) = &config.index_var {
            iter_context.insert(index_var.clone(), expr::Value::Number(index as f64));
        }

        let store = store.clone();
        let driver = driver.clone();
        let run_id_owned = run_id.to_string();
        // Only agent-type body nodes actually execute; nested control-flow
        // bodies are out of scope for a single iteration frame (spec §4.3
        // step 6 only names agent-bodied for_each loops).
        let body_nodes: Vec<NodeSpec> = config
            .body
            .iter()
            .filter_map(|id| plan.node(id))
            .filter(|n| n.node_type == NodeType::Agent)
            .cloned()
            .collect();
        let node_id = node.id.clone();
        let cancel = cancel.clone();
        let item_var = config.item_var.clone();
        let index_var = config.index_var.clone();

        join_set.spawn(async move {
            let _permit = permit;
            let mut iteration_ok = true;
            for body_node in &body_nodes {
                let namespaced_id = format!("{}[{index}]", body_node.id);
                store
                    .append_event(
                        &run_id_owned,
                        EventInput::new(EventType::NodeStatus)
                            .with_node(namespaced_id.clone())
                            .with_data(serde_json::json!({"status": "running"})),
                    )
                    .await?;

                let mut namespaced_node = body_node.clone();
                namespaced_node.id = namespaced_id.clone();
                if let Some(value) = iter_context.get(&item_var) {
                    namespaced_node.env.insert(item_var.clone(), value.as_switch_key());
                }
                if let Some(index_var) = &index_var {
                    if let Some(value) = iter_context.get(index_var) {
                        namespaced_node.env.insert(index_var.clone(), value.as_switch_key());
                    }
                }
                let (status, _result) =
                    execute_agent_node(&store, &driver, &run_id_owned, &namespaced_node, cancel.clone(), retry_base_delay)
                        .await?;

                store
                    .append_event(
                        &run_id_owned,
                        EventInput::new(EventType::NodeStatus)
                            .with_node(namespaced_id.clone())
                            .with_data(serde_json::json!({"status": status.as_str()})),
                    )
                    .await?;

                if status != NodeStatus::Succeeded {
                    iteration_ok = false;
                }
            }
            store
                .append_event(
                    &run_id_owned,
                    EventInput::new(EventType::LoopIteration)
                        .with_node(node_id.clone())
                        .with_data(serde_json::json!({"index": index, "ok": iteration_ok})),
                )
                .await?;
            Ok(iteration_ok)
        });

        if failure_mode == ForEachFailureMode::FailFast {
            // Drain completed iterations opportunistically so a failure is
            // observed as soon as possible without waiting for the whole
            // batch when running serially (max_parallel == 1).
            if max_parallel == 1 {
                if let Some(result) = join_set.join_next().await {
                    if !result.map_err(|e| CoreError::DriverFailure(e.to_string()))?? {
                        any_failed = true;
                    }
                }
            }
        }
    }

    while let Some(result) = join_set.join_next().await {
        let ok = result.map_err(|e| CoreError::DriverFailure(e.to_string()))??;
        if !ok {
            any_failed = true;
        }
    }

    store
        .append_event(
            run_id,
            EventInput::new(EventType::LoopComplete)
                .with_node(node.id.clone())
                .with_data(serde_json::json!({"failed": any_failed})),
        )
        .await?;

    let status = if any_failed { NodeStatus::Failed } else { NodeStatus::Succeeded };
    Ok((status, expr::Value::Bool(!any_failed)))
}

async fn execute_subflow_node(
    store: &Arc<dyn RunStore>,
    driver: &Arc<dyn Driver>,
    flow_store: &Arc<dyn FlowStore>,
    run_id: &str,
    node: &NodeSpec,
    context: &HashMap<String, expr::Value>,
    cancel: CancellationToken,
) -> Result<(NodeStatus, expr::Value)> {
    let config = node
        .control_flow
        .subflow
        .as_ref()
        .ok_or_else(|| CoreError::Validation(format!("node {} has no subflow config", node.id)))?;

    let flow = flow_store.get_flow(&config.flow_id).await?;

    let mut nested_inputs: HashMap<String, expr::Value> = HashMap::new();
    for (from_key, to_key) in &config.input_mapping {
        if let Some(value) = context.get(from_key) {
            nested_inputs.insert(to_key.clone(), value.clone());
        }
    }

    let nested_scheduler = Scheduler::new(
        store.clone(),
        driver.clone(),
        flow_store.clone(),
        SchedulerConfig::default(),
    );
    let nested_cancel = cancel.child_token();
    nested_scheduler.run(run_id, flow.plan.clone(), nested_cancel).await?;

    let nested_run = store.get_run(run_id).await?;
    let succeeded = nested_run.status == RunStatus::Succeeded;

    let mut output = HashMap::new();
    for (from_key, to_key) in &config.output_mapping {
        if let Some(value) = nested_inputs.get(from_key) {
            output.insert(to_key.clone(), value.clone());
        }
    }

    let status = if succeeded { NodeStatus::Succeeded } else { NodeStatus::Failed };
    Ok((status, expr::Value::Object(output)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryFlowStore;
    use crate::driver::local::LocalProcessDriver;
    use crate::model::{ConditionalBranch, ConditionalConfig, ConditionalType, EdgeSpec, ForEachConfig, NodeSpec, NodeType};
    use crate::store::memory::MemoryStore;
    use crate::store::RunStore;

    fn shell_node(id: &str, script: &str) -> NodeSpec {
        let mut node = NodeSpec::new(id, NodeType::Agent);
        node.command = vec!["sh".into(), "-c".into(), script.into()];
        node
    }

    async fn run_plan(plan: Plan) -> (Arc<dyn RunStore>, RunStatus) {
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        store.create_run(crate::model::Run::new("r1", plan.clone())).await.unwrap();
        let driver: Arc<dyn Driver> = Arc::new(LocalProcessDriver::new());
        let flow_store: Arc<dyn FlowStore> = Arc::new(InMemoryFlowStore::new());
        let scheduler = Scheduler::new(store.clone(), driver, flow_store, SchedulerConfig::default());
        scheduler.run("r1", plan, CancellationToken::new()).await.unwrap();
        let status = store.get_run("r1").await.unwrap().status;
        (store, status)
    }

    #[tokio::test]
    async fn linear_plan_runs_both_nodes_to_succeeded() {
        let plan = Plan {
            nodes: vec![shell_node("A", "echo hi"), shell_node("B", "echo bye")],
            edges: vec![EdgeSpec { from: "A".into(), to: "B".into() }],
        };
        let (store, status) = run_plan(plan).await;
        assert_eq!(status, RunStatus::Succeeded);
        let events = store.list_events("r1", 0, None).await.unwrap();
        let node_statuses: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == EventType::NodeStatus)
            .map(|e| (e.node_id.clone().unwrap(), e.data["status"].as_str().unwrap().to_string()))
            .collect();
        assert!(node_statuses.contains(&("A".to_string(), "succeeded".to_string())));
        assert!(node_statuses.contains(&("B".to_string(), "succeeded".to_string())));
    }

    #[tokio::test]
    async fn conditional_node_skips_the_unselected_branch() {
        let mut cond = NodeSpec::new("C", NodeType::Conditional);
        cond.control_flow.conditional = Some(ConditionalConfig {
            kind: ConditionalType::If,
            expression: "true".to_string(),
            branches: HashMap::from([
                ("true".to_string(), ConditionalBranch { condition: None, targets: vec!["T".to_string()] }),
                ("false".to_string(), ConditionalBranch { condition: None, targets: vec!["F".to_string()] }),
            ]),
            default: None,
        });
        let plan = Plan {
            nodes: vec![cond, shell_node("T", "echo taken"), shell_node("F", "echo not-taken")],
            edges: vec![
                EdgeSpec { from: "C".into(), to: "T".into() },
                EdgeSpec { from: "C".into(), to: "F".into() },
            ],
        };
        let (store, status) = run_plan(plan).await;
        assert_eq!(status, RunStatus::Succeeded);

        let events = store.list_events("r1", 0, None).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == EventType::BranchSelected && e.data["branch"] == "true"));
        assert!(events.iter().any(|e| e.event_type == EventType::BranchSkipped && e.data["branch"] == "false"));
        assert!(events.iter().any(|e| {
            e.event_type == EventType::NodeStatus
                && e.node_id.as_deref() == Some("F")
                && e.data["status"] == "skipped"
        }));
        assert!(events.iter().any(|e| {
            e.event_type == EventType::NodeStatus
                && e.node_id.as_deref() == Some("T")
                && e.data["status"] == "succeeded"
        }));
    }

    #[tokio::test]
    async fn merge_node_with_one_live_and_one_skipped_parent_still_runs() {
        // C -> T -> M and C -> F -> M: M has two parents, only one of
        // which (T) is on the selected branch. M must still run once T
        // completes, not get swept into F's skip closure.
        let mut cond = NodeSpec::new("C", NodeType::Conditional);
        cond.control_flow.conditional = Some(ConditionalConfig {
            kind: ConditionalType::If,
            expression: "true".to_string(),
            branches: HashMap::from([
                ("true".to_string(), ConditionalBranch { condition: None, targets: vec!["T".to_string()] }),
                ("false".to_string(), ConditionalBranch { condition: None, targets: vec!["F".to_string()] }),
            ]),
            default: None,
        });
        let plan = Plan {
            nodes: vec![
                cond,
                shell_node("T", "echo taken"),
                shell_node("F", "echo not-taken"),
                shell_node("M", "echo merged"),
            ],
            edges: vec![
                EdgeSpec { from: "C".into(), to: "T".into() },
                EdgeSpec { from: "C".into(), to: "F".into() },
                EdgeSpec { from: "T".into(), to: "M".into() },
                EdgeSpec { from: "F".into(), to: "M".into() },
            ],
        };
        let (store, status) = run_plan(plan).await;
        assert_eq!(status, RunStatus::Succeeded);

        let events = store.list_events("r1", 0, None).await.unwrap();
        assert!(events.iter().any(|e| {
            e.event_type == EventType::NodeStatus
                && e.node_id.as_deref() == Some("F")
                && e.data["status"] == "skipped"
        }));
        assert!(events.iter().any(|e| {
            e.event_type == EventType::NodeStatus
                && e.node_id.as_deref() == Some("M")
                && e.data["status"] == "succeeded"
        }));
    }

    #[tokio::test]
    async fn for_each_runs_body_once_per_item_and_reports_loop_events() {
        let mut for_each = NodeSpec::new("L", NodeType::ForEach);
        for_each.control_flow.for_each = Some(ForEachConfig {
            collection: "items".to_string(),
            item_var: "item".to_string(),
            index_var: None,
            max_parallel: 2,
            body: vec!["B".to_string()],
        });
        // `execute_for_each_node` is exercised directly here (rather than
        // through `Scheduler::run`) because its `collection` expression
        // needs an array in context, and the evaluator has no array
        // literal syntax — only a predecessor's node result can seed one
        // when driven through a full plan run.
        // The body script fails unless its `item` env var is set, proving
        // the per-iteration value actually reaches the subprocess.
        let plan = Plan {
            nodes: vec![for_each, shell_node("B", "test -n \"$item\"")],
            edges: vec![],
        };
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        store.create_run(crate::model::Run::new("r1", plan.clone())).await.unwrap();
        let driver: Arc<dyn Driver> = Arc::new(LocalProcessDriver::new());

        let mut context = HashMap::new();
        context.insert("items".to_string(), expr::Value::Array(vec![
            expr::Value::Number(1.0),
            expr::Value::Number(2.0),
            expr::Value::Number(3.0),
        ]));
        let node = plan.node("L").unwrap();
        let (status, _) = execute_for_each_node(
            &store,
            &driver,
            "r1",
            &plan,
            node,
            &context,
            CancellationToken::new(),
            ForEachFailureMode::FailFast,
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(status, NodeStatus::Succeeded);

        let events = store.list_events("r1", 0, None).await.unwrap();
        let loop_started = events.iter().find(|e| e.event_type == EventType::LoopStarted).unwrap();
        assert_eq!(loop_started.data["total"], 3);

        let iterations: Vec<_> = events.iter().filter(|e| e.event_type == EventType::LoopIteration).collect();
        assert_eq!(iterations.len(), 3);
        assert!(iterations.iter().all(|e| e.data["ok"] == true));

        for index in 0..3 {
            let namespaced = format!("B[{index}]");
            assert!(events.iter().any(|e| {
                e.event_type == EventType::NodeStatus
                    && e.node_id.as_deref() == Some(namespaced.as_str())
                    && e.data["status"] == "succeeded"
            }));
        }

        let loop_complete = events.iter().find(|e| e.event_type == EventType::LoopComplete).unwrap();
        assert_eq!(loop_complete.data["failed"], false);
    }

    #[tokio::test]
    async fn timed_out_node_reports_failed_with_reason_on_its_node_status_event() {
        let mut node = shell_node("A", "sleep 5");
        node.timeout = Some(0);
        let plan = Plan { nodes: vec![node], edges: vec![] };
        let (store, status) = run_plan(plan).await;
        assert_eq!(status, RunStatus::Failed);

        let events = store.list_events("r1", 0, None).await.unwrap();
        assert!(events.iter().any(|e| {
            e.event_type == EventType::NodeStatus
                && e.node_id.as_deref() == Some("A")
                && e.data["status"] == "failed"
                && e.data["reason"] == "timeout"
        }));
    }

    #[tokio::test]
    async fn cancel_marks_in_flight_nodes_failed_and_run_cancelled() {
        let plan = Plan {
            nodes: vec![shell_node("A", "sleep 2")],
            edges: vec![],
        };
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        store.create_run(crate::model::Run::new("r1", plan.clone())).await.unwrap();
        let driver: Arc<dyn Driver> = Arc::new(LocalProcessDriver::new());
        let flow_store: Arc<dyn FlowStore> = Arc::new(InMemoryFlowStore::new());
        let scheduler = Scheduler::new(store.clone(), driver, flow_store, SchedulerConfig::default());
        let cancel = CancellationToken::new();
        let cancel_for_task = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_for_task.cancel();
        });
        scheduler.run("r1", plan, cancel).await.unwrap();
        let run = store.get_run("r1").await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }
}
