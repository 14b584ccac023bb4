//! Job-to-job dependency graph.
//!
//! Edges point from a job to the jobs it depends on; a reverse index of
//! dependents makes unblocking O(dependents). A job may depend on an
//! identifier that has not been submitted yet; it stays blocked until that
//! job is registered and succeeds.
//!
//! Archived successes leave a timestamped marker so late dependents still see
//! them satisfied; [`DependencyResolver::purge_archived`] drops old markers
//! nobody is waiting on.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{JobId, QueueError, QueueResult};

/// Resolver-side view of a registered job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not yet succeeded (blocked, queued, running or retrying)
    Pending,
    Succeeded,
    /// Dead-lettered; dependents stay blocked
    Failed,
    /// Canceled; dependents stay blocked
    Canceled,
}

#[derive(Debug, Default)]
struct Graph {
    nodes: HashMap<JobId, NodeStatus>,
    /// job -> jobs it depends on
    dependencies: HashMap<JobId, Vec<JobId>>,
    /// job -> jobs waiting on it, in registration order
    dependents: HashMap<JobId, Vec<JobId>>,
    /// Success markers of forgotten jobs, by archive time
    archived: HashMap<JobId, DateTime<Utc>>,
}

impl Graph {
    fn is_satisfied(&self, job_id: &JobId) -> bool {
        self.nodes.get(job_id) == Some(&NodeStatus::Succeeded) || self.archived.contains_key(job_id)
    }

    fn is_ready(&self, job_id: &JobId) -> bool {
        self.nodes.contains_key(job_id)
            && self
                .dependencies
                .get(job_id)
                .map_or(true, |deps| deps.iter().all(|dep| self.is_satisfied(dep)))
    }

    /// Search for a path from `job_id` back to itself through `deps`.
    ///
    /// Iterative DFS, O(V + E). Returns the closing path, e.g. `[c, a, b, c]`.
    fn find_cycle(&self, job_id: &JobId, deps: &[JobId]) -> Option<Vec<JobId>> {
        if deps.contains(job_id) {
            return Some(vec![job_id.clone(), job_id.clone()]);
        }

        let mut parent: HashMap<&JobId, &JobId> = HashMap::new();
        let mut stack: Vec<&JobId> = Vec::new();
        for dep in deps {
            if !parent.contains_key(dep) {
                parent.insert(dep, job_id);
                stack.push(dep);
            }
        }

        while let Some(node) = stack.pop() {
            let Some(next_deps) = self.dependencies.get(node) else {
                continue;
            };
            for next in next_deps {
                if next == job_id {
                    let mut path = vec![node.clone()];
                    let mut cursor = node;
                    while let Some(prev) = parent.get(cursor) {
                        path.push((*prev).clone());
                        if *prev == job_id {
                            break;
                        }
                        cursor = prev;
                    }
                    path.reverse();
                    path.push(job_id.clone());
                    return Some(path);
                }
                if !parent.contains_key(next) {
                    parent.insert(next, node);
                    stack.push(next);
                }
            }
        }

        None
    }

    fn unlink_dependencies(&mut self, job_id: &JobId) {
        for dep in self.dependencies.remove(job_id).unwrap_or_default() {
            if let Some(waiting) = self.dependents.get_mut(&dep) {
                waiting.retain(|id| id != job_id);
                if waiting.is_empty() {
                    self.dependents.remove(&dep);
                }
            }
        }
    }

    fn pending_dependents(&self, job_id: &JobId) -> Vec<JobId> {
        self.dependents
            .get(job_id)
            .map(|waiting| {
                waiting
                    .iter()
                    .filter(|id| self.nodes.get(*id) == Some(&NodeStatus::Pending))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Directed acyclic graph of job dependencies
#[derive(Debug, Default)]
pub struct DependencyResolver {
    graph: Mutex<Graph>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job and its dependency edges.
    ///
    /// Fails with [`QueueError::CycleDetected`] if the edges would close a
    /// cycle; nothing is committed in that case.
    pub fn add_job<I>(&self, job_id: &JobId, depends_on: I) -> QueueResult<()>
    where
        I: IntoIterator<Item = JobId>,
    {
        let mut deps: Vec<JobId> = Vec::new();
        for dep in depends_on {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }

        let mut graph = self.graph.lock();
        if graph.nodes.contains_key(job_id) || graph.archived.contains_key(job_id) {
            return Err(QueueError::DuplicateJob(job_id.clone()));
        }
        if let Some(path) = graph.find_cycle(job_id, &deps) {
            return Err(QueueError::CycleDetected {
                job_id: job_id.clone(),
                path,
            });
        }

        for dep in &deps {
            graph
                .dependents
                .entry(dep.clone())
                .or_default()
                .push(job_id.clone());
        }
        graph.dependencies.insert(job_id.clone(), deps);
        graph.nodes.insert(job_id.clone(), NodeStatus::Pending);
        Ok(())
    }

    /// True iff the job is registered and every dependency has succeeded
    pub fn is_ready(&self, job_id: &JobId) -> bool {
        self.graph.lock().is_ready(job_id)
    }

    /// Dependencies that have not succeeded yet, in declaration order
    pub fn unsatisfied_dependencies(&self, job_id: &JobId) -> Vec<JobId> {
        let graph = self.graph.lock();
        graph
            .dependencies
            .get(job_id)
            .map(|deps| {
                deps.iter()
                    .filter(|dep| !graph.is_satisfied(dep))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mark a job succeeded; returns dependents that just became ready
    pub fn mark_complete(&self, job_id: &JobId) -> Vec<JobId> {
        let mut graph = self.graph.lock();
        if let Some(status) = graph.nodes.get_mut(job_id) {
            *status = NodeStatus::Succeeded;
        }

        graph
            .pending_dependents(job_id)
            .into_iter()
            .filter(|dependent| graph.is_ready(dependent))
            .collect()
    }

    /// Mark a job failed. Dependents are left blocked.
    pub fn mark_failed(&self, job_id: &JobId) {
        if let Some(status) = self.graph.lock().nodes.get_mut(job_id) {
            *status = NodeStatus::Failed;
        }
    }

    /// Cancel a job: drop its own edges and return the dependents that can
    /// now never become ready. The identifier stays reserved.
    pub fn remove(&self, job_id: &JobId) -> Vec<JobId> {
        let mut graph = self.graph.lock();
        if !graph.nodes.contains_key(job_id) {
            return Vec::new();
        }
        graph.unlink_dependencies(job_id);
        graph.nodes.insert(job_id.clone(), NodeStatus::Canceled);
        graph.pending_dependents(job_id)
    }

    /// Drop an archived job. A success leaves a marker stamped `archived_at`
    /// so later dependents still see the dependency satisfied.
    pub fn forget(&self, job_id: &JobId, archived_at: DateTime<Utc>) {
        let mut graph = self.graph.lock();
        graph.unlink_dependencies(job_id);
        if graph.nodes.remove(job_id) == Some(NodeStatus::Succeeded) {
            graph.archived.insert(job_id.clone(), archived_at);
        }
        if graph.pending_dependents(job_id).is_empty() {
            graph.dependents.remove(job_id);
        }
    }

    /// Drop success markers archived before `before` that no pending job
    /// depends on. Returns the number dropped.
    ///
    /// A job submitted later against a purged id waits for a new job with
    /// that id, like any forward reference.
    pub fn purge_archived(&self, before: DateTime<Utc>) -> usize {
        let mut graph = self.graph.lock();
        let expired: Vec<JobId> = graph
            .archived
            .iter()
            .filter(|(job_id, archived_at)| {
                **archived_at < before && graph.pending_dependents(job_id).is_empty()
            })
            .map(|(job_id, _)| job_id.clone())
            .collect();

        for job_id in &expired {
            graph.archived.remove(job_id);
            graph.dependents.remove(job_id);
        }
        expired.len()
    }

    /// Success markers still held for archived jobs
    pub fn archived_len(&self) -> usize {
        self.graph.lock().archived.len()
    }

    pub fn status(&self, job_id: &JobId) -> Option<NodeStatus> {
        self.graph.lock().nodes.get(job_id).copied()
    }

    /// Registered jobs waiting on `job_id`
    pub fn dependents(&self, job_id: &JobId) -> Vec<JobId> {
        self.graph
            .lock()
            .dependents
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn dependencies(&self, job_id: &JobId) -> Vec<JobId> {
        self.graph
            .lock()
            .dependencies
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Pending jobs in an order that respects every dependency edge
    /// (Kahn's algorithm). Ties are broken by identifier.
    pub fn topological_order(&self) -> Vec<JobId> {
        let graph = self.graph.lock();
        let pending: HashSet<&JobId> = graph
            .nodes
            .iter()
            .filter(|(_, status)| **status == NodeStatus::Pending)
            .map(|(id, _)| id)
            .collect();

        let mut in_degree: HashMap<&JobId, usize> = pending
            .iter()
            .map(|id| {
                let count = graph.dependencies.get(*id).map_or(0, |deps| {
                    deps.iter().filter(|dep| pending.contains(dep)).count()
                });
                (*id, count)
            })
            .collect();

        let mut roots: Vec<&JobId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        roots.sort();
        let mut queue: VecDeque<&JobId> = roots.into();

        let mut order = Vec::with_capacity(pending.len());
        while let Some(job_id) = queue.pop_front() {
            order.push(job_id.clone());

            let mut unlocked = Vec::new();
            for dependent in graph.dependents.get(job_id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        unlocked.push(dependent);
                    }
                }
            }
            unlocked.sort();
            queue.extend(unlocked);
        }

        assert_eq!(
            order.len(),
            pending.len(),
            "dependency graph contains a cycle"
        );
        order
    }

    /// Number of registered jobs
    pub fn len(&self) -> usize {
        self.graph.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
