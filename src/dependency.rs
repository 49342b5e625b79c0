use std::collections::{HashMap, HashSet};

use hive_worker_job::{Job, JobStatus};

use crate::errors::{Result, ValidationError};
use crate::store::JobStore;

/// Outcome of checking a job's prerequisites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Every dependency is completed.
    Ready,
    /// Some dependencies are still in flight.
    Waiting(Vec<i64>),
    /// A dependency ended unsuccessfully or no longer exists.
    Failed { dependency_id: i64 },
}

pub const DEPENDENCY_FAILED: &str = "dependency failed";

/// Decides readiness from the current statuses of `job`'s dependencies.
/// Ids absent from `statuses` are treated as missing.
pub fn resolve(job: &Job, statuses: &HashMap<i64, JobStatus>) -> Resolution {
    let mut waiting = Vec::new();
    for id in job.depends_on() {
        match statuses.get(id) {
            Some(JobStatus::Completed) => {}
            Some(status) if status.is_terminal() => {
                return Resolution::Failed { dependency_id: *id };
            }
            Some(_) => waiting.push(*id),
            None => return Resolution::Failed { dependency_id: *id },
        }
    }
    if waiting.is_empty() {
        Resolution::Ready
    } else {
        Resolution::Waiting(waiting)
    }
}

/// Fetches the dependencies of `job` and resolves them.
pub async fn resolve_from_store(store: &dyn JobStore, job: &Job) -> Result<Resolution> {
    if job.depends_on().is_empty() {
        return Ok(Resolution::Ready);
    }
    let statuses = store
        .get_jobs(job.depends_on())
        .await?
        .into_iter()
        .map(|dep| (dep.id(), dep.status()))
        .collect();
    Ok(resolve(job, &statuses))
}

/// Returns a job on a cycle reachable from `roots` in `graph`, if any.
///
/// `graph` maps a job id to the ids it depends on. Ids without an entry are
/// treated as leaves.
pub fn find_cycle(graph: &HashMap<i64, Vec<i64>>, roots: &[i64]) -> Option<i64> {
    #[derive(Clone, Copy)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: HashMap<i64, Mark> = HashMap::new();
    for &root in roots {
        if marks.contains_key(&root) {
            continue;
        }
        // (node, index of the next child to visit)
        let mut stack = vec![(root, 0usize)];
        marks.insert(root, Mark::Visiting);
        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            let children = graph.get(&node).map(Vec::as_slice).unwrap_or(&[]);
            if let Some(&child) = children.get(frame.1) {
                frame.1 += 1;
                match marks.get(&child) {
                    Some(Mark::Visiting) => return Some(child),
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(child, Mark::Visiting);
                        stack.push((child, 0));
                    }
                }
            } else {
                marks.insert(node, Mark::Done);
                stack.pop();
            }
        }
    }
    None
}

/// Checks the dependencies of a job about to be enqueued: every id must
/// exist, none may be the job itself, and the transitive closure must stay
/// acyclic.
///
/// `job_id` is `None` for jobs that have not been assigned an id yet.
pub async fn validate_dependencies(
    store: &dyn JobStore,
    job_id: Option<i64>,
    depends_on: &[i64],
) -> Result<()> {
    if let Some(id) = job_id {
        if depends_on.contains(&id) {
            return Err(ValidationError::SelfDependency(id).into());
        }
    }

    let mut graph: HashMap<i64, Vec<i64>> = HashMap::new();
    let mut seen: HashSet<i64> = depends_on.iter().copied().collect();
    let mut frontier: Vec<i64> = seen.iter().copied().collect();
    let mut first_level = true;

    while !frontier.is_empty() {
        let found = store.get_jobs(&frontier).await?;
        if first_level {
            let existing: HashSet<i64> = found.iter().map(|j| j.id()).collect();
            if let Some(missing) = depends_on.iter().find(|id| !existing.contains(*id)) {
                return Err(ValidationError::UnknownDependency(*missing).into());
            }
            first_level = false;
        }

        let mut next = Vec::new();
        for dep in found {
            for &child in dep.depends_on() {
                if Some(child) == job_id {
                    return Err(ValidationError::DependencyCycle(child).into());
                }
                if seen.insert(child) {
                    next.push(child);
                }
            }
            graph.insert(dep.id(), dep.depends_on().clone());
        }
        frontier = next;
    }

    match find_cycle(&graph, depends_on) {
        Some(id) => Err(ValidationError::DependencyCycle(id).into()),
        None => Ok(()),
    }
}
