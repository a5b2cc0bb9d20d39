//! Chunk dependency resolution.
//!
//! Dependencies form a DAG over chunk ids. Rules only ever point at lower
//! indices, so a chunk can be checked against the results stored so far
//! without any graph traversal.

use super::chunk::{Chunk, ChunkId};
use super::queue::TaskQueue;
use crate::config::{DependencyPolicy, DependencyRule};
use crate::error::{Error, Result};

/// Assigns dependencies at creation and picks the next dispatchable chunk.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    rule: DependencyRule,
    policy: DependencyPolicy,
}

impl DependencyResolver {
    pub fn new(rule: DependencyRule, policy: DependencyPolicy) -> Self {
        Self { rule, policy }
    }

    /// Dependency ids for the chunk at `index`.
    pub fn dependencies_for(&self, index: usize) -> Result<Vec<ChunkId>> {
        let deps = match &self.rule {
            DependencyRule::None => Vec::new(),
            DependencyRule::Chain if index > 0 => vec![index - 1],
            DependencyRule::Chain => Vec::new(),
            DependencyRule::Anchor { every } if *every > 0 && index > 0 && index % every == 0 => {
                vec![0]
            }
            DependencyRule::Anchor { .. } => Vec::new(),
            DependencyRule::Explicit { edges } => {
                let deps = edges.get(&index).cloned().unwrap_or_default();
                if let Some(bad) = deps.iter().find(|d| **d >= index) {
                    return Err(Error::dependency(format!(
                        "chunk {} may only depend on lower indices (found {})",
                        index, bad
                    )));
                }
                deps
            }
        };
        Ok(deps.into_iter().map(|d| ChunkId::new(d as u64)).collect())
    }

    /// Attach dependencies to a freshly created chunk.
    pub fn assign(&self, chunk: &mut Chunk) -> Result<()> {
        chunk.dependencies = self.dependencies_for(chunk.index())?;
        Ok(())
    }

    /// A chunk is processable when every dependency has a stored success.
    pub fn is_processable(&self, chunk: &Chunk, succeeded: impl Fn(ChunkId) -> bool) -> bool {
        chunk.dependencies().iter().all(|dep| succeeded(*dep))
    }

    /// Remove and return the next chunk to dispatch.
    ///
    /// Scans for the first chunk with resolved dependencies. When there is
    /// none, the best-effort policy falls back to the head of the queue. The
    /// strict policy only does so when `can_wait` is false, i.e. no in-flight
    /// or delayed work could still resolve a dependency.
    pub fn next_processable(
        &self,
        queue: &mut TaskQueue,
        succeeded: impl Fn(ChunkId) -> bool,
        can_wait: bool,
    ) -> Option<Chunk> {
        if queue.is_empty() {
            return None;
        }
        let ready = queue.iter().position(|c| self.is_processable(c, &succeeded));
        if let Some(position) = ready {
            return queue.remove(position);
        }

        match self.policy {
            DependencyPolicy::BestEffort => {
                let chunk = queue.pop_front();
                if let Some(chunk) = &chunk {
                    tracing::debug!("{} dispatched with unresolved dependencies", chunk.id());
                }
                chunk
            }
            DependencyPolicy::Strict if can_wait => None,
            DependencyPolicy::Strict => {
                let chunk = queue.pop_front();
                if let Some(chunk) = &chunk {
                    tracing::warn!(
                        "{} dispatched with unresolved dependencies: nothing left to wait on",
                        chunk.id()
                    );
                }
                chunk
            }
        }
    }
}
