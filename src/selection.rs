//! Picking one remote builder out of several candidates.

use std::sync::Arc;

use crate::errors::SelectionError;
use crate::remote::RemoteBuilder;

pub trait BuilderSelectionStrategy: Send + Sync {
    /// Picks one of `candidates`. Fails only when `candidates` is empty.
    fn select(&self, candidates: &[Arc<RemoteBuilder>]) -> Result<Arc<RemoteBuilder>, SelectionError>;
}

/// Prefers the builder used most recently; ties go to the earliest candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct LastInUseBuilderSelectionStrategy;

impl BuilderSelectionStrategy for LastInUseBuilderSelectionStrategy {
    fn select(&self, candidates: &[Arc<RemoteBuilder>]) -> Result<Arc<RemoteBuilder>, SelectionError> {
        let mut best: Option<&Arc<RemoteBuilder>> = None;
        for candidate in candidates {
            match best {
                Some(current) if candidate.last_usage_time() <= current.last_usage_time() => {}
                _ => best = Some(candidate),
            }
        }
        best.cloned().ok_or(SelectionError::NoCandidates)
    }
}
