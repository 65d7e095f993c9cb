//! Ref resolution and the head table.
//!
//! A ref names a dataset by `username/name`. The logbook's name index maps
//! it to a lineage; the head table (or, failing that, the lineage's latest
//! commit whose root block is held) gives the version path. Head updates
//! are compare-and-swap, so two writers racing on one dataset never
//! silently overwrite each other.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use dsnet_core::{BlockId, DatasetId, Ref};
use dsnet_store::{CasResult, ContentStore, LogStore, RefStore};

use crate::error::{LogbookError, Result};
use crate::logbook::{Lineage, Logbook};

/// A ref bound to a lineage and a version path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRef {
    pub dataset: DatasetId,
    pub username: String,
    pub name: String,
    pub path: BlockId,
}

impl ResolvedRef {
    pub fn to_ref(&self) -> Ref {
        Ref::new(self.username.clone(), self.name.clone()).at(self.path)
    }
}

/// Resolves refs against a logbook and maintains the head table.
pub struct RefResolver<S: ?Sized> {
    logbook: Arc<Logbook<S>>,
}

impl<S: ?Sized> Clone for RefResolver<S> {
    fn clone(&self) -> Self {
        Self {
            logbook: self.logbook.clone(),
        }
    }
}

impl<S: ContentStore + LogStore + RefStore + ?Sized> RefResolver<S> {
    pub fn new(logbook: Arc<Logbook<S>>) -> Self {
        Self { logbook }
    }

    pub fn logbook(&self) -> &Arc<Logbook<S>> {
        &self.logbook
    }

    /// The lineage currently called `username/name`.
    pub async fn lineage(&self, r: &Ref) -> Result<Lineage> {
        self.logbook
            .find(&r.username, &r.name)
            .await
            .ok_or_else(|| LogbookError::RefNotFound(r.alias()))
    }

    /// Resolve to a lineage and version path.
    ///
    /// A pinned ref must name a commit of the lineage. An unpinned ref
    /// takes the recorded head, then the latest commit this node holds.
    pub async fn resolve(&self, r: &Ref) -> Result<ResolvedRef> {
        let lineage = self.lineage(r).await?;

        let path = match r.path {
            Some(path) => {
                if !self.logbook.has_commit(&lineage.dataset, &path).await {
                    return Err(LogbookError::RefNotFound(r.to_string()));
                }
                path
            }
            None => self
                .head(&lineage)
                .await?
                .ok_or_else(|| LogbookError::RefNotFound(r.to_string()))?,
        };

        debug!(reference = %r, dataset = %lineage.dataset, path = %path, "resolved ref");
        Ok(ResolvedRef {
            dataset: lineage.dataset,
            username: lineage.username,
            name: lineage.name,
            path,
        })
    }

    async fn head(&self, lineage: &Lineage) -> Result<Option<BlockId>> {
        let store = self.logbook.store();
        if let Some(recorded) = store.get_head(&lineage.dataset).await? {
            return Ok(Some(recorded));
        }
        // History can arrive ahead of the blocks it names.
        for path in lineage.commits.iter().rev() {
            if store.has_block(path).await? {
                return Ok(Some(*path));
            }
        }
        Ok(None)
    }

    /// The recorded head only, without the commit fallback.
    pub async fn recorded_head(&self, dataset: &DatasetId) -> Result<Option<BlockId>> {
        Ok(self.logbook.store().get_head(dataset).await?)
    }

    /// Move the head from `expected` to `new`. Fails with `HeadConflict`
    /// if someone else moved it first.
    pub async fn update_head(
        &self,
        dataset: &DatasetId,
        expected: Option<BlockId>,
        new: Option<BlockId>,
    ) -> Result<()> {
        match self
            .logbook
            .store()
            .compare_and_swap_head(dataset, expected, new)
            .await?
        {
            CasResult::Swapped => {
                debug!(dataset = %dataset, ?expected, ?new, "head updated");
                Ok(())
            }
            CasResult::Conflict { actual } => {
                warn!(dataset = %dataset, ?expected, ?actual, "head conflict");
                Err(LogbookError::HeadConflict {
                    dataset: *dataset,
                    expected,
                    actual,
                })
            }
        }
    }

    /// Every live lineage that resolves to a path.
    pub async fn list(&self) -> Result<Vec<ResolvedRef>> {
        let mut out = Vec::new();
        for lineage in self.logbook.lineages().await {
            if lineage.deleted {
                continue;
            }
            if let Some(path) = self.head(&lineage).await? {
                out.push(ResolvedRef {
                    dataset: lineage.dataset,
                    username: lineage.username,
                    name: lineage.name,
                    path,
                });
            }
        }
        Ok(out)
    }
}
