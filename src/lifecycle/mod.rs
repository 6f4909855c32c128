//! Ontology version lifecycle.
//!
//! Several local versions of one virtual ontology may be loaded at once
//! (a new release arrives before the old one is retired). The manager keeps
//! one version per virtual id and purges the rest:
//!
//! ```text
//!   for each retired version v:
//!     for each registered resource r:      (size-tiered, see `removal`)
//!       index → concept frequency → aggregation → expanded → direct
//!     delete concepts of v                  (terms, relations, maps cascade)
//!     delete ontology row v
//! ```
//!
//! Every step is idempotent, so a sweep interrupted halfway is completed by
//! the next one. A version that fails to purge is logged and skipped.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{error, info};

use crate::aggregation::AggregationEngine;
use crate::annotation::AnnotationEngine;
use crate::error::AppError;
use crate::expansion::SemanticExpansionEngine;
use crate::indexation::{IndexPolicy, IndexationEngine};
use crate::ontology::{Ontology, OntologyGraphStore};
use crate::removal::RemovalReport;
use crate::resource::ResourceStore;
use crate::store::Store;
use crate::tagger::StopList;

/// Which version of a virtual ontology survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetainPolicy {
    /// The most recently loaded version.
    #[default]
    LatestLoaded,
    /// The greatest version string, compared with digit runs as numbers.
    HighestVersion,
}

impl RetainPolicy {
    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "latest_loaded" => Ok(RetainPolicy::LatestLoaded),
            "highest_version" => Ok(RetainPolicy::HighestVersion),
            other => Err(AppError::Config(format!(
                "unknown retain policy '{other}' (expected latest_loaded or highest_version)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleReport {
    /// Surviving local version per processed virtual id.
    pub retained: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
    /// Derived-row deletes across all resources.
    pub derived: RemovalReport,
}

pub struct OntologyLifecycleManager {
    store: Arc<Store>,
    graph: OntologyGraphStore,
    resources: ResourceStore,
}

impl OntologyLifecycleManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            graph: OntologyGraphStore::new(store.clone()),
            resources: ResourceStore::new(store.clone()),
            store,
        }
    }

    /// Virtual ids with more than one loaded version, versions in load order.
    pub fn duplicated_virtual_ontologies(&self) -> Result<BTreeMap<String, Vec<Ontology>>, AppError> {
        let mut groups: BTreeMap<String, Vec<Ontology>> = BTreeMap::new();
        for ontology in self.graph.ontologies()? {
            groups
                .entry(ontology.virtual_ontology_id.clone())
                .or_default()
                .push(ontology);
        }
        groups.retain(|_, versions| versions.len() > 1);
        Ok(groups)
    }

    /// Keep one version of every duplicated virtual ontology.
    pub fn sweep(&self, policy: RetainPolicy) -> Result<LifecycleReport, AppError> {
        let mut report = LifecycleReport::default();
        for (virtual_id, versions) in self.duplicated_virtual_ontologies()? {
            self.retain_one(&virtual_id, versions, policy, &mut report)?;
        }
        info!(
            removed = report.removed.len(),
            failed = report.failed.len(),
            "ontology dedup sweep finished"
        );
        Ok(report)
    }

    /// Called after a new version of `virtual_ontology_id` was loaded.
    pub fn on_new_version(&self, virtual_ontology_id: &str, policy: RetainPolicy) -> Result<LifecycleReport, AppError> {
        let versions: Vec<Ontology> = self
            .graph
            .ontologies()?
            .into_iter()
            .filter(|o| o.virtual_ontology_id == virtual_ontology_id)
            .collect();
        let mut report = LifecycleReport::default();
        if versions.len() > 1 {
            self.retain_one(virtual_ontology_id, versions, policy, &mut report)?;
        }
        Ok(report)
    }

    /// Purge one local version: derived rows in every registered resource,
    /// then its concepts, then the ontology row. `Ok(false)` when the
    /// version is not loaded.
    pub fn remove_ontology(&self, local_ontology_id: &str) -> Result<(bool, RemovalReport), AppError> {
        let ids = vec![local_ontology_id.to_string()];
        let annotation = AnnotationEngine::new(self.store.clone(), StopList::default());
        let expansion = SemanticExpansionEngine::new(self.store.clone());
        let aggregation = AggregationEngine::new(self.store.clone());
        let indexation = IndexationEngine::new(self.store.clone(), IndexPolicy::default());

        let mut derived = RemovalReport::default();
        for ctx in self.resources.registered()? {
            derived.merge(indexation.remove_index(&ctx, &ids)?);
            derived.merge(aggregation.remove_concept_frequency(&ctx, &ids)?);
            derived.merge(aggregation.remove_aggregation(&ctx, &ids)?);
            derived.merge(expansion.remove_expanded_annotations(&ctx, &ids)?);
            derived.merge(annotation.remove_annotations(&ctx, &ids)?);
        }
        let deleted = self.graph.delete_ontology(local_ontology_id)?;
        info!(local_ontology_id, deleted, derived_rows = derived.rows, "ontology version removed");
        Ok((deleted, derived))
    }

    fn retain_one(
        &self,
        virtual_id: &str,
        versions: Vec<Ontology>,
        policy: RetainPolicy,
        report: &mut LifecycleReport,
    ) -> Result<(), AppError> {
        let Some(keep) = select_retained(&versions, policy) else {
            return Ok(());
        };
        let keep = keep.local_ontology_id.clone();
        report.retained.push(keep.clone());

        let mut purged = 0;
        for version in versions.iter().filter(|v| v.local_ontology_id != keep) {
            match self.remove_ontology(&version.local_ontology_id) {
                Ok((_, derived)) => {
                    report.derived.merge(derived);
                    report.removed.push(version.local_ontology_id.clone());
                    purged += 1;
                }
                Err(e) => {
                    error!(
                        virtual_ontology_id = %virtual_id,
                        local_ontology_id = %version.local_ontology_id,
                        "removing superseded version failed: {e}"
                    );
                    report.failed.push(version.local_ontology_id.clone());
                }
            }
        }
        if purged > 0 {
            info!(virtual_ontology_id = %virtual_id, kept = %keep, purged, "superseded versions purged");
        }
        Ok(())
    }
}

/// The version `policy` keeps; ties fall back to load order.
pub fn select_retained(versions: &[Ontology], policy: RetainPolicy) -> Option<&Ontology> {
    match policy {
        RetainPolicy::LatestLoaded => versions.iter().max_by_key(|o| o.id),
        RetainPolicy::HighestVersion => versions
            .iter()
            .max_by(|a, b| natural_cmp(&a.version, &b.version).then(a.id.cmp(&b.id))),
    }
}

/// Compare version strings with digit runs taken as numbers:
/// `"2.10" > "2.9"`, `"v10" > "v9"`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a, b);
    loop {
        match (a.chars().next(), b.chars().next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let (na, ra) = split_digits(a);
                let (nb, rb) = split_digits(b);
                let na = na.trim_start_matches('0');
                let nb = nb.trim_start_matches('0');
                let ord = na.len().cmp(&nb.len()).then_with(|| na.cmp(nb));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = ra;
                b = rb;
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a = &a[x.len_utf8()..];
                b = &b[y.len_utf8()..];
            }
        }
    }
}

fn split_digits(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}
