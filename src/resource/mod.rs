//! Resources: the external data sources whose elements get annotated.
//!
//! A resource is anything implementing [`Resource`]: it describes its
//! [`Structure`] (named, weighted contexts), fetches its [`Element`]s and
//! builds a URL for each element. Implementations are chosen by name through
//! the [`ResourceRegistry`]; there is no dynamic loading.
//!
//! Per-run state is carried in an explicit [`ResourceContext`] value handed
//! to every pipeline stage.

pub mod registry;
pub mod store;
pub mod tab_file;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::ontology::OntologyScope;

pub use registry::{ResourceFactory, ResourceRegistry};
pub use store::{ResourceStore, StoredElement};
pub use tab_file::TabFileResource;

/// Weight class of a text context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextWeight {
    Primary,
    Secondary,
}

/// One named field of an element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSpec {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: ContextWeight,
    /// Set for concept fields: the context already holds controlled
    /// vocabulary values, resolved directly against these virtual
    /// ontologies (an empty list means any loaded ontology).
    #[serde(default)]
    pub concept_ontologies: Option<Vec<String>>,
}

fn default_weight() -> ContextWeight {
    ContextWeight::Primary
}

impl ContextSpec {
    pub fn text(name: &str, weight: ContextWeight) -> Self {
        Self {
            name: name.to_string(),
            weight,
            concept_ontologies: None,
        }
    }

    pub fn concept_field(name: &str, ontologies: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            weight: ContextWeight::Primary,
            concept_ontologies: Some(ontologies.iter().map(|s| s.to_string()).collect()),
        }
    }

    pub fn is_concept_field(&self) -> bool {
        self.concept_ontologies.is_some()
    }

    /// Lookup scope for a concept field; `None` for text contexts.
    pub fn concept_scope(&self) -> Option<OntologyScope> {
        self.concept_ontologies.as_ref().map(|ids| {
            if ids.is_empty() {
                OntologyScope::All
            } else {
                OntologyScope::Virtual(ids.clone())
            }
        })
    }
}

/// The declared shape of a resource's elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    pub contexts: Vec<ContextSpec>,
}

impl Structure {
    pub fn new(contexts: Vec<ContextSpec>) -> Self {
        Self { contexts }
    }

    pub fn context(&self, name: &str) -> Option<&ContextSpec> {
        self.contexts.iter().find(|c| c.name == name)
    }

    pub fn context_names(&self) -> Vec<&str> {
        self.contexts.iter().map(|c| c.name.as_str()).collect()
    }
}

/// One record of a resource: its local id and context values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub local_element_id: String,
    pub contexts: BTreeMap<String, String>,
}

impl Element {
    pub fn new<I, K, V>(local_element_id: &str, contexts: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            local_element_id: local_element_id.to_string(),
            contexts: contexts
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn value(&self, context: &str) -> Option<&str> {
        self.contexts.get(context).map(String::as_str)
    }
}

/// Capabilities every resource implementation provides.
pub trait Resource: Send + Sync {
    /// Stable resource identifier (e.g. `"GEO"`).
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn structure(&self) -> &Structure;

    /// The context shown first when an element is displayed.
    fn main_context(&self) -> &str {
        self.structure()
            .contexts
            .first()
            .map(|c| c.name.as_str())
            .unwrap_or("")
    }

    fn fetch_elements(&self) -> Result<Vec<Element>, AppError>;

    fn element_url(&self, local_element_id: &str) -> String;

    /// Large-scale resources remove derived rows one ontology version at a
    /// time.
    fn is_large_scale(&self) -> bool {
        false
    }
}

/// Explicit per-run context passed through every pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceContext {
    pub resource_id: String,
    pub structure: Structure,
    pub large_scale: bool,
    /// Dictionary used by the previous completed run, if any.
    pub last_dictionary_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concept_field_scope() {
        let all = ContextSpec::concept_field("species", &[]);
        assert_eq!(all.concept_scope(), Some(OntologyScope::All));
        let ncbi = ContextSpec::concept_field("species", &["1132"]);
        assert_eq!(ncbi.concept_scope(), Some(OntologyScope::Virtual(vec!["1132".into()])));
        assert_eq!(ContextSpec::text("title", ContextWeight::Primary).concept_scope(), None);
    }

    #[test]
    fn structure_deserializes_with_defaults() {
        let s: Structure = serde_json::from_str(
            r#"{"contexts":[{"name":"title"},{"name":"summary","weight":"secondary"},
                {"name":"organism","concept_ontologies":["1132"]}]}"#,
        )
        .unwrap();
        assert_eq!(s.context("title").unwrap().weight, ContextWeight::Primary);
        assert_eq!(s.context("summary").unwrap().weight, ContextWeight::Secondary);
        assert!(s.context("organism").unwrap().is_concept_field());
        assert_eq!(s.context_names(), vec!["title", "summary", "organism"]);
    }
}
