//! Resource backed by a local tab-delimited file.
//!
//! ## File format
//! ```text
//! # comment lines and blank lines are ignored
//! <local_element_id>\t<context 1>\t<context 2>…
//! ```
//! Every line must carry exactly one column per declared context plus the
//! element id. A mismatch anywhere rejects the whole file.

use std::fs;
use std::path::PathBuf;

use super::{Element, Resource, Structure};
use crate::config::ResourceConfig;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct TabFileResource {
    id: String,
    name: String,
    path: PathBuf,
    structure: Structure,
    url_template: String,
    large_scale: bool,
}

impl TabFileResource {
    pub const IMPLEMENTATION: &'static str = "tab_file";

    pub fn new(id: &str, name: &str, path: PathBuf, structure: Structure, url_template: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            path,
            structure,
            url_template: url_template.to_string(),
            large_scale: false,
        }
    }

    pub fn large_scale(mut self, large_scale: bool) -> Self {
        self.large_scale = large_scale;
        self
    }

    pub fn from_config(config: &ResourceConfig) -> Result<Box<dyn Resource>, AppError> {
        let path = config.path.clone().ok_or_else(|| {
            AppError::Config(format!("resource {}: tab_file requires `path`", config.id))
        })?;
        if config.contexts.is_empty() {
            return Err(AppError::Config(format!(
                "resource {}: at least one context must be declared",
                config.id
            )));
        }
        let resource = Self::new(
            &config.id,
            &config.name,
            path,
            Structure::new(config.contexts.clone()),
            &config.url_template,
        )
        .large_scale(config.large_scale);
        Ok(Box::new(resource))
    }

    fn parse(&self, content: &str) -> Result<Vec<Element>, AppError> {
        let names = self.structure.context_names();
        let expected = names.len() + 1;
        let mut elements = Vec::new();

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() != expected {
                return Err(AppError::Input(format!(
                    "{}:{}: expected {expected} tab-separated columns, found {}",
                    self.path.display(),
                    lineno + 1,
                    cols.len()
                )));
            }
            let local_id = cols[0].trim();
            if local_id.is_empty() {
                return Err(AppError::Input(format!(
                    "{}:{}: empty element id",
                    self.path.display(),
                    lineno + 1
                )));
            }
            let contexts = names
                .iter()
                .zip(&cols[1..])
                .filter(|(_, v)| !v.trim().is_empty())
                .map(|(name, v)| (*name, v.trim()));
            elements.push(Element::new(local_id, contexts));
        }
        Ok(elements)
    }
}

impl Resource for TabFileResource {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn structure(&self) -> &Structure {
        &self.structure
    }

    fn fetch_elements(&self) -> Result<Vec<Element>, AppError> {
        let content = fs::read_to_string(&self.path)
            .map_err(|e| AppError::Input(format!("{}: cannot read: {e}", self.path.display())))?;
        self.parse(&content)
    }

    fn element_url(&self, local_element_id: &str) -> String {
        self.url_template.replace("{id}", local_element_id)
    }

    fn is_large_scale(&self) -> bool {
        self.large_scale
    }
}
