//! Configuration loading with env-var overrides.
//!
//! Reads TOML files, supports `[meta] base = "..."` inheritance chains,
//! and applies `RESOURCE_INDEX_WORK_DIR` and `RESOURCE_INDEX_LOG_LEVEL`
//! env overrides.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::aggregation::Weights;
use crate::error::AppError;
use crate::expansion::ExpansionModes;
use crate::indexation::IndexPolicy;
use crate::lifecycle::RetainPolicy;
use crate::store::RetryPolicy;

use super::raw::{RawConfig, RawResource, RawRetry, RawTagger};
use super::types::*;

pub const WORK_DIR_ENV: &str = "RESOURCE_INDEX_WORK_DIR";
pub const LOG_LEVEL_ENV: &str = "RESOURCE_INDEX_LOG_LEVEL";

/// Deep-merge two TOML values.
/// Tables are merged recursively; every other value in the overlay replaces
/// the base value wholesale.
fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, ov_val) in overlay_tbl {
                let merged = match base_tbl.remove(&key) {
                    Some(base_val) => merge_toml(base_val, ov_val),
                    None => ov_val,
                };
                base_tbl.insert(key, merged);
            }
            toml::Value::Table(base_tbl)
        }
        (_, overlay) => overlay,
    }
}

/// Read a config file, follow any `[meta] base = "..."` chain, and return
/// the merged value. `visited` holds canonical paths already seen so cycles
/// are reported instead of recursing forever.
fn load_raw_merged(path: &Path, visited: &mut HashSet<PathBuf>) -> Result<toml::Value, AppError> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(canonical) {
        return Err(AppError::Config(format!(
            "circular base reference detected at: {}",
            path.display()
        )));
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
    let overlay_val: toml::Value = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    match overlay_val
        .get("meta")
        .and_then(|m| m.get("base"))
        .and_then(|b| b.as_str())
    {
        Some(base_str) => {
            let base_path = if Path::new(base_str).is_absolute() {
                PathBuf::from(base_str)
            } else {
                path.parent().unwrap_or(Path::new(".")).join(base_str)
            };
            let base_val = load_raw_merged(&base_path, visited)?;
            Ok(merge_toml(base_val, overlay_val))
        }
        None => Ok(overlay_val),
    }
}

/// Load config from the given path, or `config/default.toml`, then apply
/// env-var overrides.
pub fn load(config_path: Option<&str>) -> Result<Config, AppError> {
    let work_dir_override = env::var(WORK_DIR_ENV).ok();
    let log_level_override = env::var(LOG_LEVEL_ENV).ok();
    let path = config_path.unwrap_or("config/default.toml");
    load_from(
        Path::new(path),
        work_dir_override.as_deref(),
        log_level_override.as_deref(),
    )
}

/// Internal loader: explicit path and overrides. Tests pass overrides
/// directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    work_dir_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, AppError> {
    let merged_val = load_raw_merged(path, &mut HashSet::new())?;
    let parsed: RawConfig = Deserialize::deserialize(merged_val).map_err(|e: toml::de::Error| {
        AppError::Config(format!("config error in {}: {e}", path.display()))
    })?;

    let work_dir = expand_home(work_dir_override.unwrap_or(&parsed.index.work_dir));
    let log_level = log_level_override.unwrap_or(&parsed.index.log_level).to_string();
    crate::logger::parse_filter(&log_level)
        .map_err(|e| AppError::Config(format!("[index] log_level in {}: {e}", path.display())))?;

    let weights = Weights {
        primary: parsed.weights.primary,
        secondary: parsed.weights.secondary,
        isa_factor: parsed.weights.isa_factor,
        mapping: parsed.weights.mapping,
        reported: parsed.weights.reported,
    };
    weights.validate()?;

    if parsed.index_policy.min_score.is_nan() || parsed.index_policy.min_score < 0.0 {
        return Err(AppError::Config(format!(
            "index_policy.min_score must be non-negative, got {}",
            parsed.index_policy.min_score
        )));
    }

    let ontology = OntologyConfig {
        populate: parsed.ontology.populate,
        feed_dir: resolve_path(&work_dir, &parsed.ontology.feed_dir),
        relation_files: parsed
            .ontology
            .relation_files
            .iter()
            .map(|p| resolve_path(&work_dir, p))
            .collect(),
        dedup: parsed.ontology.dedup,
        retain: RetainPolicy::parse(&parsed.ontology.retain)?,
    };

    let mut resources = Vec::with_capacity(parsed.pipeline.resources.len());
    for id in &parsed.pipeline.resources {
        let raw = parsed.resource.get(id).ok_or_else(|| {
            AppError::Config(format!("pipeline.resources lists '{id}' but [resource.{id}] is missing"))
        })?;
        resources.push(resolve_resource(&work_dir, id, raw));
    }

    let pipeline = PipelineConfig {
        process_resources: parsed.pipeline.process_resources,
        reinitialize: parse_reinitialize(&parsed.pipeline.reinitialize)?,
        update_elements: parsed.pipeline.update_elements,
        use_full_dictionary: parsed.pipeline.use_full_dictionary,
        annotation: parsed.pipeline.annotation,
        expansion: parsed.pipeline.expansion,
        aggregation: parsed.pipeline.aggregation,
        stop_words: parsed.pipeline.stop_words,
        resources: parsed.pipeline.resources,
    };

    Ok(Config {
        work_dir,
        log_level,
        ontology,
        pipeline,
        expansion: ExpansionModes {
            isa: parsed.expansion.isa,
            mapping: parsed.expansion.mapping,
            distance: parsed.expansion.distance,
        },
        weights,
        index_policy: IndexPolicy {
            min_score: parsed.index_policy.min_score,
            top_k_per_element: parsed.index_policy.top_k_per_element,
        },
        tagger: resolve_tagger(parsed.tagger)?,
        store_retry: retry_policy(&parsed.store.retry),
        resources,
    })
}

fn resolve_resource(work_dir: &Path, id: &str, raw: &RawResource) -> ResourceConfig {
    ResourceConfig {
        id: id.to_string(),
        name: raw.name.clone().unwrap_or_else(|| id.to_string()),
        implementation: raw.implementation.clone(),
        path: raw.path.as_deref().map(|p| resolve_path(work_dir, p)),
        url_template: raw.url_template.clone(),
        large_scale: raw.large_scale,
        contexts: raw.contexts.clone(),
    }
}

fn resolve_tagger(raw: RawTagger) -> Result<TaggerConfig, AppError> {
    match raw.kind.as_str() {
        "dictionary" => Ok(TaggerConfig::Dictionary {
            min_term_length: raw.min_term_length,
        }),
        "process" => {
            let command = raw
                .command
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| AppError::Config("tagger.kind = \"process\" requires tagger.command".into()))?;
            Ok(TaggerConfig::Process {
                command,
                args: raw.args,
                retry: RetryPolicy {
                    max_attempts: raw.max_attempts.max(1),
                    backoff: Duration::from_millis(raw.backoff_ms),
                },
            })
        }
        other => Err(AppError::Config(format!(
            "unknown tagger.kind '{other}' (expected dictionary or process)"
        ))),
    }
}

fn parse_reinitialize(s: &str) -> Result<Reinitialize, AppError> {
    match s {
        "none" => Ok(Reinitialize::None),
        "all" => Ok(Reinitialize::All),
        "annotations" => Ok(Reinitialize::Annotations),
        other => Err(AppError::Config(format!(
            "unknown pipeline.reinitialize '{other}' (expected none, all or annotations)"
        ))),
    }
}

fn retry_policy(raw: &RawRetry) -> RetryPolicy {
    RetryPolicy {
        max_attempts: raw.max_attempts.max(1),
        backoff: Duration::from_millis(raw.backoff_ms),
    }
}

/// `~`-expand `path`; relative results are taken relative to `work_dir`.
fn resolve_path(work_dir: &Path, path: &str) -> PathBuf {
    let p = expand_home(path);
    if p.is_absolute() { p } else { work_dir.join(p) }
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
