//! Declarative job configuration. Ported from the shape of
//! `examples/original_source/conf/config.py` (dimensions, references,
//! order, facts, named UDFs), expressed as data rather than Python
//! source since the format here is YAML.
//!
//! Loading follows the teacher's dormant `config`/`validator`
//! dependencies (declared in its workspace `Cargo.toml` but never
//! wired into any of its own code): a YAML file merged with
//! `ETLMR_`-prefixed environment overrides, validated before any
//! dimension object is built.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{EtlError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ConnectionSpec {
    #[validate(length(min = 1))]
    pub conninfo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DimensionKindSpec {
    Cached,
    Scd {
        versionatt: String,
        fromatt: String,
        toatt: String,
        srcdateatt: Option<String>,
        #[serde(default)]
        type1atts: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DimensionSpec {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(length(min = 1))]
    pub key: String,
    #[validate(length(min = 1))]
    pub attributes: Vec<String>,
    #[validate(length(min = 1))]
    pub lookupatts: Vec<String>,
    pub default_id: Option<i64>,
    #[serde(default)]
    pub bigdim: bool,
    #[serde(default)]
    pub shelvedpath: Option<String>,
    #[serde(flatten)]
    pub kind: DimensionKindSpec,
    #[serde(default)]
    pub srcfields: Vec<String>,
    #[serde(default)]
    pub rowhandlers: Vec<String>,
    #[serde(default)]
    pub namemappings: BTreeMap<String, String>,
}

/// `(parent, children)`, mirroring `config.references`'s
/// `(pagedim, (serverversiondim, domaindim))` shape. The parent's row
/// attribute that receives a child's resolved key is that child's
/// declared `key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceSpec {
    pub parent: String,
    pub children: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FactSpec {
    #[validate(length(min = 1))]
    pub name: String,
    pub keyrefs: Vec<String>,
    pub measures: Vec<String>,
    pub refdims: Vec<String>,
    #[serde(default)]
    pub namemappings: BTreeMap<String, String>,
    #[serde(default)]
    pub rowhandlers: Vec<String>,
    #[serde(default = "default_fieldsep")]
    pub fieldsep: String,
    #[serde(default = "default_rowsep")]
    pub rowsep: String,
    pub nullsubst: Option<String>,
    #[serde(default = "default_bulksize")]
    pub bulksize: usize,
}

fn default_fieldsep() -> String {
    "\t".to_string()
}

fn default_rowsep() -> String {
    "\n".to_string()
}

fn default_bulksize() -> usize {
    500_000
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JobSpec {
    pub connection: ConnectionSpec,
    #[validate(length(min = 1))]
    pub dimensions: Vec<DimensionSpec>,
    #[serde(default)]
    pub references: Vec<ReferenceSpec>,
    /// Levels of dimension names loaded to completion before the next
    /// level begins, mirroring `config.order`.
    #[serde(default)]
    pub order: Vec<Vec<String>>,
    pub facts: Vec<FactSpec>,
    #[serde(default)]
    pub prefilleddims: Vec<String>,
    /// Shelved-store directory; each dimension's file lives at
    /// `shelve_dir/<name>` unless it declares an explicit `shelvedpath`.
    #[serde(default = "default_shelve_dir")]
    pub shelve_dir: String,
    #[serde(default = "default_lru_capacity")]
    pub lru_capacity: usize,
}

fn default_shelve_dir() -> String {
    "./shelves".to_string()
}

fn default_lru_capacity() -> usize {
    10_000
}

impl JobSpec {
    /// Loads and validates a job spec from a YAML file, allowing
    /// `ETLMR_`-prefixed environment variables (e.g.
    /// `ETLMR_CONNECTION__CONNINFO`) to override individual fields.
    pub fn load(path: impl AsRef<Path>) -> Result<JobSpec> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("ETLMR").separator("__"))
            .build()
            .map_err(|e| EtlError::Other(e.into()))?;
        let spec: JobSpec = settings.try_deserialize().map_err(|e| EtlError::Other(e.into()))?;
        spec.validate().map_err(|e| EtlError::Configuration(e.to_string()))?;
        spec.connection.validate().map_err(|e| EtlError::Configuration(e.to_string()))?;
        for dim in &spec.dimensions {
            dim.validate().map_err(|e| EtlError::Configuration(e.to_string()))?;
        }
        for fact in &spec.facts {
            fact.validate().map_err(|e| EtlError::Configuration(e.to_string()))?;
        }
        spec.check_consistency()?;
        Ok(spec)
    }

    /// Cross-field checks `validator`'s per-field derive can't express:
    /// every name referenced by `references`/`order`/`facts` must name
    /// a declared dimension, and a dimension's `key` must not also
    /// appear in its own `attributes`.
    fn check_consistency(&self) -> Result<()> {
        let names: std::collections::HashSet<&str> = self.dimensions.iter().map(|d| d.name.as_str()).collect();
        for dim in &self.dimensions {
            if dim.attributes.contains(&dim.key) {
                return Err(EtlError::Configuration(format!(
                    "dimension {}: key attribute {} must not appear in attributes",
                    dim.name, dim.key
                )));
            }
            if !dim.lookupatts.iter().all(|a| dim.attributes.contains(a)) {
                return Err(EtlError::Configuration(format!(
                    "dimension {}: lookupatts must be a subset of attributes",
                    dim.name
                )));
            }
        }
        for reference in &self.references {
            for name in std::iter::once(&reference.parent).chain(reference.children.iter()) {
                if !names.contains(name.as_str()) {
                    return Err(EtlError::Configuration(format!(
                        "reference names undeclared dimension {name}"
                    )));
                }
            }
        }
        for level in &self.order {
            for name in level {
                if !names.contains(name.as_str()) {
                    return Err(EtlError::Configuration(format!(
                        "load order names undeclared dimension {name}"
                    )));
                }
            }
        }
        for fact in &self.facts {
            for name in &fact.refdims {
                if !names.contains(name.as_str()) {
                    return Err(EtlError::Configuration(format!(
                        "fact {} references undeclared dimension {name}",
                        fact.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_key_in_attributes() {
        let spec = JobSpec {
            connection: ConnectionSpec { conninfo: "host=localhost".into() },
            dimensions: vec![DimensionSpec {
                name: "d".into(),
                key: "id".into(),
                attributes: vec!["id".into()],
                lookupatts: vec!["id".into()],
                default_id: None,
                bigdim: false,
                shelvedpath: None,
                kind: DimensionKindSpec::Cached,
                srcfields: vec![],
                rowhandlers: vec![],
                namemappings: BTreeMap::new(),
            }],
            references: vec![],
            order: vec![],
            facts: vec![],
            prefilleddims: vec![],
            shelve_dir: "./shelves".into(),
            lru_capacity: 100,
        };
        assert!(spec.check_consistency().is_err());
    }
}
