use std::collections::BTreeMap;
use std::sync::Arc;

use crate::client::Value;

/// A named SQL check whose rows classify resources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Control {
    /// Fully qualified name: `<mod>.control.<short_name>`.
    pub name: String,
    pub short_name: String,
    pub mod_name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Free-form band such as `critical` or `high`, used for severity summaries.
    pub severity: Option<String>,
    pub tags: BTreeMap<String, String>,
    /// Inline SQL. Takes precedence over `query`.
    pub sql: Option<String>,
    /// Short name of a workspace query holding the SQL.
    pub query: Option<String>,
    pub args: Vec<Value>,
    /// Replaces the session search path when non-empty.
    pub search_path: Vec<String>,
    /// Prepended to the session search path when non-empty.
    pub search_path_prefix: Vec<String>,
}

impl Control {
    pub fn has_search_path_override(&self) -> bool {
        !self.search_path.is_empty() || !self.search_path_prefix.is_empty()
    }
}

/// A named grouping of controls and nested benchmarks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Benchmark {
    /// Fully qualified name: `<mod>.benchmark.<short_name>`.
    pub name: String,
    pub short_name: String,
    pub mod_name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: BTreeMap<String, String>,
    /// Fully qualified child names in declaration order.
    pub children: Vec<String>,
}

/// Top-level namespace holding benchmarks, controls and queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModDefinition {
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: BTreeMap<String, String>,
    /// Fully qualified child names in declaration order.
    pub children: Vec<String>,
}

/// SQL text ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedQuery {
    pub sql: String,
    pub args: Vec<Value>,
}

/// One node of the definition hierarchy.
#[derive(Debug, Clone)]
pub enum TreeItem {
    Mod(Arc<ModDefinition>),
    Benchmark(Arc<Benchmark>),
    Control(Arc<Control>),
}

impl TreeItem {
    pub fn name(&self) -> &str {
        match self {
            TreeItem::Mod(definition) => &definition.name,
            TreeItem::Benchmark(benchmark) => &benchmark.name,
            TreeItem::Control(control) => &control.name,
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            TreeItem::Mod(definition) => definition.title.as_deref(),
            TreeItem::Benchmark(benchmark) => benchmark.title.as_deref(),
            TreeItem::Control(control) => control.title.as_deref(),
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            TreeItem::Mod(definition) => definition.description.as_deref(),
            TreeItem::Benchmark(benchmark) => benchmark.description.as_deref(),
            TreeItem::Control(control) => control.description.as_deref(),
        }
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        match self {
            TreeItem::Mod(definition) => &definition.tags,
            TreeItem::Benchmark(benchmark) => &benchmark.tags,
            TreeItem::Control(control) => &control.tags,
        }
    }
}
