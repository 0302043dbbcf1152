use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::client::Value;

use super::{
    ALL_TARGETS, Benchmark, Control, ModDefinition, ResolvedQuery, TreeItem, Workspace,
    WorkspaceError,
};

const DEFINITION_EXTENSION: &str = "toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModFile {
    #[serde(rename = "mod")]
    definition: RawMod,
    #[serde(default)]
    benchmark: Vec<RawBenchmark>,
    #[serde(default)]
    control: Vec<RawControl>,
    #[serde(default)]
    query: Vec<RawQuery>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMod {
    name: String,
    title: Option<String>,
    description: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    children: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBenchmark {
    name: String,
    title: Option<String>,
    description: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    children: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawControl {
    name: String,
    title: Option<String>,
    description: Option<String>,
    severity: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    sql: Option<String>,
    query: Option<String>,
    #[serde(default)]
    args: Vec<toml::Value>,
    #[serde(default)]
    search_path: Vec<String>,
    #[serde(default)]
    search_path_prefix: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawQuery {
    name: String,
    sql: String,
}

/// Workspace loaded from TOML files, one mod per file.
#[derive(Debug, Default)]
pub struct ModWorkspace {
    mods: Vec<Arc<ModDefinition>>,
    benchmarks: HashMap<String, Arc<Benchmark>>,
    controls: HashMap<String, Arc<Control>>,
    control_order: Vec<String>,
    queries: HashMap<String, String>,
}

impl ModWorkspace {
    /// Load a single definition file, or every `*.toml` file in a directory
    /// sorted by file name.
    pub fn load(location: impl AsRef<Path>) -> Result<Self, WorkspaceError> {
        let location = location.as_ref();
        let files = definition_files(location)?;
        let mut sources = Vec::with_capacity(files.len());
        for path in files {
            let text = std::fs::read_to_string(&path).map_err(|source| WorkspaceError::Read {
                path: path.clone(),
                source,
            })?;
            sources.push((path, text));
        }
        let workspace = Self::from_sources(
            sources
                .iter()
                .map(|(path, text)| (path.as_path(), text.as_str())),
        )?;
        debug!(
            "Loaded {} mod(s), {} benchmark(s), {} control(s) from {}",
            workspace.mods.len(),
            workspace.benchmarks.len(),
            workspace.controls.len(),
            location.display()
        );
        Ok(workspace)
    }

    /// Build a workspace from in-memory TOML documents.
    pub fn from_toml_str(text: &str) -> Result<Self, WorkspaceError> {
        Self::from_sources([(Path::new("<inline>"), text)])
    }

    fn from_sources<'a>(
        sources: impl IntoIterator<Item = (&'a Path, &'a str)>,
    ) -> Result<Self, WorkspaceError> {
        let mut workspace = Self::default();
        let mut pending_children = Vec::new();
        for (path, text) in sources {
            let file: ModFile = toml::from_str(text).map_err(|source| WorkspaceError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            pending_children.extend(workspace.register_file(file)?);
        }
        for (parent, mod_name, raw_children) in pending_children {
            let children = raw_children
                .iter()
                .map(|child| workspace.qualify_child(&parent, &mod_name, child))
                .collect::<Result<Vec<_>, _>>()?;
            workspace.attach_children(&parent, children);
        }
        workspace.check_cycles()?;
        Ok(workspace)
    }

    fn register_file(
        &mut self,
        file: ModFile,
    ) -> Result<Vec<(String, String, Vec<String>)>, WorkspaceError> {
        let mod_name = file.definition.name.clone();
        if self.mods.iter().any(|existing| existing.name == mod_name) {
            return Err(WorkspaceError::Duplicate {
                kind: "mod",
                name: mod_name,
            });
        }
        let mut pending = vec![(
            mod_name.clone(),
            mod_name.clone(),
            file.definition.children,
        )];
        self.mods.push(Arc::new(ModDefinition {
            name: mod_name.clone(),
            title: file.definition.title,
            description: file.definition.description,
            tags: file.definition.tags,
            children: Vec::new(),
        }));

        for raw in file.query {
            let name = qualified(&mod_name, "query", &raw.name);
            if self.queries.insert(name.clone(), raw.sql).is_some() {
                return Err(WorkspaceError::Duplicate { kind: "query", name });
            }
        }
        for raw in file.control {
            let control = build_control(&mod_name, raw)?;
            if self.controls.contains_key(&control.name) {
                return Err(WorkspaceError::Duplicate {
                    kind: "control",
                    name: control.name,
                });
            }
            self.control_order.push(control.name.clone());
            self.controls.insert(control.name.clone(), Arc::new(control));
        }
        for raw in file.benchmark {
            let name = qualified(&mod_name, "benchmark", &raw.name);
            if self.benchmarks.contains_key(&name) {
                return Err(WorkspaceError::Duplicate {
                    kind: "benchmark",
                    name,
                });
            }
            pending.push((name.clone(), mod_name.clone(), raw.children));
            self.benchmarks.insert(
                name.clone(),
                Arc::new(Benchmark {
                    name,
                    short_name: raw.name,
                    mod_name: mod_name.clone(),
                    title: raw.title,
                    description: raw.description,
                    tags: raw.tags,
                    children: Vec::new(),
                }),
            );
        }
        Ok(pending)
    }

    /// Accepts `benchmark.x`, `control.x` (same mod) or `<mod>.benchmark.x`.
    fn qualify_child(
        &self,
        parent: &str,
        mod_name: &str,
        child: &str,
    ) -> Result<String, WorkspaceError> {
        let candidate = match child.split('.').count() {
            2 => format!("{mod_name}.{child}"),
            _ => child.to_string(),
        };
        if self.benchmarks.contains_key(&candidate) || self.controls.contains_key(&candidate) {
            Ok(candidate)
        } else {
            Err(WorkspaceError::UnknownChild {
                parent: parent.to_string(),
                child: child.to_string(),
            })
        }
    }

    fn attach_children(&mut self, parent: &str, children: Vec<String>) {
        if let Some(benchmark) = self.benchmarks.get_mut(parent) {
            Arc::make_mut(benchmark).children = children;
        } else if let Some(definition) = self.mods.iter_mut().find(|m| m.name == parent) {
            Arc::make_mut(definition).children = children;
        }
    }

    fn check_cycles(&self) -> Result<(), WorkspaceError> {
        let mut finished = HashSet::new();
        let mut names: Vec<&String> = self.benchmarks.keys().collect();
        names.sort();
        for name in names {
            let mut visiting = HashSet::new();
            self.visit_benchmark(name, &mut visiting, &mut finished)?;
        }
        Ok(())
    }

    fn visit_benchmark<'a>(
        &'a self,
        name: &'a str,
        visiting: &mut HashSet<&'a str>,
        finished: &mut HashSet<&'a str>,
    ) -> Result<(), WorkspaceError> {
        if finished.contains(name) {
            return Ok(());
        }
        if !visiting.insert(name) {
            return Err(WorkspaceError::Cycle(name.to_string()));
        }
        if let Some(benchmark) = self.benchmarks.get(name) {
            for child in &benchmark.children {
                if self.benchmarks.contains_key(child) {
                    self.visit_benchmark(child, visiting, finished)?;
                }
            }
        }
        visiting.remove(name);
        finished.insert(name);
        Ok(())
    }

    fn item_by_name(&self, name: &str) -> Option<TreeItem> {
        if let Some(benchmark) = self.benchmarks.get(name) {
            return Some(TreeItem::Benchmark(Arc::clone(benchmark)));
        }
        self.controls
            .get(name)
            .map(|control| TreeItem::Control(Arc::clone(control)))
    }

    fn resolve_short_name(&self, kind: &str, short: &str) -> Result<TreeItem, WorkspaceError> {
        let mut matches: Vec<TreeItem> = self
            .mods
            .iter()
            .filter_map(|definition| self.item_by_name(&qualified(&definition.name, kind, short)))
            .collect();
        if matches.len() > 1 {
            return Err(WorkspaceError::AmbiguousTarget {
                name: format!("{kind}.{short}"),
                candidates: matches
                    .iter()
                    .map(|item| item.name().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        matches
            .pop()
            .ok_or_else(|| WorkspaceError::UnknownTarget(format!("{kind}.{short}")))
    }
}

impl Workspace for ModWorkspace {
    fn resolve_targets(&self, arg: &str) -> Result<Vec<TreeItem>, WorkspaceError> {
        let arg = arg.trim();
        if arg == ALL_TARGETS {
            return Ok(self.mods.iter().cloned().map(TreeItem::Mod).collect());
        }
        if let Some(definition) = self.mods.iter().find(|definition| definition.name == arg) {
            return Ok(vec![TreeItem::Mod(Arc::clone(definition))]);
        }
        let parts: Vec<&str> = arg.split('.').collect();
        match parts.as_slice() {
            [kind @ ("benchmark" | "control"), short] => {
                Ok(vec![self.resolve_short_name(kind, short)?])
            }
            [_, "benchmark" | "control", _] => self
                .item_by_name(arg)
                .map(|item| vec![item])
                .ok_or_else(|| WorkspaceError::UnknownTarget(arg.to_string())),
            _ => Err(WorkspaceError::UnknownTarget(arg.to_string())),
        }
    }

    fn children(&self, item: &TreeItem) -> Vec<TreeItem> {
        let names = match item {
            TreeItem::Mod(definition) => &definition.children,
            TreeItem::Benchmark(benchmark) => &benchmark.children,
            TreeItem::Control(_) => return Vec::new(),
        };
        names
            .iter()
            .filter_map(|name| self.item_by_name(name))
            .collect()
    }

    fn resolve_query(&self, control: &Control) -> Result<ResolvedQuery, WorkspaceError> {
        if let Some(sql) = control.sql.as_deref().filter(|sql| !sql.trim().is_empty()) {
            return Ok(ResolvedQuery {
                sql: sql.to_string(),
                args: control.args.clone(),
            });
        }
        let Some(query) = control.query.as_deref() else {
            return Err(WorkspaceError::MissingQuery(control.name.clone()));
        };
        let key = match query.split('.').count() {
            1 => qualified(&control.mod_name, "query", query),
            _ => query.to_string(),
        };
        self.queries
            .get(&key)
            .filter(|sql| !sql.trim().is_empty())
            .map(|sql| ResolvedQuery {
                sql: sql.clone(),
                args: control.args.clone(),
            })
            .ok_or_else(|| WorkspaceError::UnknownQuery {
                control: control.name.clone(),
                query: query.to_string(),
            })
    }

    fn controls(&self) -> Vec<Arc<Control>> {
        self.control_order
            .iter()
            .filter_map(|name| self.controls.get(name).cloned())
            .collect()
    }
}

fn qualified(mod_name: &str, kind: &str, short: &str) -> String {
    format!("{mod_name}.{kind}.{short}")
}

fn build_control(mod_name: &str, raw: RawControl) -> Result<Control, WorkspaceError> {
    let name = qualified(mod_name, "control", &raw.name);
    let args = raw
        .args
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            toml_to_value(value).ok_or_else(|| WorkspaceError::UnsupportedArgument {
                control: name.clone(),
                index,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Control {
        name,
        short_name: raw.name,
        mod_name: mod_name.to_string(),
        title: raw.title,
        description: raw.description,
        severity: raw.severity.filter(|severity| !severity.trim().is_empty()),
        tags: raw.tags,
        sql: raw.sql,
        query: raw.query,
        args,
        search_path: raw.search_path,
        search_path_prefix: raw.search_path_prefix,
    })
}

fn toml_to_value(value: toml::Value) -> Option<Value> {
    match value {
        toml::Value::String(text) => Some(Value::Text(text)),
        toml::Value::Integer(number) => Some(Value::Integer(number)),
        toml::Value::Float(number) => Some(Value::Real(number)),
        toml::Value::Boolean(flag) => Some(Value::Integer(i64::from(flag))),
        toml::Value::Datetime(datetime) => Some(Value::Text(datetime.to_string())),
        toml::Value::Array(_) | toml::Value::Table(_) => None,
    }
}

fn definition_files(location: &Path) -> Result<Vec<PathBuf>, WorkspaceError> {
    if location.is_file() {
        return Ok(vec![location.to_path_buf()]);
    }
    if !location.is_dir() {
        return Err(WorkspaceError::NoDefinitions(location.to_path_buf()));
    }
    let mut files = std::fs::read_dir(location)
        .map_err(|source| WorkspaceError::Read {
            path: location.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some(DEFINITION_EXTENSION))
        .collect::<Vec<_>>();
    files.sort();
    if files.is_empty() {
        return Err(WorkspaceError::NoDefinitions(location.to_path_buf()));
    }
    Ok(files)
}
