//! Resolution of `--where` / `--tag` selectors into the set of controls to run.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;

use super::errors::FilterError;
use crate::client::{Client, Value};
use crate::context::RunContext;
use crate::workspace::{Control, Workspace};

/// Relation the predicate is evaluated against.
pub const CONTROL_RELATION: &str = "sqlcheck_control";

static TAG_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\-]+$").expect("tag key regex must compile"));

/// Control selector from the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlFilter {
    pub where_clause: Option<String>,
    /// `key=value` pairs. Values of one key are alternatives; keys are combined.
    pub tags: Vec<String>,
}

impl ControlFilter {
    pub fn is_empty(&self) -> bool {
        self.where_clause.is_none() && self.tags.is_empty()
    }

    /// SQL predicate over the control relation, if any selector is set.
    pub fn predicate(&self) -> Result<Option<String>, FilterError> {
        match (&self.where_clause, self.tags.is_empty()) {
            (Some(_), false) => Err(FilterError::Conflict),
            (Some(clause), true) => {
                let clause = clause.trim();
                if clause.is_empty() {
                    return Err(FilterError::EmptyWhere);
                }
                Ok(Some(clause.to_string()))
            }
            (None, false) => tag_predicate(&self.tags).map(Some),
            (None, true) => Ok(None),
        }
    }

    /// Short names of the selected controls, or `None` when every control runs.
    pub fn resolve(
        &self,
        ctx: &RunContext,
        client: &dyn Client,
        workspace: &dyn Workspace,
    ) -> Result<Option<BTreeSet<String>>, FilterError> {
        let Some(predicate) = self.predicate()? else {
            return Ok(None);
        };
        let controls = workspace.controls();
        if controls.is_empty() {
            return Ok(Some(BTreeSet::new()));
        }
        let query = introspection_query(&controls, &predicate)?;
        debug!(%predicate, "Resolving control filter");
        let result = client
            .execute_sync(ctx, &query)
            .map_err(FilterError::Query)?;
        Ok(Some(
            result
                .column_values("resource_name")
                .into_iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        ))
    }
}

/// `json_extract` predicate for `key=value` selectors.
pub fn tag_predicate(tags: &[String]) -> Result<String, FilterError> {
    let mut by_key: Vec<(String, Vec<String>)> = Vec::new();
    for tag in tags {
        let Some((key, value)) = tag.split_once('=') else {
            return Err(FilterError::MalformedTag(tag.clone()));
        };
        let key = key.trim();
        if !TAG_KEY.is_match(key) {
            return Err(FilterError::InvalidTagKey(key.to_string()));
        }
        let value = value.trim().to_string();
        match by_key.iter_mut().find(|(existing, _)| existing == key) {
            Some((_, values)) if values.contains(&value) => {}
            Some((_, values)) => values.push(value),
            None => by_key.push((key.to_string(), vec![value])),
        }
    }
    let clauses: Vec<String> = by_key
        .iter()
        .map(|(key, values)| {
            let values: Vec<String> = values.iter().map(|value| sql_literal(value)).collect();
            format!(
                "json_extract(tags, '$.\"{key}\"') IN ({})",
                values.join(", ")
            )
        })
        .collect();
    Ok(clauses.join(" AND "))
}

/// Query selecting matching control short names from an inline relation.
pub fn introspection_query(
    controls: &[Arc<Control>],
    predicate: &str,
) -> Result<String, FilterError> {
    let mut rows = Vec::with_capacity(controls.len());
    for control in controls {
        let tags = serde_json::to_string(&control.tags)?;
        rows.push(format!(
            "({}, {}, {}, {}, {})",
            sql_literal(&control.short_name),
            optional_literal(control.title.as_deref()),
            optional_literal(control.description.as_deref()),
            optional_literal(control.severity.as_deref()),
            sql_literal(&tags),
        ));
    }
    Ok(format!(
        "WITH {CONTROL_RELATION}(resource_name, title, description, severity, tags) AS (VALUES {}) \
         SELECT resource_name FROM {CONTROL_RELATION} WHERE {predicate}",
        rows.join(", ")
    ))
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn optional_literal(value: Option<&str>) -> String {
    value.map(sql_literal).unwrap_or_else(|| "NULL".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn tag_values_of_one_key_are_alternatives() {
        let predicate =
            tag_predicate(&tags(&["service=s3", "service=ec2", "cis=true", "service=s3"])).unwrap();
        assert_eq!(
            predicate,
            "json_extract(tags, '$.\"service\"') IN ('s3', 'ec2') AND json_extract(tags, '$.\"cis\"') IN ('true')"
        );
    }

    #[test]
    fn tag_keys_are_validated() {
        assert!(matches!(
            tag_predicate(&tags(&["bad key=1"])),
            Err(FilterError::InvalidTagKey(key)) if key == "bad key"
        ));
        assert!(matches!(
            tag_predicate(&tags(&["novalue"])),
            Err(FilterError::MalformedTag(_))
        ));
    }

    #[test]
    fn where_and_tag_conflict() {
        let filter = ControlFilter {
            where_clause: Some("severity = 'high'".into()),
            tags: tags(&["service=s3"]),
        };
        assert!(matches!(filter.predicate(), Err(FilterError::Conflict)));
    }

    #[test]
    fn literals_are_quoted() {
        let control = Arc::new(Control {
            short_name: "it's".into(),
            ..Control::default()
        });
        let query = introspection_query(&[control], "1 = 1").unwrap();
        assert!(query.contains("('it''s', NULL, NULL, NULL, '{}')"));
        assert!(query.ends_with("WHERE 1 = 1"));
    }
}
