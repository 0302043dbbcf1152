use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::errors::ControlRunError;
use crate::client::{ColumnInfo, QueryRow, Value};
use crate::workspace::Control;

pub const REASON_COLUMN: &str = "reason";
pub const RESOURCE_COLUMN: &str = "resource";
pub const STATUS_COLUMN: &str = "status";
const REQUIRED_COLUMNS: [&str; 3] = [REASON_COLUMN, RESOURCE_COLUMN, STATUS_COLUMN];

/// Classification of one result row.
///
/// Variant order is the display bucket order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControlStatus {
    Error,
    Alarm,
    Info,
    Ok,
    Skip,
}

impl ControlStatus {
    /// Every status in bucket order.
    pub const ALL: [ControlStatus; 5] = [
        ControlStatus::Error,
        ControlStatus::Alarm,
        ControlStatus::Info,
        ControlStatus::Ok,
        ControlStatus::Skip,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ControlStatus::Error => "error",
            ControlStatus::Alarm => "alarm",
            ControlStatus::Info => "info",
            ControlStatus::Ok => "ok",
            ControlStatus::Skip => "skip",
        }
    }
}

impl fmt::Display for ControlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlStatus {
    type Err = ControlRunError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ControlStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| ControlRunError::InvalidStatusValue {
                value: value.to_string(),
            })
    }
}

/// An extra scalar column of a result row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dimension {
    pub key: String,
    pub value: String,
}

/// One classified row of a control's result.
#[derive(Debug, Clone)]
pub struct ResultRow {
    pub reason: String,
    pub resource: String,
    pub status: ControlStatus,
    pub dimensions: Vec<Dimension>,
    pub control: Arc<Control>,
}

impl ResultRow {
    /// Classify a streamed row. Null reason or resource cells become empty text.
    pub fn from_query_row(row: &QueryRow, control: Arc<Control>) -> Result<Self, ControlRunError> {
        validate_columns(&row.columns)?;
        let text = |name: &str| row.get(name).map(Value::to_string).unwrap_or_default();
        let status = match row.get(STATUS_COLUMN) {
            Some(Value::Text(value)) => value.parse::<ControlStatus>()?,
            other => {
                return Err(ControlRunError::InvalidStatusValue {
                    value: other.map(Value::to_string).unwrap_or_default(),
                });
            }
        };
        let dimensions = row
            .cells()
            .filter(|(column, value)| {
                !REQUIRED_COLUMNS.contains(&column.name.as_str())
                    && column.data_type.is_scalar()
                    && !value.is_null()
            })
            .map(|(column, value)| Dimension {
                key: column.name.clone(),
                value: value.to_string(),
            })
            .collect();
        Ok(Self {
            reason: text(REASON_COLUMN),
            resource: text(RESOURCE_COLUMN),
            status,
            dimensions,
            control,
        })
    }
}

/// Fail with every required column the result lacks.
pub fn validate_columns(columns: &[ColumnInfo]) -> Result<(), ControlRunError> {
    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|required| !columns.iter().any(|column| column.name == **required))
        .map(|required| required.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ControlRunError::MissingRequiredColumns { missing })
    }
}
