use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Receiver;

use super::ClientError;

/// A single cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Integer(value) => write!(f, "{value}"),
            Value::Real(value) => write!(f, "{value}"),
            Value::Text(value) => f.write_str(value),
            Value::Blob(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

/// Column type as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Null,
    Integer,
    Real,
    Text,
    Blob,
    /// Text holding a JSON object or array.
    Json,
}

impl DataType {
    /// Scalar columns can be shown as dimensions.
    pub fn is_scalar(self) -> bool {
        !matches!(self, DataType::Blob | DataType::Json)
    }

    /// Infer the type of a cell.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => DataType::Null,
            Value::Integer(_) => DataType::Integer,
            Value::Real(_) => DataType::Real,
            Value::Blob(_) => DataType::Blob,
            Value::Text(text) => {
                let trimmed = text.trim_start();
                let looks_structured = trimmed.starts_with('{') || trimmed.starts_with('[');
                if looks_structured
                    && serde_json::from_str::<serde_json::Value>(text)
                        .is_ok_and(|parsed| parsed.is_object() || parsed.is_array())
                {
                    DataType::Json
                } else {
                    DataType::Text
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: DataType,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// One streamed row with its self-describing columns.
#[derive(Debug, Clone)]
pub struct QueryRow {
    pub columns: Arc<[ColumnInfo]>,
    pub values: Vec<Value>,
}

impl QueryRow {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|column| column.name == name)
            .and_then(|index| self.values.get(index))
    }

    pub fn cells(&self) -> impl Iterator<Item = (&ColumnInfo, &Value)> {
        self.columns.iter().zip(self.values.iter())
    }
}

/// Event delivered on a [`RowStream`].
#[derive(Debug)]
pub enum RowEvent {
    Row(QueryRow),
    Failed(ClientError),
    Done,
}

/// Rows of one dispatched query.
///
/// Dropping the stream before `Done` runs its abort hook so the backend can
/// stop work.
pub struct RowStream {
    rows: Receiver<RowEvent>,
    abort: Option<Box<dyn FnOnce() + Send>>,
}

impl RowStream {
    pub fn new(rows: Receiver<RowEvent>) -> Self {
        Self { rows, abort: None }
    }

    /// A finished stream replaying `events`, followed by disconnection.
    pub fn from_events(events: Vec<RowEvent>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        for event in events {
            let _ = tx.send(event);
        }
        Self::new(rx)
    }

    pub fn with_abort(mut self, abort: impl FnOnce() + Send + 'static) -> Self {
        self.abort = Some(Box::new(abort));
        self
    }

    pub fn receiver(&self) -> &Receiver<RowEvent> {
        &self.rows
    }
}

impl fmt::Debug for RowStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStream")
            .field("pending", &self.rows.len())
            .field("abortable", &self.abort.is_some())
            .finish()
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort();
        }
    }
}

/// Fully materialised result of [`super::Client::execute_sync`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<Value>>,
}

impl SyncResult {
    /// Values of the named column, in row order.
    pub fn column_values<'a>(&'a self, name: &str) -> Vec<&'a Value> {
        let Some(index) = self.columns.iter().position(|column| column.name == name) else {
            return Vec::new();
        };
        self.rows.iter().filter_map(|row| row.get(index)).collect()
    }
}
