//! rusqlite-backed [`Client`]: one connection per session, rows produced on a
//! worker thread.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Sender, select};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, ErrorCode, OpenFlags, ToSql};
use tracing::{debug, warn};

use super::{
    Client, ClientError, ColumnInfo, DataType, QueryRow, RowEvent, RowStream, Session, SyncResult,
    Value,
};
use crate::context::{ContextError, RunContext};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const ROW_BUFFER: usize = 256;
const DEFAULT_SCHEMA: &str = "main";

/// Client for a SQLite database file.
#[derive(Debug)]
pub struct SqliteClient {
    path: PathBuf,
    busy_timeout: Duration,
    next_session_id: AtomicU64,
}

impl SqliteClient {
    /// Open the database at `path`, failing if it cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let client = Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            next_session_id: AtomicU64::new(1),
        };
        client.connect()?;
        Ok(client)
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, ClientError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let connection =
            Connection::open_with_flags(&self.path, flags).map_err(|source| ClientError::Open {
                path: self.path.clone(),
                source,
            })?;
        connection
            .busy_timeout(self.busy_timeout)
            .map_err(map_sql_error)?;
        connection
            .execute_batch("PRAGMA temp_store=MEMORY;")
            .map_err(map_sql_error)?;
        Ok(connection)
    }
}

/// A session owning one SQLite connection.
pub struct SqliteSession {
    id: u64,
    connection: Arc<Mutex<Connection>>,
    search_path: Vec<String>,
}

impl Session for SqliteSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn search_path(&mut self) -> Result<Vec<String>, ClientError> {
        Ok(self.search_path.clone())
    }

    fn set_search_path(&mut self, path: &[String]) -> Result<(), ClientError> {
        if path.is_empty() {
            return Err(ClientError::Query("search path cannot be empty".into()));
        }
        // SQLite resolves schemas itself; the path is kept for diagnostics.
        debug!(session = self.id, ?path, "Search path set");
        self.search_path = path.to_vec();
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Client for SqliteClient {
    fn acquire_session(&self, ctx: &RunContext) -> Result<Box<dyn Session>, ClientError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        let connection = self.connect()?;
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(SqliteSession {
            id,
            connection: Arc::new(Mutex::new(connection)),
            search_path: vec![DEFAULT_SCHEMA.to_string()],
        }))
    }

    fn execute_in_session(
        &self,
        ctx: &RunContext,
        session: &mut dyn Session,
        query: &str,
        params: &[Value],
    ) -> Result<RowStream, ClientError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        let Some(session) = session.as_any_mut().downcast_mut::<SqliteSession>() else {
            return Err(ClientError::Query(
                "session was not created by this client".into(),
            ));
        };
        let connection = session.connection.clone();
        let interrupt = lock_connection(&connection).get_interrupt_handle();
        let finished = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (row_tx, row_rx) = crossbeam_channel::bounded(ROW_BUFFER);
        let sql = query.to_string();
        let params = params.to_vec();
        let producer_finished = finished.clone();
        let session_id = session.id;
        std::thread::Builder::new()
            .name(format!("sqlcheck-query-{session_id}"))
            .spawn(move || {
                let connection = lock_connection(&connection);
                stream_query(&connection, &sql, &params, &ready_tx, &row_tx);
                producer_finished.store(true, Ordering::Release);
            })
            .map_err(|err| ClientError::Query(format!("failed to spawn query thread: {err}")))?;

        let cancelled = ctx.cancelled();
        let expired = ctx.expired();
        let dispatched = select! {
            recv(ready_rx) -> msg => msg.unwrap_or_else(|_| {
                Err(ClientError::Connectivity("query thread exited before dispatch".into()))
            }),
            recv(cancelled) -> _ => {
                interrupt.interrupt();
                Err(ctx.err().unwrap_or(ContextError::Cancelled(None)).into())
            }
            recv(expired) -> _ => {
                interrupt.interrupt();
                Err(ctx.err().unwrap_or(ContextError::DeadlineExceeded).into())
            }
        };
        dispatched?;
        Ok(RowStream::new(row_rx).with_abort(move || {
            if !finished.load(Ordering::Acquire) {
                debug!(session = session_id, "Interrupting unfinished query");
                interrupt.interrupt();
            }
        }))
    }

    fn execute_sync(&self, ctx: &RunContext, query: &str) -> Result<SyncResult, ClientError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        let connection = self.connect()?;
        let mut stmt = connection.prepare(query).map_err(map_sql_error)?;
        let names: Vec<String> = stmt.column_names().iter().map(|name| name.to_string()).collect();
        let mut rows = stmt.query([]).map_err(map_sql_error)?;
        let mut result = SyncResult::default();
        while let Some(row) = rows.next().map_err(map_sql_error)? {
            let values = read_values(row, names.len())?;
            if result.columns.is_empty() {
                result.columns = infer_columns(&names, &values).to_vec();
            }
            result.rows.push(values);
        }
        if result.columns.is_empty() {
            result.columns = names
                .into_iter()
                .map(|name| ColumnInfo::new(name, DataType::Null))
                .collect();
        }
        Ok(result)
    }
}

fn stream_query(
    connection: &Connection,
    sql: &str,
    params: &[Value],
    ready: &Sender<Result<(), ClientError>>,
    rows: &Sender<RowEvent>,
) {
    let mut stmt = match connection.prepare(sql) {
        Ok(stmt) => stmt,
        Err(err) => {
            let _ = ready.send(Err(map_sql_error(err)));
            return;
        }
    };
    let names: Vec<String> = stmt.column_names().iter().map(|name| name.to_string()).collect();
    let mut cursor = match stmt.query(rusqlite::params_from_iter(params.iter())) {
        Ok(cursor) => cursor,
        Err(err) => {
            let _ = ready.send(Err(map_sql_error(err)));
            return;
        }
    };
    let mut dispatched = false;
    // Cells are typed per row; the column set is shared while types repeat.
    let mut columns: Option<Arc<[ColumnInfo]>> = None;
    loop {
        let step = cursor.next();
        let row = match step {
            Ok(Some(row)) => row,
            Ok(None) => {
                if !dispatched && ready.send(Ok(())).is_err() {
                    return;
                }
                let _ = rows.send(RowEvent::Done);
                return;
            }
            Err(err) => {
                let err = map_sql_error(err);
                if dispatched {
                    let _ = rows.send(RowEvent::Failed(err));
                } else {
                    let _ = ready.send(Err(err));
                }
                return;
            }
        };
        if !dispatched {
            dispatched = true;
            if ready.send(Ok(())).is_err() {
                return;
            }
        }
        let values = match read_values(row, names.len()) {
            Ok(values) => values,
            Err(err) => {
                let _ = rows.send(RowEvent::Failed(err));
                return;
            }
        };
        let row_columns = match &columns {
            Some(cached) if matches_types(cached, &values) => cached.clone(),
            _ => {
                let inferred = infer_columns(&names, &values);
                columns = Some(inferred.clone());
                inferred
            }
        };
        let row = QueryRow {
            columns: row_columns,
            values,
        };
        if rows.send(RowEvent::Row(row)).is_err() {
            return;
        }
    }
}

fn read_values(row: &rusqlite::Row<'_>, width: usize) -> Result<Vec<Value>, ClientError> {
    (0..width)
        .map(|index| {
            let value = row.get_ref(index).map_err(map_sql_error)?;
            Ok(match value {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(value) => Value::Integer(value),
                ValueRef::Real(value) => Value::Real(value),
                ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
                ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
            })
        })
        .collect()
}

fn infer_columns(names: &[String], values: &[Value]) -> Arc<[ColumnInfo]> {
    names
        .iter()
        .zip(values.iter())
        .map(|(name, value)| ColumnInfo::new(name.clone(), DataType::of(value)))
        .collect()
}

fn matches_types(columns: &[ColumnInfo], values: &[Value]) -> bool {
    columns
        .iter()
        .zip(values)
        .all(|(column, value)| column.data_type == DataType::of(value))
}

fn lock_connection(connection: &Mutex<Connection>) -> std::sync::MutexGuard<'_, Connection> {
    connection.lock().unwrap_or_else(|poisoned| {
        warn!("Session connection lock poisoned; recovering.");
        poisoned.into_inner()
    })
}

fn map_sql_error(err: rusqlite::Error) -> ClientError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => ClientError::Busy,
        Some(ErrorCode::OperationInterrupted) => {
            ClientError::Context(ContextError::Cancelled(Some("query interrupted".into())))
        }
        Some(ErrorCode::CannotOpen | ErrorCode::SystemIoFailure) => {
            ClientError::Connectivity(err.to_string())
        }
        _ => ClientError::Sqlite(err),
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            Value::Null => ValueRef::Null,
            Value::Integer(value) => ValueRef::Integer(*value),
            Value::Real(value) => ValueRef::Real(*value),
            Value::Text(value) => ValueRef::Text(value.as_bytes()),
            Value::Blob(value) => ValueRef::Blob(value),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SLOW_QUERY: &str = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n \
         WHERE x < 2000000000) SELECT x FROM n WHERE x = 2000000000";

    fn seeded_client() -> (tempfile::TempDir, SqliteClient) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checks.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE buckets (name TEXT, public INTEGER, policy TEXT);
             INSERT INTO buckets VALUES ('logs', 0, '{\"v\": 1}');
             INSERT INTO buckets VALUES ('site', 1, NULL);",
        )
        .unwrap();
        let client = SqliteClient::open(&path).unwrap();
        (dir, client)
    }

    #[test]
    fn open_fails_for_missing_database() {
        let dir = tempdir().unwrap();
        let err = SqliteClient::open(dir.path().join("missing.db")).unwrap_err();
        assert!(matches!(err, ClientError::Open { .. }));
    }

    #[test]
    fn streams_rows_with_bound_params() {
        let (_dir, client) = seeded_client();
        let ctx = RunContext::background();
        let mut session = client.acquire_session(&ctx).unwrap();
        let stream = client
            .execute_in_session(
                &ctx,
                session.as_mut(),
                "SELECT name, public, policy FROM buckets WHERE public >= ? ORDER BY name",
                &[Value::Integer(0)],
            )
            .unwrap();
        let mut names = Vec::new();
        loop {
            match stream.receiver().recv().unwrap() {
                RowEvent::Row(row) => {
                    if row.get("name") == Some(&Value::Text("logs".into())) {
                        assert_eq!(row.columns[2].data_type, DataType::Json);
                    }
                    names.push(row.get("name").cloned().unwrap());
                }
                RowEvent::Done => break,
                RowEvent::Failed(err) => panic!("unexpected failure: {err}"),
            }
        }
        assert_eq!(
            names,
            vec![Value::Text("logs".into()), Value::Text("site".into())]
        );
    }

    #[test]
    fn cell_types_follow_each_row() {
        let (_dir, client) = seeded_client();
        let ctx = RunContext::background();
        let mut session = client.acquire_session(&ctx).unwrap();
        let stream = client
            .execute_in_session(
                &ctx,
                session.as_mut(),
                "SELECT name, CASE name WHEN 'logs' THEN policy ELSE 'plain' END AS policy \
                 FROM buckets UNION ALL SELECT 'tail', '[1, 2]' ORDER BY name",
                &[],
            )
            .unwrap();
        let mut types = Vec::new();
        loop {
            match stream.receiver().recv().unwrap() {
                RowEvent::Row(row) => types.push(row.columns[1].data_type),
                RowEvent::Done => break,
                RowEvent::Failed(err) => panic!("unexpected failure: {err}"),
            }
        }
        assert_eq!(types, [DataType::Json, DataType::Text, DataType::Json]);
    }

    #[test]
    fn cancel_interrupts_a_query_still_in_dispatch() {
        let (_dir, client) = seeded_client();
        let ctx = RunContext::cancellable();
        let mut session = client.acquire_session(&ctx).unwrap();
        let query_ctx = RunContext::with_timeout_from(&ctx, Duration::from_secs(30));
        let canceller = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                ctx.cancel(Some("stop".into()));
            })
        };
        let started = std::time::Instant::now();
        let err = client
            .execute_in_session(&query_ctx, session.as_mut(), SLOW_QUERY, &[])
            .unwrap_err();
        canceller.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(
            err.context_error(),
            Some(&ContextError::Cancelled(Some("stop".into())))
        );
    }

    #[test]
    fn syntax_error_fails_dispatch() {
        let (_dir, client) = seeded_client();
        let ctx = RunContext::background();
        let mut session = client.acquire_session(&ctx).unwrap();
        let err = client
            .execute_in_session(&ctx, session.as_mut(), "SELEC nonsense", &[])
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn sessions_get_distinct_ids_and_default_path() {
        let (_dir, client) = seeded_client();
        let ctx = RunContext::background();
        let mut first = client.acquire_session(&ctx).unwrap();
        let second = client.acquire_session(&ctx).unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.search_path().unwrap(), vec!["main".to_string()]);
        first.set_search_path(&["main".into(), "temp".into()]).unwrap();
        assert_eq!(first.search_path().unwrap().len(), 2);
    }

    #[test]
    fn execute_sync_collects_rows() {
        let (_dir, client) = seeded_client();
        let result = client
            .execute_sync(
                &RunContext::background(),
                "SELECT name FROM buckets WHERE public = 1",
            )
            .unwrap();
        assert_eq!(result.column_values("name"), vec![&Value::Text("site".into())]);
    }

    #[test]
    fn cancelled_context_refuses_session() {
        let (_dir, client) = seeded_client();
        let ctx = RunContext::cancellable();
        ctx.cancel(Some("stop".into()));
        let err = client.acquire_session(&ctx).err().unwrap();
        assert_eq!(
            err.context_error(),
            Some(&ContextError::Cancelled(Some("stop".into())))
        );
    }
}
