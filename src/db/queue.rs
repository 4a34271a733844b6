//! Serialized write access to the database.
//!
//! Every statement that can mutate the database is wrapped in a task and
//! executed, in admission order, by one worker thread that owns the only
//! long-lived writer connection. Read-only statements skip the queue and run on
//! a fresh connection on the caller's thread.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::db::migrate::run_migrations;
use crate::db::Db;
use crate::error::{KbError, Result};

const READ_KEYWORDS: &[&str] = &["SELECT", "PRAGMA", "EXPLAIN"];
const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "REPLACE", "UPSERT", "CREATE", "DROP", "ALTER", "ATTACH",
    "DETACH", "VACUUM", "REINDEX",
];

/// `sql` past leading whitespace and `--` / `/* */` comments.
///
/// An unterminated comment swallows the rest of the statement.
fn skip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.find('\n').map_or("", |i| &after[i + 1..]);
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.find("*/").map_or("", |i| &after[i + 2..]);
        } else {
            return rest;
        }
        rest = rest.trim_start();
    }
}

/// Classify a statement by its keywords.
///
/// SELECT/PRAGMA/EXPLAIN statements are reads. A leading `WITH` clause is a
/// read unless a write keyword appears anywhere in the statement. Everything
/// else is a write. Leading comments are skipped before the first keyword
/// is taken.
pub fn is_read_only(sql: &str) -> bool {
    let mut words = skip_leading_comments(sql)
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_uppercase());

    let Some(first) = words.next() else {
        return false;
    };
    if READ_KEYWORDS.contains(&first.as_str()) {
        return true;
    }
    if first == "WITH" {
        return !words.any(|w| WRITE_KEYWORDS.contains(&w.as_str()));
    }
    false
}

/// Lifecycle of a queued task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Cancelled,
}

/// Execution metadata attached to results of queued writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskMeta {
    pub id: u64,
    pub elapsed: Duration,
}

/// Materialized statement result
#[derive(Debug, Clone, Default)]
pub struct Rows {
    pub columns: Vec<String>,
    pub values: Vec<Vec<Value>>,
    /// Rows changed by a write (summed over a batch)
    pub affected: usize,
    /// Present when the statement went through the queue
    pub task: Option<TaskMeta>,
}

impl Rows {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = RowRef<'_>> {
        self.values.iter().map(|values| RowRef { values })
    }

    pub fn first(&self) -> Option<RowRef<'_>> {
        self.values.first().map(|values| RowRef { values })
    }
}

/// Borrowed view over one result row with typed accessors
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    values: &'a [Value],
}

impl<'a> RowRef<'a> {
    pub fn value(&self, idx: usize) -> Result<&'a Value> {
        self.values
            .get(idx)
            .ok_or_else(|| KbError::Column(format!("column {} out of range", idx)))
    }

    pub fn text(&self, idx: usize) -> Result<String> {
        self.opt_text(idx)?
            .ok_or_else(|| KbError::Column(format!("column {} is NULL", idx)))
    }

    pub fn opt_text(&self, idx: usize) -> Result<Option<String>> {
        match self.value(idx)? {
            Value::Text(s) => Ok(Some(s.clone())),
            Value::Null => Ok(None),
            other => Err(KbError::Column(format!(
                "column {} expected text, got {:?}",
                idx,
                other.data_type()
            ))),
        }
    }

    pub fn int(&self, idx: usize) -> Result<i64> {
        match self.value(idx)? {
            Value::Integer(i) => Ok(*i),
            other => Err(KbError::Column(format!(
                "column {} expected integer, got {:?}",
                idx,
                other.data_type()
            ))),
        }
    }

    pub fn real(&self, idx: usize) -> Result<f64> {
        match self.value(idx)? {
            Value::Real(r) => Ok(*r),
            Value::Integer(i) => Ok(*i as f64),
            Value::Null => Ok(0.0),
            other => Err(KbError::Column(format!(
                "column {} expected real, got {:?}",
                idx,
                other.data_type()
            ))),
        }
    }

    pub fn blob(&self, idx: usize) -> Result<Option<&'a [u8]>> {
        match self.value(idx)? {
            Value::Blob(b) => Ok(Some(b.as_slice())),
            Value::Null => Ok(None),
            other => Err(KbError::Column(format!(
                "column {} expected blob, got {:?}",
                idx,
                other.data_type()
            ))),
        }
    }
}

enum Job {
    Single(Vec<Value>),
    Batch(Vec<Vec<Value>>),
}

struct TaskSlot {
    status: TaskStatus,
    outcome: Option<Result<Rows>>,
    /// Set by a waiter that gave up; the worker skips or discards the task.
    abandoned: bool,
}

struct Task {
    id: u64,
    sql: String,
    job: Job,
    created_at: Instant,
    slot: Mutex<TaskSlot>,
    done: Condvar,
}

struct QueueState {
    pending: VecDeque<Arc<Task>>,
    running: bool,
    next_id: u64,
}

struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                running: false,
                next_id: 1,
            }),
            available: Condvar::new(),
        }
    }

    fn enqueue(&self, sql: &str, job: Job) -> Result<Arc<Task>> {
        let mut state = lock(&self.state);
        if !state.running {
            return Err(KbError::QueueNotRunning);
        }
        let id = state.next_id;
        state.next_id += 1;

        let task = Arc::new(Task {
            id,
            sql: sql.to_string(),
            job,
            created_at: Instant::now(),
            slot: Mutex::new(TaskSlot {
                status: TaskStatus::Pending,
                outcome: None,
                abandoned: false,
            }),
            done: Condvar::new(),
        });
        state.pending.push_back(Arc::clone(&task));
        drop(state);

        self.available.notify_one();
        Ok(task)
    }

    /// Block until the task finishes, is cancelled, or `timeout` elapses.
    fn wait(&self, task: &Task, timeout: Duration) -> Result<Rows> {
        let deadline = Instant::now() + timeout;
        let mut slot = lock(&task.slot);
        loop {
            match slot.status {
                TaskStatus::Done => {
                    return slot.outcome.take().unwrap_or_else(|| {
                        Err(KbError::Column(format!("task {} has no result", task.id)))
                    });
                }
                TaskStatus::Cancelled => return Err(KbError::TaskCancelled(task.id)),
                TaskStatus::Pending | TaskStatus::Running => {}
            }

            let now = Instant::now();
            if now >= deadline {
                slot.abandoned = true;
                drop(slot);
                self.evict(task.id);
                log::warn!("Task {} timed out after {:?}", task.id, timeout);
                return Err(KbError::TaskTimeout {
                    id: task.id,
                    timeout,
                });
            }

            slot = task
                .done
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn evict(&self, id: u64) {
        lock(&self.state).pending.retain(|t| t.id != id);
    }

    /// Stop admitting tasks and cancel everything still pending.
    fn close(&self) -> usize {
        let drained: Vec<Arc<Task>> = {
            let mut state = lock(&self.state);
            state.running = false;
            state.pending.drain(..).collect()
        };
        self.available.notify_all();

        for task in &drained {
            let mut slot = lock(&task.slot);
            slot.status = TaskStatus::Cancelled;
            task.done.notify_all();
        }
        drained.len()
    }

    /// Next task in admission order, or `None` once the queue is closed.
    fn next_task(&self) -> Option<Arc<Task>> {
        let mut state = lock(&self.state);
        loop {
            if !state.running {
                return None;
            }
            if let Some(task) = state.pending.pop_front() {
                return Some(task);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

fn run_worker(shared: Arc<Shared>, mut conn: Connection) {
    log::debug!("Writer thread started");
    while let Some(task) = shared.next_task() {
        {
            let mut slot = lock(&task.slot);
            if slot.abandoned || slot.status != TaskStatus::Pending {
                continue;
            }
            slot.status = TaskStatus::Running;
        }

        let started = Instant::now();
        let outcome = match &task.job {
            Job::Single(params) => execute_statement(&conn, &task.sql, params),
            Job::Batch(rows) => execute_batch(&mut conn, &task.sql, rows),
        }
        .map_err(KbError::Statement);
        let elapsed = started.elapsed();

        if let Err(e) = &outcome {
            log::warn!("Task {} failed: {}", task.id, e);
        } else {
            log::debug!(
                "Task {} done in {:?} (queued {:?})",
                task.id,
                elapsed,
                started.duration_since(task.created_at)
            );
        }

        let mut slot = lock(&task.slot);
        if slot.abandoned {
            log::debug!("Discarding late result of task {}", task.id);
            continue;
        }
        slot.status = TaskStatus::Done;
        slot.outcome = Some(outcome.map(|mut rows| {
            rows.task = Some(TaskMeta {
                id: task.id,
                elapsed,
            });
            rows
        }));
        task.done.notify_all();
    }
    log::debug!("Writer thread exiting");
}

fn execute_statement(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<Rows> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    if columns.is_empty() {
        let affected = stmt.execute(params_from_iter(params.iter()))?;
        return Ok(Rows {
            columns,
            affected,
            ..Rows::default()
        });
    }

    let width = columns.len();
    let mut values = Vec::new();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    while let Some(row) = rows.next()? {
        let mut record = Vec::with_capacity(width);
        for idx in 0..width {
            record.push(row.get::<_, Value>(idx)?);
        }
        values.push(record);
    }
    drop(rows);

    Ok(Rows {
        columns,
        values,
        affected: conn.changes() as usize,
        task: None,
    })
}

fn execute_batch(conn: &mut Connection, sql: &str, rows: &[Vec<Value>]) -> rusqlite::Result<Rows> {
    let tx = conn.transaction()?;
    let mut affected = 0;
    {
        let mut stmt = tx.prepare(sql)?;
        for params in rows {
            affected += stmt.execute(params_from_iter(params.iter()))?;
        }
    }
    tx.commit()?;
    Ok(Rows {
        affected,
        ..Rows::default()
    })
}

/// Single-writer statement queue
pub struct MutationQueue {
    db: Db,
    default_timeout: Duration,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MutationQueue {
    pub fn new(db: Db, default_timeout: Duration) -> Self {
        Self {
            db,
            default_timeout,
            shared: Arc::new(Shared::new()),
            worker: Mutex::new(None),
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Open the writer connection, apply migrations and spawn the worker.
    ///
    /// Calling `start` on a running queue is a no-op. Failure to open the
    /// writer is returned to the caller and leaves the queue stopped.
    pub fn start(&self) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }

        let mut conn = self.db.open_connection()?;
        run_migrations(&mut conn)?;

        lock(&self.shared.state).running = true;
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("kbvault-writer".to_string())
            .spawn(move || run_worker(shared, conn));
        match handle {
            Ok(handle) => {
                *worker = Some(handle);
                log::info!("Mutation queue started on {}", self.db.path().display());
                Ok(())
            }
            Err(e) => {
                lock(&self.shared.state).running = false;
                Err(KbError::Io(e))
            }
        }
    }

    /// Cancel pending tasks and wait for the worker to finish its current one.
    pub fn stop(&self) {
        let cancelled = self.shared.close();
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                log::error!("Writer thread panicked");
            }
            log::info!("Mutation queue stopped ({} pending task(s) cancelled)", cancelled);
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.state).running
    }

    /// Number of tasks admitted but not yet picked up by the worker
    pub fn pending_tasks(&self) -> usize {
        lock(&self.shared.state).pending.len()
    }

    /// Execute with the default timeout.
    pub fn execute(&self, sql: &str, params: Vec<Value>) -> Result<Rows> {
        self.submit(sql, params, self.default_timeout)
    }

    /// Execute a statement: reads directly, writes through the worker.
    pub fn submit(&self, sql: &str, params: Vec<Value>, timeout: Duration) -> Result<Rows> {
        if is_read_only(sql) {
            return self.read(sql, &params);
        }
        let task = self.shared.enqueue(sql, Job::Single(params))?;
        self.shared.wait(&task, timeout)
    }

    /// Execute a multi-row write as one task with the default timeout.
    pub fn execute_many(&self, sql: &str, rows: Vec<Vec<Value>>) -> Result<Rows> {
        self.submit_batch(sql, rows, self.default_timeout)
    }

    /// Run `sql` once per parameter row inside a single transaction.
    pub fn submit_batch(
        &self,
        sql: &str,
        rows: Vec<Vec<Value>>,
        timeout: Duration,
    ) -> Result<Rows> {
        if rows.is_empty() {
            return Ok(Rows::default());
        }
        let task = self.shared.enqueue(sql, Job::Batch(rows))?;
        self.shared.wait(&task, timeout)
    }

    /// Run a statement on a short-lived connection owned by the caller.
    pub fn read(&self, sql: &str, params: &[Value]) -> Result<Rows> {
        let conn = self.db.open_connection()?;
        execute_statement(&conn, sql, params).map_err(KbError::Statement)
    }
}

impl Drop for MutationQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    fn started_queue(dir: &TempDir) -> Arc<MutationQueue> {
        let queue = MutationQueue::new(Db::new(dir.path().join("q.db")), Duration::from_secs(10));
        queue.start().unwrap();
        queue
            .execute(
                "CREATE TABLE log (seq INTEGER PRIMARY KEY AUTOINCREMENT, tag TEXT NOT NULL)",
                vec![],
            )
            .unwrap();
        Arc::new(queue)
    }

    #[test]
    fn test_classification() {
        assert!(is_read_only("SELECT * FROM document"));
        assert!(is_read_only("  select created_at from document"));
        assert!(is_read_only("PRAGMA table_info(document)"));
        assert!(is_read_only("WITH t AS (SELECT 1) SELECT * FROM t"));
        assert!(!is_read_only("WITH t AS (SELECT 1) DELETE FROM document"));
        assert!(!is_read_only("INSERT INTO log (tag) VALUES ('x')"));
        assert!(!is_read_only("UPDATE document SET load_state = 'Complete'"));
        assert!(!is_read_only("CREATE TABLE x (id INTEGER)"));
        assert!(!is_read_only(""));
    }

    #[test]
    fn test_classification_skips_leading_comments() {
        assert!(!is_read_only("/* SELECT */ INSERT INTO log (tag) VALUES ('x')"));
        assert!(!is_read_only("-- SELECT\nDELETE FROM log"));
        assert!(!is_read_only("/* SELECT unterminated"));
        assert!(is_read_only("/* count */ SELECT COUNT(*) FROM log"));
        assert!(is_read_only("-- first\n  -- second\nSELECT 1"));
    }

    #[test]
    fn test_commented_write_needs_running_queue() {
        let dir = TempDir::new().unwrap();
        let queue = started_queue(&dir);
        queue.stop();

        let err = queue
            .execute("/* SELECT */ INSERT INTO log (tag) VALUES ('x')", vec![])
            .unwrap_err();
        assert!(matches!(err, KbError::QueueNotRunning));

        let rows = queue.read("SELECT COUNT(*) FROM log", &[]).unwrap();
        assert_eq!(rows.first().unwrap().int(0).unwrap(), 0);
    }

    #[test]
    fn test_insert_then_read_sees_row() {
        let dir = TempDir::new().unwrap();
        let queue = started_queue(&dir);

        let rows = queue
            .execute(
                "INSERT INTO log (tag) VALUES (?1)",
                vec![Value::Text("hello".into())],
            )
            .unwrap();
        assert_eq!(rows.affected, 1);
        assert!(rows.task.is_some());

        let rows = queue
            .execute("SELECT tag FROM log", vec![])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.first().unwrap().text(0).unwrap(), "hello");
        assert!(rows.task.is_none());
    }

    #[test]
    fn test_reads_bypass_stopped_queue() {
        let dir = TempDir::new().unwrap();
        let db = Db::new(dir.path().join("q.db"));
        db.open_connection()
            .unwrap()
            .execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (42);")
            .unwrap();

        let queue = MutationQueue::new(db, Duration::from_secs(1));
        assert!(!queue.is_running());

        let rows = queue.execute("SELECT v FROM t", vec![]).unwrap();
        assert_eq!(rows.first().unwrap().int(0).unwrap(), 42);

        let err = queue
            .execute("INSERT INTO t VALUES (1)", vec![])
            .unwrap_err();
        assert!(matches!(err, KbError::QueueNotRunning));
    }

    #[test]
    fn test_concurrent_writers_fifo() {
        let dir = TempDir::new().unwrap();
        let queue = started_queue(&dir);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut observed = Vec::new();
                    for i in 0..10 {
                        let rows = queue
                            .execute(
                                "INSERT INTO log (tag) VALUES (?1) RETURNING seq",
                                vec![Value::Text(format!("{}-{}", t, i))],
                            )
                            .unwrap();
                        let seq = rows.first().unwrap().int(0).unwrap();
                        observed.push((rows.task.unwrap().id, seq));
                    }
                    observed
                })
            })
            .collect();

        let mut all: Vec<(u64, i64)> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_by_key(|(id, _)| *id);

        assert_eq!(all.len(), 80);
        for pair in all.windows(2) {
            assert!(pair[0].1 < pair[1].1, "writes ran out of admission order");
        }
    }

    #[test]
    fn test_statement_failure_is_local() {
        let dir = TempDir::new().unwrap();
        let queue = started_queue(&dir);

        let err = queue
            .execute("INSERT INTO missing_table VALUES (1)", vec![])
            .unwrap_err();
        assert!(matches!(err, KbError::Statement(_)));

        queue
            .execute(
                "INSERT INTO log (tag) VALUES (?1)",
                vec![Value::Text("still alive".into())],
            )
            .unwrap();
        let rows = queue.execute("SELECT COUNT(*) FROM log", vec![]).unwrap();
        assert_eq!(rows.first().unwrap().int(0).unwrap(), 1);
    }

    #[test]
    fn test_batch_is_single_task() {
        let dir = TempDir::new().unwrap();
        let queue = started_queue(&dir);

        let rows: Vec<Vec<Value>> = (0..5)
            .map(|i| vec![Value::Text(format!("row-{}", i))])
            .collect();
        let result = queue
            .execute_many("INSERT INTO log (tag) VALUES (?1)", rows)
            .unwrap();
        assert_eq!(result.affected, 5);

        let next = queue
            .execute("INSERT INTO log (tag) VALUES ('after')", vec![])
            .unwrap();
        assert_eq!(next.task.unwrap().id, result.task.unwrap().id + 1);
    }

    #[test]
    fn test_timeout_evicts_task() {
        let shared = Shared::new();
        lock(&shared.state).running = true;

        let task = shared.enqueue("INSERT INTO t VALUES (1)", Job::Single(vec![])).unwrap();
        let err = shared.wait(&task, Duration::from_millis(30)).unwrap_err();

        assert!(matches!(err, KbError::TaskTimeout { .. }));
        assert!(lock(&shared.state).pending.is_empty());
        assert!(lock(&task.slot).abandoned);
    }

    #[test]
    fn test_close_cancels_pending() {
        let shared = Arc::new(Shared::new());
        lock(&shared.state).running = true;
        let task = shared.enqueue("INSERT INTO t VALUES (1)", Job::Single(vec![])).unwrap();

        let waiter = {
            let shared = Arc::clone(&shared);
            let task = Arc::clone(&task);
            thread::spawn(move || shared.wait(&task, Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));

        assert_eq!(shared.close(), 1);
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, KbError::TaskCancelled(1)));
        assert!(matches!(
            shared.enqueue("INSERT INTO t VALUES (2)", Job::Single(vec![])),
            Err(KbError::QueueNotRunning)
        ));
    }

    #[test]
    fn test_stop_then_restart() {
        let dir = TempDir::new().unwrap();
        let queue = started_queue(&dir);

        queue.stop();
        assert!(!queue.is_running());
        queue.start().unwrap();
        queue
            .execute("INSERT INTO log (tag) VALUES ('again')", vec![])
            .unwrap();
    }
}
