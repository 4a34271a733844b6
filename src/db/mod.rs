use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::similarity::{angular_similarity, decode_vector};

pub mod migrate;
pub mod queue;

pub use queue::{is_read_only, MutationQueue, RowRef, Rows, TaskMeta};

/// Name of the scalar SQL function installed on every connection.
pub const SIMILARITY_FUNCTION: &str = "angular_similarity";

/// Database location and connection factory
#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self {
            path: db_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a new connection with pragmas set and the similarity function registered.
    ///
    /// The mutation queue holds one of these for its whole lifetime; readers
    /// open a fresh one per statement.
    pub fn open_connection(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&self.path)?;

        // WAL lets readers proceed while the single writer holds its transaction.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL; \
             PRAGMA synchronous = NORMAL; \
             PRAGMA foreign_keys = ON; \
             PRAGMA temp_store = MEMORY; \
             PRAGMA cache_size = -65536; \
             PRAGMA mmap_size = 268435456; \
             PRAGMA wal_autocheckpoint = 1000;",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;

        register_functions(&conn)?;
        Ok(conn)
    }
}

/// Install `angular_similarity(blob, blob) -> real`.
///
/// NULL or malformed arguments score 0.0 rather than failing the query.
pub fn register_functions(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        SIMILARITY_FUNCTION,
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let a: Option<Vec<u8>> = ctx.get(0)?;
            let b: Option<Vec<u8>> = ctx.get(1)?;
            let score = match (
                a.as_deref().and_then(decode_vector),
                b.as_deref().and_then(decode_vector),
            ) {
                (Some(a), Some(b)) => angular_similarity(&a, &b),
                _ => 0.0,
            };
            Ok(f64::from(score))
        },
    )?;
    Ok(())
}
