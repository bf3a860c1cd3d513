//! Persistent block and file record store on SQLite

use cairn_core::store::{BlockStore, StoreUsage};
use cairn_core::{BlockId, Error, FileId, FileRecord, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// Local store for blocks and file records
pub struct SqliteStore {
    conn: Connection,
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

impl SqliteStore {
    /// Open or create the store database
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn)
    }

    /// Store that lives only as long as the process
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        // Create tables if they don't exist
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS blocks (
                id BLOB PRIMARY KEY,
                data BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS files (
                id BLOB PRIMARY KEY,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                record_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS files_created_at ON files(created_at);
            "#,
        )
        .map_err(db_err)?;

        Ok(Self { conn })
    }
}

impl BlockStore for SqliteStore {
    fn put_block(&mut self, id: &BlockId, bytes: &[u8]) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO blocks (id, data) VALUES (?, ?)",
                params![id.as_bytes().as_slice(), bytes],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn get_block(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        self.conn
            .query_row(
                "SELECT data FROM blocks WHERE id = ?",
                params![id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)
    }

    fn delete_block(&mut self, id: &BlockId) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM blocks WHERE id = ?",
                params![id.as_bytes().as_slice()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn put_file_record(&mut self, record: &FileRecord) -> Result<()> {
        let record_json = serde_json::to_string(record)?;
        self.conn
            .execute(
                r#"
                INSERT OR REPLACE INTO files (id, name, created_at, record_json)
                VALUES (?, ?, ?, ?)
                "#,
                params![
                    record.id.as_bytes().as_slice(),
                    record.name,
                    record.created_at as i64,
                    record_json,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn get_file_record(&self, id: &FileId) -> Result<Option<FileRecord>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT record_json FROM files WHERE id = ?",
                params![id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn list_file_records(&self) -> Result<Vec<FileRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT record_json FROM files ORDER BY created_at, rowid")
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(Error::from))
            .collect()
    }

    fn delete_file_record(&mut self, id: &FileId) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM files WHERE id = ?",
                params![id.as_bytes().as_slice()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn usage(&self) -> Result<StoreUsage> {
        let (count, bytes): (i64, i64) = self
            .conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(LENGTH(data)), 0) FROM blocks",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(db_err)?;
        Ok(StoreUsage {
            block_count: count as u64,
            bytes: bytes as u64,
        })
    }
}
