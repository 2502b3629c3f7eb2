//! SQLite-backed store, one file per working directory.
//!
//! Each table keeps the columns used for lookups next to a JSON `data`
//! column holding the full record.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FleetError, Result};
use crate::job::{Job, JobId, JobSpec, UserId};
use crate::store::{Compiler, JobFilter, NewProgram, NewUser, Program, Store, User};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner INTEGER NOT NULL,
        workstation TEXT,
        state INTEGER NOT NULL,
        data TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email TEXT NOT NULL UNIQUE,
        data TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS programs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        data TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS compilers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        data TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner);
    CREATE INDEX IF NOT EXISTS idx_jobs_workstation ON jobs(workstation);
    CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FleetError::Internal(format!("failed to acquire lock: {}", e)))?;
        Ok(f(&conn)?)
    }
}

fn encode<T: Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn decode<T: DeserializeOwned>(json: &str) -> rusqlite::Result<T> {
    serde_json::from_str(json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

fn collect<T: DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> rusqlite::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(decode(&row?)?);
    }
    Ok(out)
}

impl Store for SqliteStore {
    fn add_job(&self, owner: UserId, spec: JobSpec) -> Result<Job> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO jobs (owner, state, data) VALUES (?1, 0, '{}')",
                params![owner as i64],
            )?;
            let id = tx.last_insert_rowid() as JobId;
            let job = Job::new(id, owner, spec);
            tx.execute(
                "UPDATE jobs SET state = ?1, data = ?2 WHERE id = ?3",
                params![job.state.id(), encode(&job)?, id as i64],
            )?;
            tx.commit()?;
            Ok(job)
        })
    }

    fn job(&self, id: JobId) -> Result<Option<Job>> {
        self.with_conn(|conn| {
            let data: Option<String> = conn
                .query_row(
                    "SELECT data FROM jobs WHERE id = ?1",
                    params![id as i64],
                    |row| row.get(0),
                )
                .optional()?;
            data.map(|json| decode(&json)).transpose()
        })
    }

    fn save_job(&self, job: &Job) -> Result<()> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET owner = ?1, workstation = ?2, state = ?3, data = ?4 WHERE id = ?5",
                params![
                    job.owner as i64,
                    job.workstation,
                    job.state.id(),
                    encode(job)?,
                    job.id as i64,
                ],
            )
        })?;
        if changed == 0 {
            return Err(FleetError::JobNotFound(job.id));
        }
        Ok(())
    }

    fn jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let jobs: Vec<Job> = self.with_conn(|conn| {
            collect(
                conn,
                "SELECT data FROM jobs
                 WHERE (?1 IS NULL OR owner = ?1) AND (?2 IS NULL OR workstation = ?2)
                 ORDER BY id",
                params![filter.owner.map(|o| o as i64), filter.workstation],
            )
        })?;
        Ok(jobs.into_iter().filter(|job| filter.matches(job)).collect())
    }

    fn add_user(&self, user: NewUser) -> Result<User> {
        let exists = self.user_by_email(&user.email)?.is_some();
        if exists {
            return Err(FleetError::PermissionDenied(format!(
                "user {} already exists",
                user.email
            )));
        }
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO users (email, data) VALUES (?1, '{}')",
                params![user.email],
            )?;
            let user = User {
                id: tx.last_insert_rowid() as UserId,
                email: user.email,
                first_name: user.first_name,
                last_name: user.last_name,
                admin: user.admin,
            };
            tx.execute(
                "UPDATE users SET data = ?1 WHERE id = ?2",
                params![encode(&user)?, user.id as i64],
            )?;
            tx.commit()?;
            Ok(user)
        })
    }

    fn user(&self, id: UserId) -> Result<Option<User>> {
        self.with_conn(|conn| {
            let data: Option<String> = conn
                .query_row(
                    "SELECT data FROM users WHERE id = ?1",
                    params![id as i64],
                    |row| row.get(0),
                )
                .optional()?;
            data.map(|json| decode(&json)).transpose()
        })
    }

    fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.with_conn(|conn| {
            let data: Option<String> = conn
                .query_row(
                    "SELECT data FROM users WHERE email = ?1",
                    params![email],
                    |row| row.get(0),
                )
                .optional()?;
            data.map(|json| decode(&json)).transpose()
        })
    }

    fn delete_user(&self, id: UserId) -> Result<bool> {
        let removed = self.with_conn(|conn| {
            conn.execute("DELETE FROM users WHERE id = ?1", params![id as i64])
        })?;
        Ok(removed > 0)
    }

    fn users(&self) -> Result<Vec<User>> {
        self.with_conn(|conn| collect(conn, "SELECT data FROM users ORDER BY id", params![]))
    }

    fn add_program(&self, program: NewProgram) -> Result<Program> {
        self.with_conn(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT data FROM programs WHERE name = ?1",
                    params![program.name],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(json) = existing {
                return decode(&json);
            }

            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO programs (name, data) VALUES (?1, '{}')",
                params![program.name],
            )?;
            let program = Program {
                id: tx.last_insert_rowid() as u64,
                name: program.name,
                executable: program.executable,
                path: program.path,
                version: program.version,
            };
            tx.execute(
                "UPDATE programs SET data = ?1 WHERE id = ?2",
                params![encode(&program)?, program.id as i64],
            )?;
            tx.commit()?;
            Ok(program)
        })
    }

    fn delete_program(&self, name: &str) -> Result<bool> {
        let removed = self.with_conn(|conn| {
            conn.execute("DELETE FROM programs WHERE name = ?1", params![name])
        })?;
        Ok(removed > 0)
    }

    fn programs(&self) -> Result<Vec<Program>> {
        self.with_conn(|conn| collect(conn, "SELECT data FROM programs ORDER BY id", params![]))
    }

    fn add_compiler(&self, name: &str, description: &str) -> Result<Compiler> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO compilers (name, data) VALUES (?1, '{}')",
                params![name],
            )?;
            let compiler = Compiler {
                id: tx.last_insert_rowid() as u64,
                name: name.to_string(),
                description: description.to_string(),
            };
            tx.execute(
                "UPDATE compilers SET data = ?1 WHERE id = ?2",
                params![encode(&compiler)?, compiler.id as i64],
            )?;
            tx.commit()?;
            Ok(compiler)
        })
    }

    fn compilers(&self) -> Result<Vec<Compiler>> {
        self.with_conn(|conn| collect(conn, "SELECT data FROM compilers ORDER BY id", params![]))
    }
}
