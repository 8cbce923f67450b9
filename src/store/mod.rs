//! Durable SQLite store for tabs, tasks and global variables.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::models::module::TaskKind;
use crate::models::tab::Tab;
use crate::models::task::{ExitOutcome, Task, TaskStatus};

pub const ENGINE_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

pub struct Store {
    conn: Mutex<Connection>,
}

const TASK_COLUMNS: &str = "id, tab_id, module_id, module_name, kind, target, command, status, \
     output, truncated, plan_json, steps_json, context_json, env_json, workdir, pid, \
     created_at, started_at, ended_at, exit_json, marker";

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > ENGINE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: ENGINE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.conn();
            conn.execute_batch(include_str!("../../migrations/0001_engine_schema.sql"))?;
            conn.execute_batch("PRAGMA user_version = 1;")?;
        }

        Ok(())
    }

    // --- tabs ---

    pub fn create_tab(&self, name: &str) -> Result<Tab, StorageError> {
        let created_at = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tabs (name, created_at) VALUES (?1, ?2)",
            params![name, created_at.to_rfc3339()],
        )?;
        Ok(Tab {
            id: conn.last_insert_rowid() as u64,
            name: name.to_string(),
            created_at,
        })
    }

    pub fn rename_tab(&self, id: u64, name: &str) -> Result<bool, StorageError> {
        let changes = self.conn().execute(
            "UPDATE tabs SET name = ?1 WHERE id = ?2",
            params![name, id as i64],
        )?;
        Ok(changes > 0)
    }

    pub fn delete_tab(&self, id: u64) -> Result<bool, StorageError> {
        let changes = self
            .conn()
            .execute("DELETE FROM tabs WHERE id = ?1", params![id as i64])?;
        Ok(changes > 0)
    }

    pub fn get_tab(&self, id: u64) -> Result<Option<Tab>, StorageError> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, name, created_at FROM tabs WHERE id = ?1",
                params![id as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(id, name, created_at)| {
            Ok(Tab {
                id: id as u64,
                name,
                created_at: parse_ts(&created_at)?,
            })
        })
        .transpose()
    }

    pub fn list_tabs(&self) -> Result<Vec<Tab>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, name, created_at FROM tabs ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, name, created_at)| {
                Ok(Tab {
                    id: id as u64,
                    name,
                    created_at: parse_ts(&created_at)?,
                })
            })
            .collect()
    }

    // --- tasks ---

    /// Inserts a new task and returns its id. The `id` field of `task` is
    /// ignored; ids come from the table's AUTOINCREMENT sequence and are never
    /// reused.
    pub fn insert_task(&self, task: &Task) -> Result<u64, StorageError> {
        let row = TaskColumns::from_task(task)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tasks (tab_id, module_id, module_name, kind, target, command, status,
                output, truncated, plan_json, steps_json, context_json, env_json, workdir, pid,
                created_at, started_at, ended_at, exit_json, marker)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20)",
            params![
                task.tab_id as i64,
                task.module_id,
                task.module_name,
                task.kind.as_str(),
                task.target,
                task.command,
                task.status.as_str(),
                task.output,
                task.truncated,
                row.plan_json,
                row.steps_json,
                row.context_json,
                row.env_json,
                task.workdir,
                task.pid.map(i64::from),
                task.created_at.to_rfc3339(),
                task.started_at.map(|t| t.to_rfc3339()),
                task.ended_at.map(|t| t.to_rfc3339()),
                row.exit_json,
                task.marker,
            ],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    /// Writes the mutable part of a task record. Returns false when the task
    /// no longer exists.
    pub fn update_task(&self, task: &Task) -> Result<bool, StorageError> {
        let row = TaskColumns::from_task(task)?;
        let changes = self.conn().execute(
            "UPDATE tasks SET command = ?2, status = ?3, output = ?4, truncated = ?5,
                steps_json = ?6, context_json = ?7, pid = ?8, started_at = ?9, ended_at = ?10,
                exit_json = ?11, marker = ?12
             WHERE id = ?1",
            params![
                task.id as i64,
                task.command,
                task.status.as_str(),
                task.output,
                task.truncated,
                row.steps_json,
                row.context_json,
                task.pid.map(i64::from),
                task.started_at.map(|t| t.to_rfc3339()),
                task.ended_at.map(|t| t.to_rfc3339()),
                row.exit_json,
                task.marker,
            ],
        )?;
        Ok(changes > 0)
    }

    pub fn delete_task(&self, id: u64) -> Result<bool, StorageError> {
        let changes = self
            .conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![id as i64])?;
        Ok(changes > 0)
    }

    pub fn load_tasks(&self) -> Result<Vec<Task>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM tasks ORDER BY id", TASK_COLUMNS))?;
        let rows = stmt
            .query_map([], TaskRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    // --- global variables ---

    pub fn global_vars(&self) -> Result<BTreeMap<String, String>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key, value FROM global_vars ORDER BY key")?;
        let vars = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<BTreeMap<String, String>, _>>()?;
        Ok(vars)
    }

    pub fn set_global_var(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.conn().execute(
            "INSERT INTO global_vars (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_global_var(&self, key: &str) -> Result<bool, StorageError> {
        let changes = self
            .conn()
            .execute("DELETE FROM global_vars WHERE key = ?1", params![key])?;
        Ok(changes > 0)
    }
}

struct TaskColumns {
    plan_json: String,
    steps_json: String,
    context_json: String,
    env_json: String,
    exit_json: Option<String>,
}

impl TaskColumns {
    fn from_task(task: &Task) -> Result<Self, StorageError> {
        Ok(Self {
            plan_json: to_json(&task.plan)?,
            steps_json: to_json(&task.steps)?,
            context_json: to_json(&task.context)?,
            env_json: to_json(&task.env)?,
            exit_json: task.exit.as_ref().map(to_json).transpose()?,
        })
    }
}

struct TaskRow {
    id: i64,
    tab_id: i64,
    module_id: String,
    module_name: String,
    kind: String,
    target: Option<String>,
    command: String,
    status: String,
    output: String,
    truncated: bool,
    plan_json: String,
    steps_json: String,
    context_json: String,
    env_json: String,
    workdir: Option<String>,
    pid: Option<i64>,
    created_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    exit_json: Option<String>,
    marker: Option<String>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tab_id: row.get(1)?,
            module_id: row.get(2)?,
            module_name: row.get(3)?,
            kind: row.get(4)?,
            target: row.get(5)?,
            command: row.get(6)?,
            status: row.get(7)?,
            output: row.get(8)?,
            truncated: row.get(9)?,
            plan_json: row.get(10)?,
            steps_json: row.get(11)?,
            context_json: row.get(12)?,
            env_json: row.get(13)?,
            workdir: row.get(14)?,
            pid: row.get(15)?,
            created_at: row.get(16)?,
            started_at: row.get(17)?,
            ended_at: row.get(18)?,
            exit_json: row.get(19)?,
            marker: row.get(20)?,
        })
    }

    fn into_task(self) -> Result<Task, StorageError> {
        let status = self
            .status
            .parse::<TaskStatus>()
            .map_err(StorageError::Corrupt)?;
        let kind = TaskKind::parse(&self.kind)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown task kind '{}'", self.kind)))?;
        let exit: Option<ExitOutcome> = self.exit_json.as_deref().map(from_json).transpose()?;
        Ok(Task {
            id: self.id as u64,
            tab_id: self.tab_id as u64,
            module_id: self.module_id,
            module_name: self.module_name,
            kind,
            target: self.target,
            command: self.command,
            status,
            output: self.output,
            truncated: self.truncated,
            plan: from_json(&self.plan_json)?,
            steps: from_json(&self.steps_json)?,
            context: from_json(&self.context_json)?,
            env: from_json(&self.env_json)?,
            workdir: self.workdir,
            pid: self.pid.map(|pid| pid as u32),
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            ended_at: self.ended_at.as_deref().map(parse_ts).transpose()?,
            exit,
            marker: self.marker,
        })
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|err| StorageError::Serialization(err.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StorageError> {
    serde_json::from_str(raw).map_err(|err| StorageError::Serialization(err.to_string()))
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(format!("{}: {}", raw, err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_task;
    use tempfile::TempDir;

    #[test]
    fn migrates_fresh_database() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), ENGINE_SCHEMA_VERSION);
        // idempotent
        store.migrate().unwrap();
    }

    #[test]
    fn tab_crud() {
        let store = Store::open_in_memory().unwrap();
        let lan = store.create_tab("lan").unwrap();
        let dmz = store.create_tab("dmz").unwrap();
        assert!(dmz.id > lan.id);

        assert!(store.rename_tab(lan.id, "internal").unwrap());
        assert_eq!(store.get_tab(lan.id).unwrap().unwrap().name, "internal");
        assert!(!store.rename_tab(999, "ghost").unwrap());

        assert!(store.delete_tab(dmz.id).unwrap());
        let names: Vec<_> = store.list_tabs().unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["internal".to_string()]);
        assert!(store.get_tab(dmz.id).unwrap().is_none());
    }

    #[test]
    fn task_round_trip_and_update() {
        let store = Store::open_in_memory().unwrap();
        let tab = store.create_tab("lan").unwrap();
        let mut task = sample_task(tab.id, "echo hi");
        task.context.insert("target".to_string(), "10.0.0.1".to_string());
        task.id = store.insert_task(&task).unwrap();

        task.status = TaskStatus::Completed;
        task.output = "hi\n".to_string();
        task.exit = Some(ExitOutcome::Code(0));
        task.marker = Some("exit code 0".to_string());
        task.started_at = Some(Utc::now());
        task.ended_at = Some(Utc::now());
        assert!(store.update_task(&task).unwrap());

        let loaded = store.load_tasks().unwrap();
        assert_eq!(loaded.len(), 1);
        let stored = &loaded[0];
        assert_eq!(stored.id, task.id);
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.output, "hi\n");
        assert_eq!(stored.exit, Some(ExitOutcome::Code(0)));
        assert_eq!(stored.context.get("target").map(String::as_str), Some("10.0.0.1"));
        assert_eq!(stored.plan, task.plan);
    }

    #[test]
    fn task_ids_are_not_reused_after_delete() {
        let store = Store::open_in_memory().unwrap();
        let tab = store.create_tab("lan").unwrap();
        let first = store.insert_task(&sample_task(tab.id, "true")).unwrap();
        assert!(store.delete_task(first).unwrap());
        let second = store.insert_task(&sample_task(tab.id, "true")).unwrap();
        assert!(second > first);
        assert!(!store.delete_task(first).unwrap());
    }

    #[test]
    fn deleting_a_tab_cascades_to_its_tasks() {
        let store = Store::open_in_memory().unwrap();
        let tab = store.create_tab("lan").unwrap();
        store.insert_task(&sample_task(tab.id, "true")).unwrap();
        store.delete_tab(tab.id).unwrap();
        assert!(store.load_tasks().unwrap().is_empty());
    }

    #[test]
    fn task_insert_requires_existing_tab() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.insert_task(&sample_task(42, "true")).is_err());
    }

    #[test]
    fn global_vars_upsert_and_delete() {
        let store = Store::open_in_memory().unwrap();
        store.set_global_var("DOMAIN", "corp.local").unwrap();
        store.set_global_var("DOMAIN", "lab.local").unwrap();
        store.set_global_var("USER", "audit").unwrap();
        let vars = store.global_vars().unwrap();
        assert_eq!(vars.get("DOMAIN").map(String::as_str), Some("lab.local"));
        assert_eq!(vars.len(), 2);

        assert!(store.delete_global_var("USER").unwrap());
        assert!(!store.delete_global_var("USER").unwrap());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.db");
        {
            let store = Store::open(&path).unwrap();
            let tab = store.create_tab("lan").unwrap();
            store.insert_task(&sample_task(tab.id, "true")).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.list_tabs().unwrap().len(), 1);
        assert_eq!(store.load_tasks().unwrap().len(), 1);
    }
}
