//! 任务存储：属主隔离的任务 CRUD 与依赖图
//!
//! 依赖图不变量：同一用户的 depends-on 有向图任何时刻无环。加边时在
//! 同一事务内做可达性搜索再插入，并发写者无法把环竞态进来；检查失败
//! 则整个操作原子拒绝，不提交任何变更。

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use crate::core::{AgentError, DomainError};

/// 任务存储错误：业务失败（可回馈模型）或存储故障（中断轮次）
#[derive(Error, Debug)]
pub enum TaskStoreError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Storage(#[from] AgentError),
}

impl From<rusqlite::Error> for TaskStoreError {
    fn from(e: rusqlite::Error) -> Self {
        TaskStoreError::Storage(e.into())
    }
}

/// 单个任务
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Task {
    pub id: i64,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub completed: bool,
    pub priority: String,
    pub due_date: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 列表过滤：全部 / 未完成 / 已完成
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskFilter {
    All,
    Pending,
    Completed,
}

impl TaskFilter {
    pub fn parse(s: &str) -> Option<TaskFilter> {
        match s {
            "all" => Some(TaskFilter::All),
            "pending" => Some(TaskFilter::Pending),
            "completed" => Some(TaskFilter::Completed),
            _ => None,
        }
    }
}

/// update_task 的可选字段补丁；None 表示不修改
#[derive(Clone, Debug, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub due_date: Option<String>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.due_date.is_none()
    }
}

/// 任务存储：Mutex<Connection>，所有变更走事务化 API
pub struct TaskStore {
    conn: Mutex<Connection>,
}

impl TaskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, AgentError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AgentError> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS tasks (
                 id          INTEGER PRIMARY KEY AUTOINCREMENT,
                 user_id     TEXT NOT NULL,
                 title       TEXT NOT NULL,
                 description TEXT,
                 completed   INTEGER NOT NULL DEFAULT 0,
                 priority    TEXT NOT NULL DEFAULT 'medium',
                 due_date    TEXT,
                 created_at  TEXT NOT NULL,
                 updated_at  TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks (user_id);
             CREATE TABLE IF NOT EXISTS task_dependencies (
                 id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                 task_id             INTEGER NOT NULL
                     REFERENCES tasks(id) ON DELETE CASCADE,
                 depends_on_task_id  INTEGER NOT NULL
                     REFERENCES tasks(id) ON DELETE CASCADE,
                 UNIQUE (task_id, depends_on_task_id)
             );",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_task(
        &self,
        user_id: &str,
        title: &str,
        description: Option<&str>,
        priority: &str,
        due_date: Option<&str>,
    ) -> Result<Task, TaskStoreError> {
        let now = Utc::now();
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO tasks (user_id, title, description, completed, priority, due_date, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?6)",
            params![user_id, title, description, priority, due_date, now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Task {
            id,
            user_id: user_id.to_string(),
            title: title.to_string(),
            description: description.map(String::from),
            completed: false,
            priority: priority.to_string(),
            due_date: due_date.map(String::from),
            created_at: now,
            updated_at: now,
        })
    }

    /// 读取任务并校验属主：不存在 => TaskNotFound，属主不匹配 => NotOwner
    pub fn get_task_owned(&self, user_id: &str, task_id: i64) -> Result<Task, TaskStoreError> {
        let conn = self.lock_conn();
        Self::fetch_owned(&conn, user_id, task_id)
    }

    fn fetch_owned(conn: &Connection, user_id: &str, task_id: i64) -> Result<Task, TaskStoreError> {
        let task = conn
            .query_row(
                "SELECT id, user_id, title, description, completed, priority, due_date, created_at, updated_at
                 FROM tasks WHERE id = ?1",
                params![task_id],
                Self::row_to_task,
            )
            .optional()?
            .ok_or(DomainError::TaskNotFound(task_id))?;
        if task.user_id != user_id {
            return Err(DomainError::NotOwner(task_id).into());
        }
        Ok(task)
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
        Ok(Task {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            completed: row.get::<_, i64>(4)? != 0,
            priority: row.get(5)?,
            due_date: row.get(6)?,
            created_at: parse_ts(&row.get::<_, String>(7)?),
            updated_at: parse_ts(&row.get::<_, String>(8)?),
        })
    }

    pub fn list_tasks(&self, user_id: &str, filter: TaskFilter) -> Result<Vec<Task>, TaskStoreError> {
        let conn = self.lock_conn();
        let clause = match filter {
            TaskFilter::All => "",
            TaskFilter::Pending => " AND completed = 0",
            TaskFilter::Completed => " AND completed = 1",
        };
        let sql = format!(
            "SELECT id, user_id, title, description, completed, priority, due_date, created_at, updated_at
             FROM tasks WHERE user_id = ?1{clause} ORDER BY id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], Self::row_to_task)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn update_task(
        &self,
        user_id: &str,
        task_id: i64,
        patch: TaskPatch,
    ) -> Result<Task, TaskStoreError> {
        let now = Utc::now();
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let mut task = Self::fetch_owned(&tx, user_id, task_id)?;
        if let Some(title) = patch.title {
            task.title = title;
        }
        if let Some(description) = patch.description {
            task.description = Some(description);
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
        }
        if let Some(due_date) = patch.due_date {
            task.due_date = Some(due_date);
        }
        task.updated_at = now;
        tx.execute(
            "UPDATE tasks SET title = ?1, description = ?2, priority = ?3, due_date = ?4, updated_at = ?5
             WHERE id = ?6",
            params![task.title, task.description, task.priority, task.due_date, now.to_rfc3339(), task_id],
        )?;
        tx.commit()?;
        Ok(task)
    }

    /// 完成任务；存在未完成的前置依赖时拒绝（DependenciesIncomplete）
    pub fn complete_task(&self, user_id: &str, task_id: i64) -> Result<Task, TaskStoreError> {
        let now = Utc::now();
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let mut task = Self::fetch_owned(&tx, user_id, task_id)?;

        let mut pending = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT d.depends_on_task_id FROM task_dependencies d
                 JOIN tasks t ON t.id = d.depends_on_task_id
                 WHERE d.task_id = ?1 AND t.completed = 0
                 ORDER BY d.depends_on_task_id ASC",
            )?;
            let rows = stmt.query_map(params![task_id], |row| row.get::<_, i64>(0))?;
            for row in rows {
                pending.push(row?);
            }
        }
        if !pending.is_empty() {
            return Err(DomainError::DependenciesIncomplete { task_id, pending }.into());
        }

        tx.execute(
            "UPDATE tasks SET completed = 1, updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), task_id],
        )?;
        tx.commit()?;
        task.completed = true;
        task.updated_at = now;
        Ok(task)
    }

    /// 删除任务（依赖边级联删除），返回删除前的任务
    pub fn delete_task(&self, user_id: &str, task_id: i64) -> Result<Task, TaskStoreError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let task = Self::fetch_owned(&tx, user_id, task_id)?;
        tx.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
        tx.commit()?;
        Ok(task)
    }

    /// 添加依赖边 task -> depends_on
    ///
    /// 自依赖、重复边、任一端不属于调用者、或 depends_on 已可达 task
    /// （加边会闭环）时拒绝；可达性搜索与插入在同一事务内完成。
    pub fn add_dependency(
        &self,
        user_id: &str,
        task_id: i64,
        depends_on: i64,
    ) -> Result<(), TaskStoreError> {
        if task_id == depends_on {
            return Err(DomainError::SelfDependency(task_id).into());
        }

        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        Self::fetch_owned(&tx, user_id, task_id)?;
        Self::fetch_owned(&tx, user_id, depends_on)?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT id FROM task_dependencies WHERE task_id = ?1 AND depends_on_task_id = ?2",
                params![task_id, depends_on],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(DomainError::DuplicateDependency { task_id, depends_on }.into());
        }

        if Self::reaches(&tx, depends_on, task_id)? {
            return Err(DomainError::CircularDependency { task_id, depends_on }.into());
        }

        tx.execute(
            "INSERT INTO task_dependencies (task_id, depends_on_task_id) VALUES (?1, ?2)",
            params![task_id, depends_on],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// 深度优先：沿 depends-on 边从 from 出发能否到达 target
    fn reaches(conn: &Connection, from: i64, target: i64) -> Result<bool, TaskStoreError> {
        let mut visited: HashSet<i64> = HashSet::new();
        let mut queue = vec![from];
        let mut stmt =
            conn.prepare("SELECT depends_on_task_id FROM task_dependencies WHERE task_id = ?1")?;
        while let Some(current) = queue.pop() {
            if !visited.insert(current) {
                continue;
            }
            let rows = stmt.query_map(params![current], |row| row.get::<_, i64>(0))?;
            for row in rows {
                let next = row?;
                if next == target {
                    return Ok(true);
                }
                queue.push(next);
            }
        }
        Ok(false)
    }

    /// 任务的直接依赖（测试与展示用）
    pub fn dependencies_of(&self, task_id: i64) -> Result<Vec<i64>, TaskStoreError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT depends_on_task_id FROM task_dependencies WHERE task_id = ?1 ORDER BY depends_on_task_id",
        )?;
        let rows = stmt.query_map(params![task_id], |row| row.get::<_, i64>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::open_in_memory().unwrap()
    }

    fn mk(s: &TaskStore, user: &str, title: &str) -> i64 {
        s.create_task(user, title, None, "medium", None).unwrap().id
    }

    fn domain(err: TaskStoreError) -> DomainError {
        match err {
            TaskStoreError::Domain(d) => d,
            TaskStoreError::Storage(e) => panic!("unexpected storage error: {e}"),
        }
    }

    #[test]
    fn rejects_self_dependency() {
        let s = store();
        let a = mk(&s, "u1", "A");
        let err = domain(s.add_dependency("u1", a, a).unwrap_err());
        assert_eq!(err, DomainError::SelfDependency(a));
    }

    #[test]
    fn rejects_cycle_through_chain() {
        let s = store();
        let a = mk(&s, "u1", "A");
        let b = mk(&s, "u1", "B");
        let c = mk(&s, "u1", "C");
        s.add_dependency("u1", a, b).unwrap();
        s.add_dependency("u1", b, c).unwrap();

        let err = domain(s.add_dependency("u1", c, a).unwrap_err());
        assert_eq!(err, DomainError::CircularDependency { task_id: c, depends_on: a });
        // 拒绝是原子的：C 没有新增任何依赖
        assert!(s.dependencies_of(c).unwrap().is_empty());
    }

    #[test]
    fn allows_diamond_without_cycle() {
        let s = store();
        let a = mk(&s, "u1", "A");
        let b = mk(&s, "u1", "B");
        let c = mk(&s, "u1", "C");
        let d = mk(&s, "u1", "D");
        s.add_dependency("u1", a, b).unwrap();
        s.add_dependency("u1", a, c).unwrap();
        s.add_dependency("u1", b, d).unwrap();
        s.add_dependency("u1", c, d).unwrap();
        assert_eq!(s.dependencies_of(a).unwrap(), vec![b, c]);
    }

    #[test]
    fn rejects_duplicate_edge() {
        let s = store();
        let a = mk(&s, "u1", "A");
        let b = mk(&s, "u1", "B");
        s.add_dependency("u1", a, b).unwrap();
        let err = domain(s.add_dependency("u1", a, b).unwrap_err());
        assert_eq!(err, DomainError::DuplicateDependency { task_id: a, depends_on: b });
    }

    #[test]
    fn ownership_is_checked_on_both_endpoints() {
        let s = store();
        let a = mk(&s, "u1", "A");
        let x = mk(&s, "u2", "X");
        let err = domain(s.add_dependency("u1", a, x).unwrap_err());
        assert_eq!(err, DomainError::NotOwner(x));
        let err = domain(s.get_task_owned("u2", a).unwrap_err());
        assert_eq!(err, DomainError::NotOwner(a));
    }

    #[test]
    fn complete_blocked_until_dependencies_done() {
        let s = store();
        let a = mk(&s, "u1", "A");
        let b = mk(&s, "u1", "B");
        s.add_dependency("u1", a, b).unwrap();

        let err = domain(s.complete_task("u1", a).unwrap_err());
        assert_eq!(err, DomainError::DependenciesIncomplete { task_id: a, pending: vec![b] });

        s.complete_task("u1", b).unwrap();
        let done = s.complete_task("u1", a).unwrap();
        assert!(done.completed);
    }

    #[test]
    fn list_filters_by_status() {
        let s = store();
        let a = mk(&s, "u1", "A");
        mk(&s, "u1", "B");
        mk(&s, "u2", "other");
        s.complete_task("u1", a).unwrap();

        assert_eq!(s.list_tasks("u1", TaskFilter::All).unwrap().len(), 2);
        assert_eq!(s.list_tasks("u1", TaskFilter::Completed).unwrap().len(), 1);
        assert_eq!(s.list_tasks("u1", TaskFilter::Pending).unwrap().len(), 1);
    }

    #[test]
    fn update_patches_only_given_fields() {
        let s = store();
        let id = mk(&s, "u1", "Old title");
        let task = s
            .update_task(
                "u1",
                id,
                TaskPatch { title: Some("New title".into()), ..TaskPatch::default() },
            )
            .unwrap();
        assert_eq!(task.title, "New title");
        assert_eq!(task.priority, "medium");

        let err = domain(s.update_task("u1", 999, TaskPatch::default()).unwrap_err());
        assert_eq!(err, DomainError::TaskNotFound(999));
    }

    #[test]
    fn delete_returns_task_and_drops_edges() {
        let s = store();
        let a = mk(&s, "u1", "A");
        let b = mk(&s, "u1", "B");
        s.add_dependency("u1", a, b).unwrap();
        let gone = s.delete_task("u1", b).unwrap();
        assert_eq!(gone.title, "B");
        assert!(s.dependencies_of(a).unwrap().is_empty());
    }
}
