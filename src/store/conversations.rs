//! 会话存储：会话元数据与只追加消息日志
//!
//! 每条消息带会话内单调递增的 seq（追加事务内分配），按 seq 重放得到的
//! 上下文与模型当时看到的完全一致。消息一经持久化不可变；会话仅由
//! 用户显式删除（级联删除其消息）。

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// 消息角色（与持久化列一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::ToolResult => "tool_result",
        }
    }

    fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool_result" => Some(Role::ToolResult),
            _ => None,
        }
    }
}

/// 工具调用失败类别：校验失败 / 业务失败 / 超时，均可由模型读到后自行纠正
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Validation,
    Domain,
    Timeout,
}

/// 工具调用失败详情（折叠进 ToolRecord）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolFault {
    pub kind: ToolErrorKind,
    pub message: String,
}

/// 工具调用记录：tool-result 消息的结构化正文
///
/// raw_args 为模型原样提出的参数，resolved_args 为注入属主身份并通过
/// 校验后的参数；result 与 error 二选一。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolRecord {
    pub tool: String,
    pub raw_args: serde_json::Value,
    pub resolved_args: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFault>,
}

impl ToolRecord {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// 消息正文：自由文本（user/assistant）或工具记录（tool_result）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text { text: String },
    Tool { record: ToolRecord },
}

impl MessageBody {
    pub fn text(s: impl Into<String>) -> Self {
        MessageBody::Text { text: s.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageBody::Text { text } => Some(text),
            MessageBody::Tool { .. } => None,
        }
    }
}

/// 单条持久化消息
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: String,
    pub seq: i64,
    pub role: Role,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
}

/// 会话元数据：恰好一个属主，创建后不可变
#[derive(Clone, Debug, Serialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 会话存储：Mutex<Connection> 串行化所有写入，追加事务内分配 seq
pub struct ConversationStore {
    conn: Mutex<Connection>,
}

impl ConversationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, AgentError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AgentError> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS conversations (
                 id         TEXT PRIMARY KEY,
                 user_id    TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS messages (
                 id              INTEGER PRIMARY KEY AUTOINCREMENT,
                 conversation_id TEXT NOT NULL
                     REFERENCES conversations(id) ON DELETE CASCADE,
                 seq        INTEGER NOT NULL,
                 role       TEXT NOT NULL,
                 body       TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 UNIQUE (conversation_id, seq)
             );
             CREATE INDEX IF NOT EXISTS idx_messages_conversation
                 ON messages (conversation_id, seq);",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_conversation(&self, user_id: &str) -> Result<Conversation, AgentError> {
        let now = Utc::now();
        let conv = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.lock_conn().execute(
            "INSERT INTO conversations (id, user_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![conv.id, conv.user_id, conv.created_at.to_rfc3339(), conv.updated_at.to_rfc3339()],
        )?;
        Ok(conv)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AgentError> {
        let conn = self.lock_conn();
        let row = conn
            .query_row(
                "SELECT id, user_id, created_at, updated_at FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(id, user_id, created, updated)| Conversation {
            id,
            user_id,
            created_at: parse_ts(&created),
            updated_at: parse_ts(&updated),
        }))
    }

    /// 用户的全部会话，最近更新在前
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, AgentError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, created_at, updated_at FROM conversations
             WHERE user_id = ?1 ORDER BY updated_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, user_id, created, updated) = row?;
            out.push(Conversation {
                id,
                user_id,
                created_at: parse_ts(&created),
                updated_at: parse_ts(&updated),
            });
        }
        Ok(out)
    }

    /// 删除会话，消息级联删除
    pub fn delete_conversation(&self, id: &str) -> Result<(), AgentError> {
        self.lock_conn()
            .execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// 追加一条消息：事务内取 MAX(seq)+1，保证会话内单调有序
    pub fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        body: MessageBody,
    ) -> Result<Message, AgentError> {
        let body_json = serde_json::to_string(&body)
            .map_err(|e| AgentError::Storage(e.to_string()))?;
        let now = Utc::now();

        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO messages (conversation_id, seq, role, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![conversation_id, seq, role.as_str(), body_json, now.to_rfc3339()],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), conversation_id],
        )?;
        tx.commit()?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            seq,
            role,
            body,
            created_at: now,
        })
    }

    /// 按 seq 升序加载消息；window 限定为最近 N 条（最旧的先被截断）
    pub fn load_messages(
        &self,
        conversation_id: &str,
        window: Option<usize>,
    ) -> Result<Vec<Message>, AgentError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, seq, role, body, created_at FROM messages
             WHERE conversation_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, seq, role, body, created) = row?;
            let role = Role::parse(&role)
                .ok_or_else(|| AgentError::Storage(format!("unknown role: {role}")))?;
            let body: MessageBody = serde_json::from_str(&body)
                .map_err(|e| AgentError::Storage(format!("corrupt message body: {e}")))?;
            out.push(Message {
                id,
                conversation_id: conversation_id.to_string(),
                seq,
                role,
                body,
                created_at: parse_ts(&created),
            });
        }
        if let Some(n) = window {
            if out.len() > n {
                out.drain(..out.len() - n);
            }
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

    fn store() -> ConversationStore {
        ConversationStore::open_in_memory().unwrap()
    }

    #[test]
    fn seq_is_monotonic_per_conversation() {
        let s = store();
        let a = s.create_conversation("u1").unwrap();
        let b = s.create_conversation("u1").unwrap();
        for i in 0..3 {
            s.append_message(&a.id, Role::User, MessageBody::text(format!("m{i}"))).unwrap();
        }
        s.append_message(&b.id, Role::User, MessageBody::text("other")).unwrap();

        let msgs = s.load_messages(&a.id, None).unwrap();
        let seqs: Vec<i64> = msgs.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(s.load_messages(&b.id, None).unwrap()[0].seq, 1);
    }

    #[test]
    fn window_truncates_oldest_first() {
        let s = store();
        let c = s.create_conversation("u1").unwrap();
        for i in 0..5 {
            s.append_message(&c.id, Role::User, MessageBody::text(format!("m{i}"))).unwrap();
        }
        let msgs = s.load_messages(&c.id, Some(2)).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].body.as_text(), Some("m3"));
        assert_eq!(msgs[1].body.as_text(), Some("m4"));
    }

    #[test]
    fn tool_record_roundtrips_through_storage() {
        let s = store();
        let c = s.create_conversation("u1").unwrap();
        let record = ToolRecord {
            tool: "add_task".into(),
            raw_args: serde_json::json!({"title": "Buy milk", "user_id": "mallory"}),
            resolved_args: serde_json::json!({"title": "Buy milk"}),
            result: Some(serde_json::json!({"task_id": 1, "status": "created"})),
            error: None,
        };
        s.append_message(&c.id, Role::ToolResult, MessageBody::Tool { record: record.clone() })
            .unwrap();

        let msgs = s.load_messages(&c.id, None).unwrap();
        match &msgs[0].body {
            MessageBody::Tool { record: got } => assert_eq!(got, &record),
            other => panic!("expected tool body, got {other:?}"),
        }
    }

    #[test]
    fn delete_cascades_to_messages() {
        let s = store();
        let c = s.create_conversation("u1").unwrap();
        s.append_message(&c.id, Role::User, MessageBody::text("hello")).unwrap();
        s.delete_conversation(&c.id).unwrap();
        assert!(s.get_conversation(&c.id).unwrap().is_none());
        assert!(s.load_messages(&c.id, None).unwrap().is_empty());
    }

    #[test]
    fn conversations_list_newest_first() {
        let s = store();
        let a = s.create_conversation("u1").unwrap();
        let b = s.create_conversation("u1").unwrap();
        s.create_conversation("u2").unwrap();
        // 向 a 追加消息会刷新 updated_at，使其排到最前
        std::thread::sleep(std::time::Duration::from_millis(5));
        s.append_message(&a.id, Role::User, MessageBody::text("ping")).unwrap();

        let list = s.list_conversations("u1").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, a.id);
        assert_eq!(list[1].id, b.id);
    }
}
