//! 检查点存储
//!
//! 按 session_id 保存上一轮的 ConversationTurnState 快照：轮开始时读取、轮结束时写入。
//! 读不到快照是合法的"新会话"状态，不是错误。
//! 内存实现用于测试与单进程部署；SQLite 实现（`async-sqlite` 特性）把快照序列化为 JSON 持久化。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::ConversationTurnState;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("checkpoint backend error: {0}")]
    Backend(String),
}

/// 检查点存储：`get(sessionId) -> Option<TurnState>`，`put(sessionId, TurnState)`
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<ConversationTurnState>, CheckpointError>;

    async fn put(&self, session_id: &str, state: &ConversationTurnState) -> Result<(), CheckpointError>;
}

/// 内存检查点
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    states: RwLock<HashMap<String, ConversationTurnState>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, session_id: &str) -> Result<Option<ConversationTurnState>, CheckpointError> {
        Ok(self.states.read().await.get(session_id).cloned())
    }

    async fn put(&self, session_id: &str, state: &ConversationTurnState) -> Result<(), CheckpointError> {
        self.states
            .write()
            .await
            .insert(session_id.to_string(), state.clone());
        Ok(())
    }
}

#[cfg(feature = "async-sqlite")]
mod sqlite {
    use std::path::Path;

    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
    use sqlx::Row;

    use super::*;

    /// SQLite 检查点：一张 turn_checkpoints 表，session_id 为主键，state 为 JSON
    pub struct SqliteCheckpointStore {
        pool: SqlitePool,
    }

    impl From<sqlx::Error> for CheckpointError {
        fn from(e: sqlx::Error) -> Self {
            CheckpointError::Backend(e.to_string())
        }
    }

    impl SqliteCheckpointStore {
        pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
            let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&db_url)
                .await?;
            let store = Self { pool };
            store.init_tables().await?;
            Ok(store)
        }

        async fn init_tables(&self) -> Result<(), CheckpointError> {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS turn_checkpoints (
                    session_id TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
            )
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl CheckpointStore for SqliteCheckpointStore {
        async fn get(&self, session_id: &str) -> Result<Option<ConversationTurnState>, CheckpointError> {
            let row = sqlx::query("SELECT state FROM turn_checkpoints WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;
            match row {
                Some(row) => {
                    let json: String = row.get("state");
                    Ok(Some(serde_json::from_str(&json)?))
                }
                None => Ok(None),
            }
        }

        async fn put(&self, session_id: &str, state: &ConversationTurnState) -> Result<(), CheckpointError> {
            let json = serde_json::to_string(state)?;
            sqlx::query(
                "INSERT INTO turn_checkpoints (session_id, state, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(session_id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
            )
            .bind(session_id)
            .bind(json)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }
}

#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteCheckpointStore;

/// 创建检查点存储
///
/// 提供了 db_path 且启用了 async-sqlite 特性时使用 SQLite，否则使用内存存储
pub async fn create_checkpoint_store(db_path: Option<&std::path::Path>) -> Arc<dyn CheckpointStore> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = db_path {
        match SqliteCheckpointStore::new(path).await {
            Ok(store) => {
                tracing::info!(path = %path.display(), "using SQLite checkpoint store");
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to open SQLite checkpoint store, falling back to memory");
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if db_path.is_some() {
        tracing::warn!("checkpoint_db is set but the async-sqlite feature is not enabled, using memory store");
    }

    tracing::info!("using in-memory checkpoint store");
    Arc::new(InMemoryCheckpointStore::new())
}
