use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::broadcast;

/// 变更流事件类型，删除事件不在处理范围内
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeEventType {
    Insert,
    Modify,
    Remove,
}

/// 权威存储发出的一条变更，image 为变更后的完整记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub event_type: ChangeEventType,
    /// 来源表名
    pub source: String,
    pub image: serde_json::Value,
}

impl ChangeEvent {
    pub fn new<T: Serialize>(
        event_type: ChangeEventType,
        source: &str,
        record: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_type,
            source: source.to_string(),
            image: serde_json::to_value(record)?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// 消费速度跟不上，跳过了 n 条事件
    #[error("change feed lagged, {0} events skipped")]
    Lagged(u64),
    #[error("malformed change event: {reason}")]
    Malformed { payload: String, reason: String },
    #[error("change feed unavailable: {0}")]
    Unavailable(String),
}

/// 按投递顺序产出变更事件，至少一次投递。返回 None 表示流已关闭
#[async_trait]
pub trait ChangeFeed: Send {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, FeedError>;
}

/// 基于 Postgres LISTEN/NOTIFY 的变更流，事件由表触发器通过 pg_notify 发出
pub struct PgChangeFeed {
    listener: PgListener,
}

impl PgChangeFeed {
    pub async fn connect(pool: &PgPool, channel: &str) -> Result<Self, sqlx::Error> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(channel).await?;
        tracing::info!("Listening for fleet changes on channel {}", channel);
        Ok(Self { listener })
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, FeedError> {
        let notification = self
            .listener
            .recv()
            .await
            .map_err(|e| FeedError::Unavailable(e.to_string()))?;

        serde_json::from_str(notification.payload())
            .map(Some)
            .map_err(|e| FeedError::Malformed {
                payload: notification.payload().to_string(),
                reason: e.to_string(),
            })
    }
}

/// 进程内变更流，订阅 MemoryFleetStore 的广播
pub struct BroadcastChangeFeed {
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl BroadcastChangeFeed {
    pub fn new(receiver: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl ChangeFeed for BroadcastChangeFeed {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, FeedError> {
        match self.receiver.recv().await {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(FeedError::Lagged(skipped)),
            Err(broadcast::error::RecvError::Closed) => Ok(None),
        }
    }
}
