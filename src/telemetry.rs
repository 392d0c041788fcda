//! 统计上报 - 把展示时长和用户动作提交给服务端
//!
//! 失败只记日志，不重试，也不会反馈给协调器。

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::TransportError;
use crate::model::Outcome;
use crate::remote::{RemoteClient, RemoteRequest};

/// 一条展示统计
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub user_id: String,
    pub notification_id: String,
    /// t1：定义加载完成到界面可见
    pub before_visible: Duration,
    /// t2：界面可见到用户操作
    pub visible_to_outcome: Duration,
    pub outcome: Outcome,
}

impl TelemetryRecord {
    /// 请求体，时长以毫秒表示
    pub fn to_body(&self) -> Value {
        json!({
            "_id": self.user_id,
            "user_id": self.user_id,
            "notification_id": self.notification_id,
            "delta1": self.before_visible.as_millis() as u64,
            "delta2": self.visible_to_outcome.as_millis() as u64,
            "action": self.outcome.code(),
            "ts": Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
        })
    }
}

/// 统计上报器
#[derive(Clone)]
pub struct TelemetryReporter {
    client: Arc<dyn RemoteClient>,
    mark_url: String,
    project_key: String,
}

impl TelemetryReporter {
    pub fn new(client: Arc<dyn RemoteClient>, mark_url: impl Into<String>, project_key: impl Into<String>) -> Self {
        Self {
            client,
            mark_url: mark_url.into(),
            project_key: project_key.into(),
        }
    }

    /// 提交一条统计并等待结果
    pub async fn submit(&self, record: &TelemetryRecord) -> Result<(), TransportError> {
        let request = RemoteRequest::post(&self.mark_url)
            .project_key(&self.project_key)
            .json(record.to_body());
        self.client.request(request).await?.check()?;
        info!(
            notification_id = %record.notification_id,
            outcome = %record.outcome,
            "Notification statistics uploaded"
        );
        Ok(())
    }

    /// 后台提交，失败只记日志
    pub fn submit_detached(&self, record: TelemetryRecord, runtime: &Handle) -> JoinHandle<()> {
        let reporter = self.clone();
        runtime.spawn(async move {
            if let Err(e) = reporter.submit(&record).await {
                warn!(
                    notification_id = %record.notification_id,
                    error = %e,
                    "Failed to upload notification statistics"
                );
            }
        })
    }
}
