//! 配置拉取器 - 拉取通知定义并并发下载媒体
//!
//! 一次 `fetch` 只产生一个事件：
//! - 定义拉取失败（传输错误、非 200、无法解析、`err` 非空）→ [`FetchEvent::ErrorWhileLoading`]，不会发起任何媒体请求
//! - 成功 → 三个槽位全部落定（成功或缺失）后 → [`FetchEvent::DataReady`]
//!
//! 单个图片失败只会让对应槽位为空，不影响整体。拉取器本身不重试。

use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::model::{LoadedBlast, MediaAsset, MediaBundle, MediaSlot, NotificationDefinition};
use crate::remote::{RemoteClient, RemoteRequest};

/// 拉取结果事件
#[derive(Debug, Clone)]
pub enum FetchEvent {
    /// 定义和所有槽位都已落定
    DataReady(LoadedBlast),
    /// 定义拉取失败，本周期终止
    ErrorWhileLoading,
}

impl FetchEvent {
    pub fn is_ready(&self) -> bool {
        matches!(self, FetchEvent::DataReady(_))
    }
}

/// 配置拉取器
#[derive(Clone)]
pub struct ConfigFetcher {
    client: Arc<dyn RemoteClient>,
    api_base: String,
}

impl ConfigFetcher {
    pub fn new(client: Arc<dyn RemoteClient>, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// 拉取 `user_id` 在 `project_key` 下的通知定义及其媒体
    pub async fn fetch(&self, user_id: &str, project_key: &str) -> FetchEvent {
        let definition = match self.fetch_definition(user_id, project_key).await {
            Ok(definition) => definition,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Notification definition load failed, skipping this cycle");
                return FetchEvent::ErrorWhileLoading;
            }
        };
        let loaded_at = Instant::now();

        info!(
            user_id = %user_id,
            notification_id = %definition.id,
            "Notification definition loaded, fetching media"
        );
        let media = self.fetch_media(&definition).await;
        debug!(
            notification_id = %definition.id,
            present = media.present_count(),
            "All media slots settled"
        );

        FetchEvent::DataReady(LoadedBlast {
            definition,
            media,
            loaded_at,
        })
    }

    /// 只拉取定义
    pub async fn fetch_definition(
        &self,
        user_id: &str,
        project_key: &str,
    ) -> Result<NotificationDefinition, TransportError> {
        let target = format!(
            "{}/notification/get/{}/{}",
            self.api_base, project_key, user_id
        );
        debug!(target = %target, "Requesting notification definition");

        let payload = self
            .client
            .request(RemoteRequest::get(&target))
            .await?
            .check()?;
        NotificationDefinition::from_payload(&payload, &target)
    }

    /// 并发下载三个槽位，全部落定后返回；完成顺序任意
    pub async fn fetch_media(&self, definition: &NotificationDefinition) -> MediaBundle {
        let mut bundle = MediaBundle::new();
        let mut settled = 0usize;
        let mut downloads: JoinSet<(MediaSlot, Result<MediaAsset, TransportError>)> =
            JoinSet::new();

        for slot in MediaSlot::ALL {
            match definition.media_url(slot) {
                Some(url) => {
                    let client = Arc::clone(&self.client);
                    let url = url.to_string();
                    debug!(slot = %slot, url = %url, "Start loading media");
                    downloads.spawn(async move {
                        let result = client.download(&url).await;
                        (slot, result)
                    });
                }
                None => {
                    // 没有 URL：立即落定，不发请求
                    settled += 1;
                }
            }
        }

        while let Some(joined) = downloads.join_next().await {
            settled += 1;
            match joined {
                Ok((slot, Ok(asset))) => {
                    debug!(slot = %slot, bytes = asset.bytes.len(), "Media loaded");
                    bundle.set(slot, Some(asset));
                }
                Ok((slot, Err(e))) => {
                    warn!(slot = %slot, error = %e, "Media load failed, slot left empty");
                }
                Err(e) => {
                    warn!(error = %e, "Media task did not complete, slot left empty");
                }
            }
        }

        debug_assert_eq!(settled, MediaSlot::ALL.len());
        bundle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ParsedPayload;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// 记录请求的 mock 客户端
    struct MockClient {
        payload: Result<serde_json::Value, u16>,
        failing_downloads: Vec<String>,
        requests: Mutex<Vec<String>>,
        downloads: Mutex<Vec<String>>,
    }

    impl MockClient {
        fn new(payload: Result<serde_json::Value, u16>) -> Self {
            Self {
                payload,
                failing_downloads: Vec::new(),
                requests: Mutex::new(Vec::new()),
                downloads: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteClient for MockClient {
        async fn request(&self, request: RemoteRequest) -> Result<ParsedPayload, TransportError> {
            self.requests.lock().unwrap().push(request.target.clone());
            match &self.payload {
                Ok(v) => Ok(ParsedPayload::new(v.clone())),
                Err(status) => Err(TransportError::Status {
                    target: request.target,
                    status: *status,
                }),
            }
        }

        async fn download(&self, target: &str) -> Result<MediaAsset, TransportError> {
            self.downloads.lock().unwrap().push(target.to_string());
            if self.failing_downloads.iter().any(|u| u == target) {
                return Err(TransportError::Status {
                    target: target.to_string(),
                    status: 404,
                });
            }
            Ok(MediaAsset {
                source_url: target.to_string(),
                content_type: Some("image/png".to_string()),
                bytes: target.as_bytes().to_vec(),
            })
        }
    }

    fn payload(close: Option<&str>, overlay: Option<&str>, image: Option<&str>) -> serde_json::Value {
        json!({
            "notification": {
                "_id": "n-1",
                "variation": {
                    "title": "t",
                    "close_image_url": close,
                    "gradient_overlay_url": overlay,
                    "image_url": image
                }
            }
        })
    }

    #[tokio::test]
    async fn test_fetch_builds_target_url() {
        let client = Arc::new(MockClient::new(Ok(payload(None, None, None))));
        let fetcher = ConfigFetcher::new(client.clone(), "http://api/v1/");

        let event = fetcher.fetch("user-7", "proj").await;
        assert!(event.is_ready());
        assert_eq!(
            *client.requests.lock().unwrap(),
            vec!["http://api/v1/notification/get/proj/user-7".to_string()]
        );
    }

    #[tokio::test]
    async fn test_all_slots_absent_still_ready() {
        let client = Arc::new(MockClient::new(Ok(payload(None, None, None))));
        let fetcher = ConfigFetcher::new(client.clone(), "http://api");

        match fetcher.fetch("u", "p").await {
            FetchEvent::DataReady(blast) => {
                assert!(blast.media.is_empty());
                assert_eq!(blast.definition.id, "n-1");
            }
            FetchEvent::ErrorWhileLoading => panic!("expected data ready"),
        }
        assert!(client.downloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_media_slot_degrades() {
        let mut client = MockClient::new(Ok(payload(
            Some("http://cdn/close.png"),
            Some("http://cdn/overlay.png"),
            Some("http://cdn/bg.png"),
        )));
        client.failing_downloads.push("http://cdn/overlay.png".to_string());
        let client = Arc::new(client);
        let fetcher = ConfigFetcher::new(client.clone(), "http://api");

        match fetcher.fetch("u", "p").await {
            FetchEvent::DataReady(blast) => {
                assert_eq!(blast.media.present_count(), 2);
                assert!(blast.media.get(MediaSlot::Overlay).is_none());
                assert_eq!(
                    blast.media.get(MediaSlot::Background).unwrap().source_url,
                    "http://cdn/bg.png"
                );
            }
            FetchEvent::ErrorWhileLoading => panic!("expected data ready"),
        }
        assert_eq!(client.downloads.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_error_field_skips_media() {
        let mut body = payload(Some("http://cdn/close.png"), None, None);
        body["err"] = json!("no active notification");
        let client = Arc::new(MockClient::new(Ok(body)));
        let fetcher = ConfigFetcher::new(client.clone(), "http://api");

        let event = fetcher.fetch("u", "p").await;
        assert!(matches!(event, FetchEvent::ErrorWhileLoading));
        assert!(client.downloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let client = Arc::new(MockClient::new(Err(500)));
        let fetcher = ConfigFetcher::new(client.clone(), "http://api");

        assert!(!fetcher.fetch("u", "p").await.is_ready());
        assert!(client.downloads.lock().unwrap().is_empty());
    }
}
