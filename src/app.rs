//! AppBlast 入口 - 显式构造、依赖注入的客户端
//!
//! ```ignore
//! let probe = Arc::new(ManualVisibility::default());
//! let blast = AppBlast::init(BlastSettings::new("project-key"), probe)?;
//! blast.set_user_id("user-42").await?;
//! blast.register_surface(Some(&surface));
//! // ...
//! blast.shutdown();
//! ```

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::BlastSettings;
use crate::coordinator::{Collaborators, DeliveryCoordinator};
use crate::identity::{DeviceInfo, UserDirectory, UserIdSource, UserStore};
use crate::poller::VisibilityProbe;
use crate::remote::{HttpRemoteClient, RemoteClient};
use crate::surface::{BlastActionListener, PresentationSurface};

/// 应用侧使用的门面对象
pub struct AppBlast {
    settings: BlastSettings,
    coordinator: DeliveryCoordinator,
    directory: UserDirectory,
}

impl AppBlast {
    /// 用默认 HTTP 客户端初始化，并在已有 user id 时立即开始拉取
    pub fn init(settings: BlastSettings, probe: Arc<dyn VisibilityProbe>) -> Result<Self> {
        settings.validate()?;
        let client: Arc<dyn RemoteClient> = Arc::new(HttpRemoteClient::new(settings.timeout_secs)?);
        let blast = Self::with_client(settings, client, probe, DeviceInfo::detect())?;

        info!(
            project_key = %blast.settings.project_key,
            user_id = ?blast.user_id(),
            "AppBlast initialized"
        );
        blast.coordinator.begin_cycle();
        Ok(blast)
    }

    /// 注入所有协作者，不自动开始拉取
    pub fn with_client(
        settings: BlastSettings,
        client: Arc<dyn RemoteClient>,
        probe: Arc<dyn VisibilityProbe>,
        device: DeviceInfo,
    ) -> Result<Self> {
        let store = Arc::new(UserStore::new(&settings.data_dir));
        let coordinator = DeliveryCoordinator::new(
            &settings,
            Collaborators {
                client: Arc::clone(&client),
                probe,
                users: store.clone(),
            },
        )?;
        let directory = UserDirectory::new(client, store, device, &settings);

        Ok(Self {
            settings,
            coordinator,
            directory,
        })
    }

    pub fn settings(&self) -> &BlastSettings {
        &self.settings
    }

    pub fn coordinator(&self) -> &DeliveryCoordinator {
        &self.coordinator
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn BlastActionListener>>) {
        self.coordinator.set_listener(listener);
    }

    pub fn register_surface(&self, surface: Option<&Arc<dyn PresentationSurface>>) {
        self.coordinator.register_surface(surface);
    }

    /// 手动触发一次拉取
    pub fn refresh(&self) -> bool {
        self.coordinator.begin_cycle()
    }

    pub fn user_id(&self) -> Option<String> {
        self.directory.store().user_id()
    }

    /// 注册 user id；成功后丢弃旧用户尚未展示的数据并开始新的拉取周期
    pub async fn set_user_id(&self, user_id: &str) -> Result<bool> {
        if !self.directory.set_user_id(user_id).await? {
            return Ok(false);
        }
        self.coordinator.restart_cycle();
        Ok(true)
    }

    /// 与本地已保存的 id 相同（或为空）时什么都不做并返回 `false`
    pub async fn set_user_id_if_not_set(&self, user_id: &str) -> Result<bool> {
        if user_id.is_empty() || self.user_id().as_deref() == Some(user_id) {
            debug!(user_id = %user_id, "User id unchanged");
            return Ok(false);
        }
        self.set_user_id(user_id).await
    }

    pub async fn remove_user_id(&self) -> Result<()> {
        self.directory.remove_user_id().await
    }

    pub async fn set_user_properties(&self, properties: &BTreeMap<String, String>) -> Result<bool> {
        self.directory.set_user_properties(properties).await
    }

    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }
}

impl Drop for AppBlast {
    fn drop(&mut self) {
        self.coordinator.shutdown();
    }
}
