//! 用户身份 - 本地持久化的 user id 以及 set/unset 网络调用
//!
//! 存储位置：`<data_dir>/user.json`

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::System;
use tracing::{debug, info};

use crate::config::BlastSettings;
use crate::remote::{RemoteClient, RemoteRequest};

/// 协调器读取当前用户 ID 的入口
pub trait UserIdSource: Send + Sync {
    fn user_id(&self) -> Option<String>;
}

/// 持久化记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub user_id: String,
    pub updated_at: DateTime<Utc>,
}

/// 基于文件的 user id 存储（带文件锁）
#[derive(Debug, Clone)]
pub struct UserStore {
    path: PathBuf,
}

impl UserStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("user.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取记录；文件不存在或内容损坏都视为未设置
    pub fn load(&self) -> Result<Option<UserRecord>> {
        use fs2::FileExt;

        if !self.path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&self.path)?;
        file.lock_shared()?;
        let mut content = String::new();
        let read = file.read_to_string(&mut content);
        file.unlock()?;
        read?;

        match serde_json::from_str::<UserRecord>(&content) {
            Ok(record) if !record.user_id.is_empty() => Ok(Some(record)),
            Ok(_) => Ok(None),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Ignoring unreadable user record");
                Ok(None)
            }
        }
    }

    pub fn save(&self, user_id: &str) -> Result<()> {
        use fs2::FileExt;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let record = UserRecord {
            user_id: user_id.to_string(),
            updated_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&record)?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let written = file
            .set_len(0)
            .and_then(|_| file.write_all(content.as_bytes()));
        file.unlock()?;
        written?;

        debug!(user_id = %user_id, "User id persisted");
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

impl UserIdSource for UserStore {
    fn user_id(&self) -> Option<String> {
        self.load().ok().flatten().map(|r| r.user_id)
    }
}

/// 随 set-user 上报的设备信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub os_version: String,
    pub device_model: String,
    pub platform: String,
}

impl DeviceInfo {
    /// 从当前系统探测
    pub fn detect() -> Self {
        let unknown = || "unknown".to_string();
        Self {
            device_id: System::host_name().unwrap_or_else(unknown),
            os_version: System::long_os_version().unwrap_or_else(unknown),
            device_model: System::name().unwrap_or_else(unknown),
            platform: std::env::consts::OS.to_uppercase(),
        }
    }
}

/// 用户相关的服务端调用
pub struct UserDirectory {
    client: Arc<dyn RemoteClient>,
    store: Arc<UserStore>,
    device: DeviceInfo,
    project_key: String,
    set_url: String,
    unset_url: String,
}

impl UserDirectory {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        store: Arc<UserStore>,
        device: DeviceInfo,
        settings: &BlastSettings,
    ) -> Self {
        Self {
            client,
            store,
            device,
            project_key: settings.project_key.clone(),
            set_url: settings.user_set_url(),
            unset_url: settings.user_unset_url(),
        }
    }

    pub fn store(&self) -> &Arc<UserStore> {
        &self.store
    }

    /// 向服务端注册 user id，成功后写入本地。空 id 返回 `Ok(false)`
    pub async fn set_user_id(&self, user_id: &str) -> Result<bool> {
        if user_id.is_empty() {
            return Ok(false);
        }

        let body = json!({
            "_id": user_id,
            "user_id": user_id,
            "_device": self.device,
        });
        let request = RemoteRequest::post(&self.set_url)
            .project_key(&self.project_key)
            .json(body);
        self.client.request(request).await?.check()?;

        self.store.save(user_id)?;
        info!(user_id = %user_id, "User id set");
        Ok(true)
    }

    /// 上报用户属性；空属性或没有 user id 时不发请求
    pub async fn set_user_properties(&self, properties: &BTreeMap<String, String>) -> Result<bool> {
        if properties.is_empty() {
            return Ok(false);
        }
        let Some(user_id) = self.store.user_id() else {
            debug!("No user id stored, skipping user properties");
            return Ok(false);
        };

        let mut body = Map::new();
        body.insert("_id".to_string(), Value::String(user_id.clone()));
        body.insert("user_id".to_string(), Value::String(user_id));
        for (key, value) in properties {
            body.insert(key.clone(), Value::String(value.clone()));
        }

        let request = RemoteRequest::post(&self.set_url)
            .project_key(&self.project_key)
            .json(Value::Object(body));
        self.client.request(request).await?.check()?;
        info!(count = properties.len(), "User properties set");
        Ok(true)
    }

    /// 解除设备与用户的关联，成功后清除本地 id
    pub async fn remove_user_id(&self) -> Result<()> {
        let request = RemoteRequest::post(&self.unset_url).project_key(&self.project_key);
        self.client.request(request).await?.check()?;
        self.store.clear()?;
        info!("User id deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = UserStore::new(dir.path());
        assert_eq!(store.user_id(), None);

        store.save("user-1").unwrap();
        assert_eq!(store.user_id(), Some("user-1".to_string()));

        // 覆盖写入时不能残留旧内容
        store.save("u2").unwrap();
        let record = store.load().unwrap().unwrap();
        assert_eq!(record.user_id, "u2");

        store.clear().unwrap();
        assert_eq!(store.user_id(), None);
        store.clear().unwrap();
    }

    #[test]
    fn test_store_ignores_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let store = UserStore::new(dir.path());
        fs::write(store.path(), "not json").unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_store_creates_parent_dir() {
        let dir = TempDir::new().unwrap();
        let store = UserStore::new(&dir.path().join("nested").join("deeper"));
        store.save("abc").unwrap();
        assert_eq!(store.user_id(), Some("abc".to_string()));
    }

    #[test]
    fn test_device_info_detect() {
        let device = DeviceInfo::detect();
        assert!(!device.platform.is_empty());
        // 服务端按大写平台名识别，如 `LINUX`、`ANDROID`
        assert_eq!(device.platform, std::env::consts::OS.to_uppercase());
        assert!(!device.device_id.is_empty());
    }
}
