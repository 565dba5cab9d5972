//! 配置文件（Profile）模型与存储
//! 这里只读取，不修改任何 Profile

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileType {
    #[default]
    Url,
    File,
}

/// 内核运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunningMode {
    #[default]
    None,
    Tun,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "type")]
    pub profile_type: ProfileType,
    /// 本地配置路径（File）
    #[serde(default)]
    pub path: Option<String>,
    /// 订阅地址（Url）
    #[serde(default)]
    pub remote_url: Option<String>,
    /// 上次更新时间（毫秒）
    #[serde(default)]
    pub last_updated_at: Option<i64>,
}

impl Profile {
    pub fn new(id: &str, name: &str, profile_type: ProfileType) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            enabled: false,
            profile_type,
            path: None,
            remote_url: None,
            last_updated_at: None,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn with_remote_url(mut self, url: &str) -> Self {
        self.remote_url = Some(url.to_string());
        self
    }

    pub fn with_last_updated_at(mut self, millis: i64) -> Self {
        self.last_updated_at = Some(millis);
        self
    }
}

/// Profile 集合的只读来源
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// 按集合顺序返回所有 Profile
    async fn all_profiles(&self) -> Result<Vec<Profile>>;

    /// 上次使用的 Profile id，没有时为空字符串
    async fn last_used_profile_id(&self) -> Result<String>;
}

/// Profile 清单文件格式
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileList {
    #[serde(default)]
    pub last_used_profile_id: String,
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

/// 内存中的 Profile 集合
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    list: RwLock<ProfileList>,
}

impl MemoryProfileStore {
    pub fn new(profiles: Vec<Profile>, last_used_profile_id: &str) -> Self {
        Self {
            list: RwLock::new(ProfileList {
                last_used_profile_id: last_used_profile_id.to_string(),
                profiles,
            }),
        }
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn all_profiles(&self) -> Result<Vec<Profile>> {
        let list = self
            .list
            .read()
            .map_err(|e| anyhow::anyhow!("读取 Profile 列表失败: {}", e))?;
        Ok(list.profiles.clone())
    }

    async fn last_used_profile_id(&self) -> Result<String> {
        let list = self
            .list
            .read()
            .map_err(|e| anyhow::anyhow!("读取 Profile 列表失败: {}", e))?;
        Ok(list.last_used_profile_id.clone())
    }
}

/// 每次读取都重新加载的 YAML 清单
#[derive(Debug, Clone)]
pub struct FileProfileStore {
    path: PathBuf,
}

impl FileProfileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<ProfileList> {
        let content = fs::read_to_string(&self.path)?;
        let list: ProfileList = serde_yaml::from_str(&content)?;
        Ok(list)
    }

    pub fn save(&self, list: &ProfileList) -> Result<()> {
        let content = serde_yaml::to_string(list)?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for FileProfileStore {
    async fn all_profiles(&self) -> Result<Vec<Profile>> {
        Ok(self.load()?.profiles)
    }

    async fn last_used_profile_id(&self) -> Result<String> {
        Ok(self.load()?.last_used_profile_id)
    }
}
