//! Clash 代理管理器
//! 读取 Clash YAML 配置，维护代理节点与代理组，并作为探测与加载能力的具体实现

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, RwLock};

use super::cache::DelayCache;
use super::health_check::ProxyHealthChecker;
use super::types::{ProxyGroupInfo, ProxyNodeInfo};
use crate::loader::ProfileEngine;
use crate::profile::{Profile, ProfileType, RunningMode};
use crate::testing::GroupProber;

/// 配置中未定义代理组时使用的默认组
pub const GLOBAL_GROUP: &str = "GLOBAL";

/// 代理组定义
#[derive(Debug, Clone, PartialEq)]
struct GroupConfig {
    name: String,
    group_type: String,
    members: Vec<String>,
}

/// 已加载到内核的配置
#[derive(Debug, Clone, Default)]
struct LoadedConfig {
    profile_name: String,
    proxies: Vec<ProxyNodeInfo>,
    groups: Vec<GroupConfig>,
}

impl LoadedConfig {
    fn find_proxy(&self, name: &str) -> Option<&ProxyNodeInfo> {
        self.proxies.iter().find(|p| p.name == name)
    }

    fn find_group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.name == name)
    }
}

fn yaml_str<'a>(value: &'a serde_yaml::Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

/// Clash 代理管理器
pub struct ClashProxyManager {
    checker: ProxyHealthChecker,
    delay_cache: Arc<DelayCache>,
    http: reqwest::Client,
    running_mode: RwLock<RunningMode>,
    loaded: RwLock<LoadedConfig>,
    groups: RwLock<Vec<ProxyGroupInfo>>,
}

impl ClashProxyManager {
    pub fn new(checker: ProxyHealthChecker, delay_cache: Arc<DelayCache>) -> Self {
        Self {
            checker,
            delay_cache,
            http: reqwest::Client::new(),
            running_mode: RwLock::new(RunningMode::None),
            loaded: RwLock::new(LoadedConfig::default()),
            groups: RwLock::new(Vec::new()),
        }
    }

    pub fn delay_cache(&self) -> &Arc<DelayCache> {
        &self.delay_cache
    }

    pub fn set_running_mode(&self, mode: RunningMode) {
        if let Ok(mut current) = self.running_mode.write() {
            *current = mode;
        }
    }

    /// 当前配置的所有代理组名
    pub fn group_names(&self) -> Vec<String> {
        self.loaded
            .read()
            .map(|loaded| loaded.groups.iter().map(|g| g.name.clone()).collect())
            .unwrap_or_default()
    }

    /// 最近一次刷新得到的代理组视图
    pub fn proxy_groups(&self) -> Vec<ProxyGroupInfo> {
        self.groups.read().map(|g| g.clone()).unwrap_or_default()
    }

    /// 从 YAML 文本解析代理节点与代理组
    fn parse_config(profile_name: &str, content: &str) -> Result<LoadedConfig> {
        let yaml: serde_yaml::Value = serde_yaml::from_str(content)?;

        let proxies = Self::extract_proxies_from_yaml(&yaml)?;
        let mut groups = Self::extract_groups_from_yaml(&yaml);

        if groups.is_empty() {
            groups.push(GroupConfig {
                name: GLOBAL_GROUP.to_string(),
                group_type: "select".to_string(),
                members: proxies.iter().map(|p| p.name.clone()).collect(),
            });
        }

        Ok(LoadedConfig {
            profile_name: profile_name.to_string(),
            proxies,
            groups,
        })
    }

    /// 从 YAML 配置中提取代理节点信息
    fn extract_proxies_from_yaml(yaml: &serde_yaml::Value) -> Result<Vec<ProxyNodeInfo>> {
        let mut proxies = Vec::new();

        if let Some(serde_yaml::Value::Sequence(proxy_list)) = yaml.get("proxies") {
            for proxy in proxy_list {
                let str_field = |key: &str| yaml_str(proxy, key);

                let Some(name) = str_field("name") else {
                    continue;
                };
                let server = str_field("server").unwrap_or_default().to_string();
                let raw_port = proxy.get("port").and_then(|v| v.as_u64()).unwrap_or(0);
                let Ok(port) = u16::try_from(raw_port) else {
                    warn!("节点 {} 端口无效: {}，已跳过", name, raw_port);
                    continue;
                };
                let proto = str_field("type").unwrap_or("unknown").to_string();
                let support_udp = proxy.get("udp").and_then(|v| v.as_bool()).unwrap_or(false);

                let mut node = ProxyNodeInfo::new(name.to_string(), proto, server, port)
                    .with_udp_support(support_udp);

                // 认证信息
                let mut extra = serde_json::Map::new();
                for key in ["username", "password", "cipher"] {
                    if let Some(value) = str_field(key) {
                        extra.insert(key.to_string(), serde_json::Value::String(value.to_string()));
                    }
                }
                if !extra.is_empty() {
                    node = node.with_extra_info(serde_json::Value::Object(extra));
                }

                proxies.push(node);
            }
        }

        if proxies.is_empty() {
            return Err(anyhow!("配置文件中未找到任何代理节点"));
        }

        Ok(proxies)
    }

    fn extract_groups_from_yaml(yaml: &serde_yaml::Value) -> Vec<GroupConfig> {
        let Some(serde_yaml::Value::Sequence(group_list)) = yaml.get("proxy-groups") else {
            return Vec::new();
        };

        group_list
            .iter()
            .filter_map(|group| {
                let name = group.get("name")?.as_str()?.to_string();
                let group_type = group
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("select")
                    .to_string();
                let members = match group.get("proxies") {
                    Some(serde_yaml::Value::Sequence(list)) => list
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect(),
                    _ => Vec::new(),
                };
                Some(GroupConfig {
                    name,
                    group_type,
                    members,
                })
            })
            .collect()
    }

    /// 展开代理组内的所有节点（含嵌套代理组），按出现顺序去重
    fn resolve_nodes(&self, group_name: &str) -> Result<Vec<ProxyNodeInfo>> {
        let loaded = self
            .loaded
            .read()
            .map_err(|e| anyhow!("读取配置失败: {}", e))?;

        let root = loaded
            .find_group(group_name)
            .ok_or_else(|| anyhow!("代理组不存在: {}", group_name))?;

        let mut nodes = Vec::new();
        let mut seen_nodes = HashSet::new();
        let mut visited_groups = HashSet::from([root.name.as_str()]);
        let mut pending: Vec<&str> = root.members.iter().rev().map(String::as_str).collect();

        while let Some(member) = pending.pop() {
            if let Some(node) = loaded.find_proxy(member) {
                if seen_nodes.insert(member) {
                    nodes.push(node.clone());
                }
            } else if let Some(group) = loaded.find_group(member) {
                if visited_groups.insert(member) {
                    pending.extend(group.members.iter().rev().map(String::as_str));
                }
            }
            // DIRECT / REJECT 等内置出站不参与测试
        }

        Ok(nodes)
    }

    async fn read_profile_content(&self, profile: &Profile, force_download: bool) -> Result<String> {
        match profile.profile_type {
            ProfileType::File => {
                let path = profile
                    .path
                    .as_deref()
                    .ok_or_else(|| anyhow!("本地配置缺少路径: {}", profile.name))?;
                Ok(tokio::fs::read_to_string(path).await?)
            }
            ProfileType::Url => {
                if let Some(path) = profile.path.as_deref() {
                    if !force_download && Path::new(path).exists() {
                        debug!("使用已缓存的订阅: {}", path);
                        return Ok(tokio::fs::read_to_string(path).await?);
                    }
                }

                let url = profile
                    .remote_url
                    .as_deref()
                    .ok_or_else(|| anyhow!("订阅缺少地址: {}", profile.name))?;
                info!("下载订阅: {}", url);
                let content = self
                    .http
                    .get(url)
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?;

                if let Some(path) = profile.path.as_deref() {
                    tokio::fs::write(path, &content).await?;
                }
                Ok(content)
            }
        }
    }
}

#[async_trait]
impl GroupProber for ClashProxyManager {
    /// 测试代理组内所有节点，并把有效延迟写入延迟缓存
    async fn probe(&self, group_name: &str) -> Result<()> {
        let nodes = self.resolve_nodes(group_name)?;
        if nodes.is_empty() {
            return Err(anyhow!("代理组 {} 没有可测试的节点", group_name));
        }

        debug!(
            "测试代理组 {}: {} 个节点, 超时 {}ms",
            group_name,
            nodes.len(),
            self.checker.get_timeout_ms()
        );
        let results = self.checker.check_proxies_health(&nodes).await;
        self.delay_cache.update_batch(
            results.iter().map(|(name, delay)| (name.as_str(), *delay)),
            self.checker.get_test_url(),
        );

        let alive = results.iter().filter(|(_, delay)| *delay > 0).count();
        debug!("代理组 {}: {}/{} 个节点可用", group_name, alive, results.len());

        if alive == 0 {
            return Err(anyhow!("代理组 {} 所有节点均不可用", group_name));
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileEngine for ClashProxyManager {
    fn running_mode(&self) -> RunningMode {
        self.running_mode
            .read()
            .map(|mode| *mode)
            .unwrap_or_default()
    }

    async fn load_profile(
        &self,
        profile: &Profile,
        force_download: bool,
        will_use_tun_mode: bool,
        quick_start: bool,
    ) -> Result<String> {
        let content = self.read_profile_content(profile, force_download).await?;
        let config = Self::parse_config(&profile.name, &content)?;

        let message = format!(
            "已加载配置 {}: {} 个节点, {} 个代理组",
            config.profile_name,
            config.proxies.len(),
            config.groups.len()
        );
        debug!("tun={}, quick_start={}", will_use_tun_mode, quick_start);

        *self
            .loaded
            .write()
            .map_err(|e| anyhow!("写入配置失败: {}", e))? = config;

        info!("{}", message);
        Ok(message)
    }

    async fn refresh_groups(&self, skip_cache_clear: bool) -> Result<()> {
        if !skip_cache_clear {
            self.delay_cache.sweep_expired();
        }

        let cached = self.delay_cache.get_all_valid();
        let views: Vec<ProxyGroupInfo> = {
            let loaded = self
                .loaded
                .read()
                .map_err(|e| anyhow!("读取配置失败: {}", e))?;

            loaded
                .groups
                .iter()
                .map(|group| {
                    let proxies = group
                        .members
                        .iter()
                        .filter_map(|member| loaded.find_proxy(member))
                        .map(|node| {
                            let delay = cached.get(&node.name).copied().unwrap_or(0);
                            node.clone().with_delay(delay)
                        })
                        .collect();
                    ProxyGroupInfo {
                        name: group.name.clone(),
                        group_type: group.group_type.clone(),
                        proxies,
                        now: group.members.first().cloned().unwrap_or_default(),
                    }
                })
                .collect()
        };

        debug!("刷新代理组: {} 个", views.len());
        *self
            .groups
            .write()
            .map_err(|e| anyhow!("写入代理组失败: {}", e))? = views;
        Ok(())
    }
}
