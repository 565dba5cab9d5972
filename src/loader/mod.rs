//! 配置自动加载
//! 未指定 Profile 时按固定规则挑选一个，加载后等待内核稳定再刷新代理组

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{SharedClock, system_clock};
use crate::error::{LoaderError, LoaderResult};
use crate::profile::{Profile, ProfileStore, ProfileType, RunningMode};

/// 加载成功后等待内核稳定的时间
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// 快速启动要求配置至少这么久没有更新
const QUICK_START_MIN_AGE_MS: i64 = 2 * 60 * 60 * 1000;

/// 外部内核能力
#[async_trait]
pub trait ProfileEngine: Send + Sync {
    /// 当前运行模式
    fn running_mode(&self) -> RunningMode;

    /// 把配置加载进内核，成功时返回描述信息
    async fn load_profile(
        &self,
        profile: &Profile,
        force_download: bool,
        will_use_tun_mode: bool,
        quick_start: bool,
    ) -> anyhow::Result<String>;

    /// 加载后重新枚举代理组与节点
    async fn refresh_groups(&self, skip_cache_clear: bool) -> anyhow::Result<()>;
}

/// 挑选推荐的 Profile，先匹配者胜出：
/// 1. 上次使用且仍存在的
/// 2. 第一个启用的
/// 3. 第一个
pub fn select_profile<'a>(profiles: &'a [Profile], last_used_id: &str) -> Option<&'a Profile> {
    if !last_used_id.is_empty() {
        if let Some(profile) = profiles.iter().find(|p| p.id == last_used_id) {
            return Some(profile);
        }
    }

    profiles
        .iter()
        .find(|p| p.enabled)
        .or_else(|| profiles.first())
}

pub struct ConfigAutoLoader {
    engine: Arc<dyn ProfileEngine>,
    store: Arc<dyn ProfileStore>,
    clock: SharedClock,
    settle_delay: Duration,
}

impl ConfigAutoLoader {
    pub fn new(engine: Arc<dyn ProfileEngine>, store: Arc<dyn ProfileStore>) -> Self {
        Self {
            engine,
            store,
            clock: system_clock(),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// 按推荐规则挑选 Profile
    pub async fn recommended_profile(&self) -> anyhow::Result<Option<Profile>> {
        let profiles = self.store.all_profiles().await?;
        let last_used_id = self.store.last_used_profile_id().await?;
        Ok(select_profile(&profiles, &last_used_id).cloned())
    }

    async fn find_profile(&self, profile_id: &str) -> LoaderResult<Profile> {
        self.store
            .all_profiles()
            .await?
            .into_iter()
            .find(|p| p.id == profile_id)
            .ok_or_else(|| LoaderError::NotFound(profile_id.to_string()))
    }

    /// 重新加载配置；显式指定的 id 优先于推荐规则
    ///
    /// 任何失败都以 `Err` 返回，不会 panic。
    pub async fn reload_config(&self, profile_id: Option<&str>) -> LoaderResult<String> {
        let result = self.try_reload(profile_id).await;
        if let Err(e) = &result {
            error!("重新加载配置失败: {}", e);
        }
        result
    }

    async fn try_reload(&self, profile_id: Option<&str>) -> LoaderResult<String> {
        let profile = match profile_id {
            Some(id) => self.find_profile(id).await?,
            None => self
                .recommended_profile()
                .await?
                .ok_or(LoaderError::NoProfile)?,
        };

        info!("重新加载配置: {}", profile.name);

        let will_use_tun = self.engine.running_mode() == RunningMode::Tun;
        let message = self
            .engine
            .load_profile(&profile, false, will_use_tun, false)
            .await?;

        tokio::time::sleep(self.settle_delay).await;

        if let Err(e) = self.engine.refresh_groups(false).await {
            warn!("刷新代理组失败: {}", e);
        }

        debug!("配置重新加载成功: {}", profile.name);
        Ok(message)
    }

    /// 按 id 加载指定配置
    ///
    /// `skip_config_load` 为 true 时只确认配置存在，不调用内核加载。
    /// 快速启动只对超过两小时未更新的本地配置生效。
    pub async fn load_profile_if_needed(
        &self,
        profile_id: &str,
        skip_config_load: bool,
        will_use_tun_mode: bool,
        quick_start: bool,
    ) -> LoaderResult<Profile> {
        let result = self
            .try_load(profile_id, skip_config_load, will_use_tun_mode, quick_start)
            .await;
        if let Err(e) = &result {
            error!("加载配置失败: {}", e);
        }
        result
    }

    async fn try_load(
        &self,
        profile_id: &str,
        skip_config_load: bool,
        will_use_tun_mode: bool,
        quick_start: bool,
    ) -> LoaderResult<Profile> {
        let profile = self.find_profile(profile_id).await?;

        if skip_config_load {
            debug!("跳过配置加载: {}", profile.name);
            return Ok(profile);
        }

        info!("正在加载配置: {}", profile.name);

        let use_quick_start = quick_start && self.quick_start_allowed(&profile);
        self.engine
            .load_profile(&profile, false, will_use_tun_mode, use_quick_start)
            .await
            .map_err(|e| LoaderError::LoadFailed(e.to_string()))?;

        if use_quick_start {
            debug!("使用快速启动模式，providers 将在后台更新");
        }

        Ok(profile)
    }

    fn quick_start_allowed(&self, profile: &Profile) -> bool {
        if profile.profile_type != ProfileType::File {
            return false;
        }
        let threshold = self.clock.now_millis() - QUICK_START_MIN_AGE_MS;
        profile
            .last_updated_at
            .is_some_and(|updated_at| updated_at < threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::profile::MemoryProfileStore;
    use anyhow::anyhow;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct LoadCall {
        profile_id: String,
        will_use_tun_mode: bool,
        quick_start: bool,
    }

    #[derive(Default)]
    struct FakeEngine {
        mode: Option<RunningMode>,
        fail_load: bool,
        fail_refresh: bool,
        loads: Mutex<Vec<LoadCall>>,
        refreshes: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl ProfileEngine for FakeEngine {
        fn running_mode(&self) -> RunningMode {
            self.mode.unwrap_or_default()
        }

        async fn load_profile(
            &self,
            profile: &Profile,
            _force_download: bool,
            will_use_tun_mode: bool,
            quick_start: bool,
        ) -> anyhow::Result<String> {
            self.loads.lock().unwrap().push(LoadCall {
                profile_id: profile.id.clone(),
                will_use_tun_mode,
                quick_start,
            });
            if self.fail_load {
                return Err(anyhow!("下载订阅超时"));
            }
            Ok(format!("已加载 {}", profile.name))
        }

        async fn refresh_groups(&self, skip_cache_clear: bool) -> anyhow::Result<()> {
            self.refreshes.lock().unwrap().push(skip_cache_clear);
            if self.fail_refresh {
                return Err(anyhow!("内核未就绪"));
            }
            Ok(())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl ProfileStore for BrokenStore {
        async fn all_profiles(&self) -> anyhow::Result<Vec<Profile>> {
            Err(anyhow!("存储损坏"))
        }

        async fn last_used_profile_id(&self) -> anyhow::Result<String> {
            Err(anyhow!("存储损坏"))
        }
    }

    fn sample_profiles() -> Vec<Profile> {
        vec![
            Profile::new("a", "A", ProfileType::Url).with_enabled(false),
            Profile::new("b", "B", ProfileType::Url).with_enabled(true),
        ]
    }

    fn create_loader(engine: Arc<FakeEngine>, profiles: Vec<Profile>, last_used: &str) -> ConfigAutoLoader {
        let store = Arc::new(MemoryProfileStore::new(profiles, last_used));
        ConfigAutoLoader::new(engine, store).with_settle_delay(Duration::ZERO)
    }

    #[test]
    fn test_select_first_enabled_without_last_used() {
        let profiles = sample_profiles();
        assert_eq!(select_profile(&profiles, "").unwrap().id, "b");
    }

    #[test]
    fn test_select_last_used_even_if_disabled() {
        let profiles = sample_profiles();
        assert_eq!(select_profile(&profiles, "a").unwrap().id, "a");
    }

    #[test]
    fn test_select_ignores_stale_last_used() {
        let profiles = sample_profiles();
        assert_eq!(select_profile(&profiles, "deleted").unwrap().id, "b");
    }

    #[test]
    fn test_select_falls_back_to_first() {
        let profiles = vec![
            Profile::new("x", "X", ProfileType::File),
            Profile::new("y", "Y", ProfileType::Url),
        ];
        assert_eq!(select_profile(&profiles, "").unwrap().id, "x");
        assert!(select_profile(&[], "x").is_none());
    }

    #[tokio::test]
    async fn test_reload_uses_recommended_profile() {
        let engine = Arc::new(FakeEngine {
            mode: Some(RunningMode::Tun),
            ..FakeEngine::default()
        });
        let loader = create_loader(engine.clone(), sample_profiles(), "");

        let message = loader.reload_config(None).await.unwrap();
        assert_eq!(message, "已加载 B");

        let loads = engine.loads.lock().unwrap().clone();
        assert_eq!(
            loads,
            vec![LoadCall {
                profile_id: "b".to_string(),
                will_use_tun_mode: true,
                quick_start: false,
            }]
        );
        assert_eq!(*engine.refreshes.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_reload_explicit_id_takes_precedence() {
        let engine = Arc::new(FakeEngine::default());
        let loader = create_loader(engine.clone(), sample_profiles(), "b");

        loader.reload_config(Some("a")).await.unwrap();
        assert_eq!(engine.loads.lock().unwrap()[0].profile_id, "a");
        assert!(!engine.loads.lock().unwrap()[0].will_use_tun_mode);
    }

    #[tokio::test]
    async fn test_reload_empty_collection_fails() {
        let engine = Arc::new(FakeEngine::default());
        let loader = create_loader(engine.clone(), vec![], "");

        let err = loader.reload_config(None).await.unwrap_err();
        assert!(matches!(err, LoaderError::NoProfile));
        assert!(engine.loads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reload_unknown_id_fails() {
        let engine = Arc::new(FakeEngine::default());
        let loader = create_loader(engine, sample_profiles(), "");

        let err = loader.reload_config(Some("zzz")).await.unwrap_err();
        assert!(matches!(err, LoaderError::NotFound(ref id) if id == "zzz"));
    }

    #[tokio::test]
    async fn test_reload_load_failure_skips_refresh() {
        let engine = Arc::new(FakeEngine {
            fail_load: true,
            ..FakeEngine::default()
        });
        let loader = create_loader(engine.clone(), sample_profiles(), "");

        let err = loader.reload_config(None).await.unwrap_err();
        assert_eq!(err.to_string(), "下载订阅超时");
        assert!(engine.refreshes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reload_tolerates_refresh_failure() {
        let engine = Arc::new(FakeEngine {
            fail_refresh: true,
            ..FakeEngine::default()
        });
        let loader = create_loader(engine.clone(), sample_profiles(), "");

        assert!(loader.reload_config(None).await.is_ok());
        assert_eq!(engine.refreshes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_store_failure_is_result() {
        let engine = Arc::new(FakeEngine::default());
        let loader = ConfigAutoLoader::new(engine, Arc::new(BrokenStore))
            .with_settle_delay(Duration::ZERO);

        let err = loader.reload_config(None).await.unwrap_err();
        assert_eq!(err.to_string(), "存储损坏");
    }

    #[tokio::test]
    async fn test_load_profile_if_needed_quick_start() {
        let now = 100 * QUICK_START_MIN_AGE_MS;
        let profiles = vec![
            Profile::new("old", "旧本地", ProfileType::File)
                .with_last_updated_at(now - QUICK_START_MIN_AGE_MS - 1),
            Profile::new("fresh", "新本地", ProfileType::File).with_last_updated_at(now - 1_000),
            Profile::new("remote", "订阅", ProfileType::Url)
                .with_last_updated_at(now - QUICK_START_MIN_AGE_MS - 1),
            Profile::new("unknown", "未更新", ProfileType::File),
        ];
        let engine = Arc::new(FakeEngine::default());
        let loader = create_loader(engine.clone(), profiles, "")
            .with_clock(Arc::new(ManualClock::new(now)));

        for id in ["old", "fresh", "remote", "unknown"] {
            let profile = loader.load_profile_if_needed(id, false, true, true).await.unwrap();
            assert_eq!(profile.id, id);
        }

        let quick: Vec<bool> = engine
            .loads
            .lock()
            .unwrap()
            .iter()
            .map(|call| call.quick_start)
            .collect();
        assert_eq!(quick, vec![true, false, false, false]);
        assert!(engine.loads.lock().unwrap().iter().all(|c| c.will_use_tun_mode));
        assert!(engine.refreshes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_profile_if_needed_failures() {
        let engine = Arc::new(FakeEngine {
            fail_load: true,
            ..FakeEngine::default()
        });
        let loader = create_loader(engine, sample_profiles(), "");

        let err = loader.load_profile_if_needed("missing", false, false, false).await.unwrap_err();
        assert_eq!(err.to_string(), "未找到配置文件: missing");

        let err = loader.load_profile_if_needed("a", false, false, false).await.unwrap_err();
        assert_eq!(err.to_string(), "配置加载失败: 下载订阅超时");
    }

    #[tokio::test]
    async fn test_load_profile_if_needed_skip() {
        let engine = Arc::new(FakeEngine::default());
        let loader = create_loader(engine.clone(), sample_profiles(), "");

        let profile = loader.load_profile_if_needed("b", true, false, false).await.unwrap();
        assert_eq!(profile.id, "b");
        assert!(engine.loads.lock().unwrap().is_empty());
    }
}
