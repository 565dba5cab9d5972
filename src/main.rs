use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use log::{debug, warn};
use std::path::Path;
use std::sync::Arc;

use clash_probe::clash_proxy::{ClashProxyManager, DelayCache, ProxyHealthChecker};
use clash_probe::clock::system_clock;
use clash_probe::config::Config;
use clash_probe::loader::{ConfigAutoLoader, ProfileEngine};
use clash_probe::profile::{FileProfileStore, RunningMode};
use clash_probe::testing::{Priority, ProbeCoordinator, ProbeStatus};
use clash_probe::traffic::{TrafficData, format_bytes};

/// 代理组健康检查工具
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short = 'f', long, default_value = "config/config.yaml")]
    config: String,

    /// 日志级别
    #[arg(long)]
    log_level: Option<String>,

    /// 最大并发测试数
    #[arg(long)]
    concurrent: Option<usize>,

    /// 超时时间（毫秒）
    #[arg(long)]
    timeout: Option<u64>,

    /// 测试地址
    #[arg(long)]
    test_url: Option<String>,

    /// 以 TUN 模式加载
    #[arg(long)]
    tun: bool,

    /// 详细输出
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 重新加载配置
    Reload {
        /// 指定 Profile id，不指定时自动挑选
        #[arg(long)]
        profile: Option<String>,
    },
    /// 加载配置并测试代理组
    Test {
        /// 代理组名，不指定时测试全部
        groups: Vec<String>,

        #[arg(long)]
        profile: Option<String>,
    },
    /// 解码流量打包值（十进制或 0x 十六进制）
    Decode { values: Vec<String> },
}

fn load_config(args: &Args) -> Config {
    let mut config = if Path::new(&args.config).exists() {
        match Config::load_from_file(&args.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("⚠️  配置文件加载失败: {}，使用默认配置", e);
                Config::default()
            }
        }
    } else {
        Config::default()
    };

    // 覆盖命令行参数
    if let Some(concurrent) = args.concurrent {
        config.max_concurrent_tests = concurrent;
    }
    if let Some(timeout) = args.timeout {
        config.timeout = timeout;
    }
    if let Some(test_url) = &args.test_url {
        config.test_url = test_url.clone();
    }
    if let Some(log_level) = &args.log_level {
        config.log_level = log_level.clone();
    }
    if args.tun {
        config.tun_mode = true;
    }
    config
}

fn init_logger(config: &Config, verbose: bool) {
    let level = if verbose { "debug" } else { config.log_level.as_str() };
    // RUST_LOG 优先
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn parse_packed(value: &str) -> Result<u64> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };
    parsed.map_err(|e| anyhow!("无效的流量值 {}: {}", value, e))
}

struct App {
    manager: Arc<ClashProxyManager>,
    loader: ConfigAutoLoader,
    coordinator: ProbeCoordinator,
}

impl App {
    fn new(config: &Config) -> Self {
        let delay_cache = Arc::new(DelayCache::with_validity(config.delay_validity()));
        let checker = ProxyHealthChecker::new(config.timeout, Some(config.test_url.clone()));
        let manager = Arc::new(ClashProxyManager::new(checker, delay_cache));
        manager.set_running_mode(if config.tun_mode {
            RunningMode::Tun
        } else {
            RunningMode::Http
        });

        let store = Arc::new(FileProfileStore::new(&config.profiles_file));
        let loader = ConfigAutoLoader::new(manager.clone(), store)
            .with_settle_delay(config.settle_delay());
        let coordinator = ProbeCoordinator::with_config(
            manager.clone(),
            config.max_concurrent_tests,
            config.result_buffer,
            system_clock(),
        );

        Self {
            manager,
            loader,
            coordinator,
        }
    }

    async fn reload(&self, profile: Option<&str>) -> Result<()> {
        let message = self.loader.reload_config(profile).await?;
        println!("✅ {}", message);
        Ok(())
    }

    async fn test(&self, profile: Option<&str>, groups: Vec<String>) -> Result<()> {
        self.reload(profile).await?;

        let groups = if groups.is_empty() {
            self.manager.group_names()
        } else {
            groups
        };

        println!("\n🔍 开始测试 {} 个代理组...", groups.len());
        println!("{:=<80}", "");

        let handles: Vec<_> = groups
            .iter()
            .filter_map(|group| self.coordinator.request_test(group, Priority::Normal, false))
            .collect();
        for handle in handles {
            handle.await;
        }

        let states = self.coordinator.states();
        for group in &groups {
            let Some(state) = states.get(group) else {
                continue;
            };
            match state.status {
                ProbeStatus::Completed => println!("✅ {} ({}ms)", group, state.duration()),
                ProbeStatus::Failed => println!(
                    "❌ {}: {}",
                    group,
                    state.error.as_deref().unwrap_or("未知错误")
                ),
                status => println!("⚠️  {}: {:?}", group, status),
            }
        }

        if let Err(e) = self.manager.refresh_groups(true).await {
            warn!("刷新代理组失败: {}", e);
        }

        println!("\n节点延迟:");
        println!("{:-<80}", "");
        for group in self.manager.proxy_groups() {
            let available = group.proxies.iter().filter(|node| node.is_available()).count();
            println!(
                "[{}] {} ({}/{} 可用)",
                group.group_type,
                group.name,
                available,
                group.proxies.len()
            );
            for node in &group.proxies {
                println!("   {}: {}", node.name, node.get_delay_description());
            }
        }

        let stats = self.coordinator.get_test_statistics();
        println!("\n检测摘要:");
        println!("{:=<80}", "");
        println!("代理组: {}", stats.total);
        println!("完成: {}", stats.completed);
        println!("失败: {}", stats.failed);
        println!("成功率: {:.1}%", stats.success_rate * 100.0);

        let removed = self.manager.delay_cache().sweep_expired();
        debug!("清理过期延迟 {} 条", removed);
        Ok(())
    }
}

fn decode(values: &[String]) -> Result<()> {
    for value in values {
        let packed = parse_packed(value)?;
        let traffic = TrafficData::from_packed(packed);
        println!(
            "{:#018x}: {} (合计 {})",
            packed,
            traffic,
            format_bytes(traffic.total())
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args);
    init_logger(&config, args.verbose);

    match &args.command {
        Command::Decode { values } => decode(values),
        Command::Reload { profile } => App::new(&config).reload(profile.as_deref()).await,
        Command::Test { groups, profile } => {
            App::new(&config)
                .test(profile.as_deref(), groups.clone())
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clash_probe::profile::{Profile, ProfileList, ProfileType};

    const LOCAL_CONFIG: &str = r#"
proxies:
  - {name: 香港 01, type: http, server: 127.0.0.1, port: 9}
proxy-groups:
  - {name: 节点选择, type: select, proxies: [香港 01, DIRECT]}
"#;

    #[test]
    fn test_parse_packed() {
        assert_eq!(parse_packed("0").unwrap(), 0);
        assert_eq!(parse_packed("0x40000064").unwrap(), 0x4000_0064);
        assert_eq!(parse_packed("1024").unwrap(), 1024);
        assert!(parse_packed("0xZZ").is_err());
        assert!(parse_packed("-1").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["clash-probe", "--concurrent", "3", "test", "节点选择"]);
        assert_eq!(args.concurrent, Some(3));
        match args.command {
            Command::Test { groups, profile } => {
                assert_eq!(groups, vec!["节点选择"]);
                assert!(profile.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reload_then_refresh_groups() {
        let dir = tempfile::tempdir().unwrap();
        let clash_path = dir.path().join("clash.yaml");
        std::fs::write(&clash_path, LOCAL_CONFIG).unwrap();

        let profiles_path = dir.path().join("profiles.yaml");
        let store = FileProfileStore::new(&profiles_path);
        store
            .save(&ProfileList {
                last_used_profile_id: "local".to_string(),
                profiles: vec![
                    Profile::new("local", "本地", ProfileType::File)
                        .with_path(clash_path.to_str().unwrap()),
                ],
            })
            .unwrap();

        let config = Config {
            profiles_file: profiles_path.to_string_lossy().into_owned(),
            settle_delay_ms: 0,
            ..Config::default()
        };
        let app = App::new(&config);
        app.reload(None).await.unwrap();
        assert_eq!(app.manager.group_names(), vec!["节点选择"]);

        app.manager.refresh_groups(true).await.unwrap();
        let groups = app.manager.proxy_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].proxies.len(), 1);
        assert!(!groups[0].proxies[0].is_available());
    }
}
