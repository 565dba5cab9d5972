//! 节点延迟缓存
//! 按节点名保存最近一次有效延迟，带有效期（TTL）
//!
//! 过期判断在读取时惰性进行：`get`/`get_record` 遇到过期条目会顺手删除；
//! `sweep_expired` 供周期性维护调用，两者互不依赖，不存在后台定时器。

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::clock::{SharedClock, system_clock};

/// 默认有效期 30 分钟
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(30 * 60);

/// 默认探测标签
pub const DEFAULT_PROBE_LABEL: &str = "default";

/// 一条延迟记录，插入后不可变，更新时整体替换
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyRecord {
    pub node_name: String,
    pub delay_ms: i64,
    pub probe_label: String,
    pub measured_at_ms: i64,
}

impl LatencyRecord {
    pub fn is_valid(&self, now_ms: i64, validity_ms: i64) -> bool {
        now_ms - self.measured_at_ms < validity_ms
    }
}

/// 线程安全的延迟缓存
pub struct DelayCache {
    entries: DashMap<String, LatencyRecord>,
    validity_ms: i64,
    clock: SharedClock,
}

impl std::fmt::Debug for DelayCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayCache")
            .field("entries", &self.entries.len())
            .field("validity_ms", &self.validity_ms)
            .finish()
    }
}

impl Default for DelayCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayCache {
    /// 使用默认有效期和系统时钟创建缓存
    pub fn new() -> Self {
        Self::with_validity(DEFAULT_VALIDITY)
    }

    pub fn with_validity(validity: Duration) -> Self {
        Self::with_clock(validity, system_clock())
    }

    pub fn with_clock(validity: Duration, clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            validity_ms: i64::try_from(validity.as_millis()).unwrap_or(i64::MAX),
            clock,
        }
    }

    /// 有效期（毫秒）
    pub fn validity_ms(&self) -> i64 {
        self.validity_ms
    }

    /// 写入单个节点延迟，`delay_ms <= 0` 视为无测量结果，直接忽略
    pub fn update(&self, node_name: &str, delay_ms: i64, probe_label: &str) {
        if delay_ms <= 0 {
            return;
        }
        let now = self.clock.now_millis();
        self.insert(node_name, delay_ms, probe_label, now);
    }

    /// 批量写入，同一批次共用一个时间戳；逐条生效，不是整体事务
    pub fn update_batch<'a, I>(&self, delays: I, probe_label: &str)
    where
        I: IntoIterator<Item = (&'a str, i64)>,
    {
        let now = self.clock.now_millis();
        for (node_name, delay_ms) in delays {
            if delay_ms > 0 {
                self.insert(node_name, delay_ms, probe_label, now);
            }
        }
    }

    fn insert(&self, node_name: &str, delay_ms: i64, probe_label: &str, now: i64) {
        self.entries.insert(
            node_name.to_string(),
            LatencyRecord {
                node_name: node_name.to_string(),
                delay_ms,
                probe_label: probe_label.to_string(),
                measured_at_ms: now,
            },
        );
    }

    /// 读取有效延迟；过期则删除并返回 None
    pub fn get(&self, node_name: &str) -> Option<i64> {
        self.get_record(node_name).map(|record| record.delay_ms)
    }

    /// 读取完整记录，过期语义与 `get` 相同
    pub fn get_record(&self, node_name: &str) -> Option<LatencyRecord> {
        let now = self.clock.now_millis();
        let record = self.entries.get(node_name)?.value().clone();

        if record.is_valid(now, self.validity_ms) {
            return Some(record);
        }

        // 读锁已释放；只删除仍然过期的那条，避免误删并发写入的新值
        let validity_ms = self.validity_ms;
        self.entries
            .remove_if(node_name, |_, current| !current.is_valid(now, validity_ms));
        None
    }

    /// 所有有效延迟的快照，不会删除过期条目
    pub fn get_all_valid(&self) -> HashMap<String, i64> {
        let now = self.clock.now_millis();
        self.entries
            .iter()
            .filter(|entry| entry.value().is_valid(now, self.validity_ms))
            .map(|entry| (entry.key().clone(), entry.value().delay_ms))
            .collect()
    }

    pub fn clear(&self, node_name: &str) -> Option<LatencyRecord> {
        self.entries.remove(node_name).map(|(_, record)| record)
    }

    pub fn clear_all(&self) {
        self.entries.clear();
    }

    /// 清理所有过期条目，返回删除数量
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let validity_ms = self.validity_ms;
        let before = self.entries.len();
        let mut removed = 0;

        self.entries.retain(|_, record| {
            let keep = record.is_valid(now, validity_ms);
            if !keep {
                removed += 1;
            }
            keep
        });

        log::debug!("延迟缓存清理: {}/{} 条过期", removed, before);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
