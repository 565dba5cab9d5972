//! 代理组健康检查协调器
//! 限制并发探测数量、去重在途请求，并对外发布每组状态与结果事件

mod types;

pub use types::{ProbeResult, ProbeState, ProbeStatus, Priority, QueueSnapshot, TestStatistics};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{Semaphore, broadcast, oneshot, watch};

use crate::clock::{SharedClock, system_clock};

/// 默认最大并发探测数
pub const DEFAULT_MAX_CONCURRENT_TESTS: usize = 5;

/// 结果事件缓冲区大小，落后的订阅者会丢失最旧的事件
pub const DEFAULT_RESULT_BUFFER: usize = 100;

const CANCELLED_MESSAGE: &str = "已取消";

/// 外部探测能力：测量一个代理组内所有节点，并把延迟写入延迟缓存
#[async_trait]
pub trait GroupProber: Send + Sync {
    async fn probe(&self, group_name: &str) -> anyhow::Result<()>;
}

/// 在途探测的协作式标记
#[derive(Debug, Default)]
struct InFlight {
    cancelled: AtomicBool,
    running: AtomicBool,
}

enum Outcome {
    Success,
    Failure(String),
    Cancelled,
}

struct Inner {
    prober: Arc<dyn GroupProber>,
    clock: SharedClock,
    max_concurrent: usize,
    semaphore: Semaphore,
    ongoing: DashMap<String, Arc<InFlight>>,
    states: watch::Sender<HashMap<String, ProbeState>>,
    results: broadcast::Sender<ProbeResult>,
    queue: watch::Sender<QueueSnapshot>,
}

/// 等待一次探测结束
///
/// 丢弃句柄不会中止探测；探测任务由协调器独占，结束时状态已写入且组已移出在途集合。
#[derive(Debug)]
pub struct ProbeHandle {
    done: oneshot::Receiver<()>,
}

impl Future for ProbeHandle {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // 发送端被丢弃同样意味着任务已结束
        Pin::new(&mut self.done).poll(cx).map(|_| ())
    }
}

/// 探测协调器，克隆后共享同一份状态
#[derive(Clone)]
pub struct ProbeCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProbeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeCoordinator")
            .field("max_concurrent", &self.inner.max_concurrent)
            .field("ongoing", &self.inner.ongoing.len())
            .finish()
    }
}

impl ProbeCoordinator {
    pub fn new(prober: Arc<dyn GroupProber>) -> Self {
        Self::with_config(
            prober,
            DEFAULT_MAX_CONCURRENT_TESTS,
            DEFAULT_RESULT_BUFFER,
            system_clock(),
        )
    }

    pub fn with_config(
        prober: Arc<dyn GroupProber>,
        max_concurrent_tests: usize,
        result_buffer: usize,
        clock: SharedClock,
    ) -> Self {
        let max_concurrent = max_concurrent_tests.max(1);
        let (states, _) = watch::channel(HashMap::new());
        let (results, _) = broadcast::channel(result_buffer.max(1));
        let (queue, _) = watch::channel(QueueSnapshot {
            queued_count: 0,
            testing_count: 0,
            max_concurrent,
        });

        Self {
            inner: Arc::new(Inner {
                prober,
                clock,
                max_concurrent,
                semaphore: Semaphore::new(max_concurrent),
                ongoing: DashMap::new(),
                states,
                results,
                queue,
            }),
        }
    }

    /// 请求探测一个代理组
    ///
    /// 同名组已在途时直接忽略并返回 `None`；否则立即标记为 Testing 并调度探测任务，
    /// 并发许可在任务内部获取，不阻塞调用方。失败只体现在状态与结果事件中。
    ///
    /// `priority` 与 `force_test` 目前只被接受，不改变调度顺序，也不绕过去重。
    /// 必须在 tokio 运行时内调用。
    pub fn request_test(
        &self,
        group_name: &str,
        priority: Priority,
        force_test: bool,
    ) -> Option<ProbeHandle> {
        let flight = Arc::new(InFlight::default());
        match self.inner.ongoing.entry(group_name.to_string()) {
            Entry::Occupied(_) => {
                debug!("代理组 {} 正在测试中，忽略重复请求", group_name);
                return None;
            }
            Entry::Vacant(entry) => {
                entry.insert(flight.clone());
            }
        }

        debug!(
            "请求测试代理组 {} (priority={:?}, force={})",
            group_name, priority, force_test
        );

        let started_at_ms = self.inner.clock.now_millis();
        self.inner.set_state(group_name, ProbeState::testing(started_at_ms));
        self.inner.update_queue();

        let (done_tx, done) = oneshot::channel();
        let inner = self.inner.clone();
        let group = group_name.to_string();
        tokio::spawn(async move {
            inner.run(group, flight, started_at_ms).await;
            let _ = done_tx.send(());
        });
        Some(ProbeHandle { done })
    }

    /// 批量请求，返回实际调度的数量
    pub fn request_test_all<'a, I>(&self, group_names: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        group_names
            .into_iter()
            .filter_map(|name| self.request_test(name, Priority::Normal, false))
            .count()
    }

    /// 协作式取消：只设置标记，在获取许可后和探测返回后检查
    ///
    /// 返回 `false` 表示该组不在途。
    pub fn cancel(&self, group_name: &str) -> bool {
        let Some(flight) = self
            .inner
            .ongoing
            .get(group_name)
            .map(|entry| entry.value().clone())
        else {
            return false;
        };

        if !flight.cancelled.swap(true, Ordering::SeqCst) {
            info!("取消代理组测试: {}", group_name);
            self.inner.states.send_modify(|states| {
                if let Some(current) = states.get_mut(group_name) {
                    if current.status == ProbeStatus::Testing {
                        *current = ProbeState {
                            cancelled: true,
                            ..current.clone()
                        };
                    }
                }
            });
        }
        true
    }

    /// 取消所有在途探测，返回被标记的数量
    pub fn cancel_all(&self) -> usize {
        let names: Vec<String> = self
            .inner
            .ongoing
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.iter().filter(|name| self.cancel(name)).count()
    }

    pub fn is_testing(&self, group_name: &str) -> bool {
        self.inner.ongoing.contains_key(group_name)
    }

    pub fn max_concurrent_tests(&self) -> usize {
        self.inner.max_concurrent
    }

    /// 当前所有组状态的快照
    pub fn states(&self) -> HashMap<String, ProbeState> {
        self.inner.states.borrow().clone()
    }

    pub fn state(&self, group_name: &str) -> Option<ProbeState> {
        self.inner.states.borrow().get(group_name).cloned()
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        *self.inner.queue.borrow()
    }

    /// 订阅组状态（最后写入者生效）
    pub fn subscribe_states(&self) -> watch::Receiver<HashMap<String, ProbeState>> {
        self.inner.states.subscribe()
    }

    /// 订阅结果事件
    pub fn subscribe_results(&self) -> broadcast::Receiver<ProbeResult> {
        self.inner.results.subscribe()
    }

    pub fn subscribe_queue(&self) -> watch::Receiver<QueueSnapshot> {
        self.inner.queue.subscribe()
    }

    /// 汇总统计
    ///
    /// 成功率按 `(completed - failed) / completed` 计算，completed 为 0 时为 0。
    pub fn get_test_statistics(&self) -> TestStatistics {
        let queued = self.queue_snapshot().queued_count;
        let states = self.inner.states.borrow();

        let count = |status: ProbeStatus| states.values().filter(|s| s.status == status).count();
        let completed = count(ProbeStatus::Completed);
        let failed = count(ProbeStatus::Failed);
        let testing = count(ProbeStatus::Testing);

        let success_rate = if completed > 0 {
            (completed as f32 - failed as f32) / completed as f32
        } else {
            0.0
        };

        TestStatistics {
            total: states.len(),
            completed,
            failed,
            testing,
            queued,
            success_rate,
        }
    }
}

/// 无论探测结果如何，任务结束时把组移出在途集合
struct InFlightGuard<'a> {
    inner: &'a Inner,
    group_name: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.inner.ongoing.remove(self.group_name);
        self.inner.update_queue();
    }
}

impl Inner {
    async fn run(&self, group_name: String, flight: Arc<InFlight>, started_at_ms: i64) {
        let _guard = InFlightGuard {
            inner: self,
            group_name: &group_name,
        };

        let outcome = self.execute(&group_name, &flight).await;
        let now = self.clock.now_millis();

        let state = match &outcome {
            Outcome::Success => ProbeState {
                status: ProbeStatus::Completed,
                started_at_ms,
                ended_at_ms: now,
                last_success_at_ms: now,
                ..ProbeState::default()
            },
            Outcome::Failure(message) => ProbeState {
                status: ProbeStatus::Failed,
                started_at_ms,
                ended_at_ms: now,
                error: Some(message.clone()),
                ..ProbeState::default()
            },
            Outcome::Cancelled => ProbeState {
                status: ProbeStatus::Cancelled,
                started_at_ms,
                ended_at_ms: now,
                error: Some(CANCELLED_MESSAGE.to_string()),
                cancelled: true,
                ..ProbeState::default()
            },
        };

        match &outcome {
            Outcome::Success => info!("代理组 {} 测试完成，耗时 {}ms", group_name, state.duration()),
            Outcome::Failure(message) => warn!("代理组 {} 测试失败: {}", group_name, message),
            Outcome::Cancelled => info!("代理组 {} 测试已取消", group_name),
        }

        let result = ProbeResult {
            group_name: group_name.clone(),
            success: matches!(outcome, Outcome::Success),
            duration_ms: state.duration(),
            error: state.error.clone(),
        };

        self.set_state(&group_name, state);
        // 没有订阅者时发送失败，忽略即可
        let _ = self.results.send(result);
    }

    async fn execute(&self, group_name: &str, flight: &InFlight) -> Outcome {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(e) => return Outcome::Failure(format!("并发许可不可用: {}", e)),
        };

        if flight.cancelled.load(Ordering::SeqCst) {
            return Outcome::Cancelled;
        }

        flight.running.store(true, Ordering::SeqCst);
        self.update_queue();

        // 单独的任务里执行，探测实现 panic 时也能转换为失败状态
        let prober = self.prober.clone();
        let name = group_name.to_string();
        let joined = tokio::spawn(async move { prober.probe(&name).await }).await;

        flight.running.store(false, Ordering::SeqCst);

        if flight.cancelled.load(Ordering::SeqCst) {
            return Outcome::Cancelled;
        }

        match joined {
            Ok(Ok(())) => Outcome::Success,
            Ok(Err(e)) => Outcome::Failure(e.to_string()),
            Err(e) => Outcome::Failure(format!("探测任务异常终止: {}", e)),
        }
    }

    fn set_state(&self, group_name: &str, state: ProbeState) {
        self.states.send_modify(|states| {
            states.insert(group_name.to_string(), state);
        });
    }

    /// 统计与发布在同一把写锁内完成，并发退出时最后发布的一定是最新计数
    fn update_queue(&self) {
        self.queue.send_modify(|queue| {
            let total = self.ongoing.len();
            let testing_count = self
                .ongoing
                .iter()
                .filter(|entry| entry.value().running.load(Ordering::SeqCst))
                .count();

            *queue = QueueSnapshot {
                queued_count: total.saturating_sub(testing_count),
                testing_count,
                max_concurrent: self.max_concurrent,
            };
        });
    }
}
