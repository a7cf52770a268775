//! 并发调度器 - 编排层
//!
//! ## 职责
//!
//! 限制同时执行的运行数量（默认 4），其余的排队等待。
//!
//! - 准入顺序即提交顺序；优先的任务排在普通队列之前
//! - 槽位由 `SlotGuard` 持有，任务以任何方式结束（包括 panic）时都会归还
//! - 归还槽位后立即派发下一个排队的任务

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// 默认并发数
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

type Job = BoxFuture<'static, ()>;

#[derive(Default)]
struct Queues {
    prioritized: VecDeque<Job>,
    normal: VecDeque<Job>,
}

impl Queues {
    fn len(&self) -> usize {
        self.prioritized.len() + self.normal.len()
    }

    fn is_empty(&self) -> bool {
        self.prioritized.is_empty() && self.normal.is_empty()
    }

    fn pop(&mut self) -> Option<Job> {
        self.prioritized
            .pop_front()
            .or_else(|| self.normal.pop_front())
    }
}

struct Inner {
    limit: usize,
    semaphore: Arc<Semaphore>,
    queues: Mutex<Queues>,
    running: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
}

/// 调度器统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub limit: usize,
    pub running: usize,
    pub queued: usize,
    /// 曾经同时运行的最大数量
    pub peak: usize,
    pub completed: usize,
}

/// 有界并发调度器
#[derive(Clone)]
pub struct ConcurrencyScheduler {
    inner: Arc<Inner>,
}

impl ConcurrencyScheduler {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            inner: Arc::new(Inner {
                limit,
                semaphore: Arc::new(Semaphore::new(limit)),
                queues: Mutex::new(Queues::default()),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            }),
        }
    }

    /// 提交一个任务；有空闲槽位时立即开始，否则排队
    pub fn submit<F>(&self, job: F, prioritized: bool)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        {
            let mut queues = self.inner.lock_queues();
            if prioritized {
                queues.prioritized.push_back(job.boxed());
            } else {
                queues.normal.push_back(job.boxed());
            }
        }
        self.inner.pump();
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            limit: self.inner.limit,
            running: self.inner.running.load(Ordering::SeqCst),
            queued: self.inner.lock_queues().len(),
            peak: self.inner.peak.load(Ordering::SeqCst),
            completed: self.inner.completed.load(Ordering::SeqCst),
        }
    }
}

impl Default for ConcurrencyScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}

impl Inner {
    fn lock_queues(&self) -> MutexGuard<'_, Queues> {
        // 队列操作本身不会 panic，中毒时继续使用内部数据
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 有排队任务且有空闲槽位时派发
    ///
    /// 检查队列和获取槽位都在队列锁内完成；每次入队和每次归还槽位之后都会调用，
    /// 因此不会出现有空闲槽位但任务一直排队的情况。
    fn pump(self: &Arc<Self>) {
        let Ok(handle) = Handle::try_current() else {
            warn!("⚠️ 当前不在 tokio 运行时中，暂停派发排队任务");
            return;
        };

        loop {
            let (job, permit) = {
                let mut queues = self.lock_queues();
                if queues.is_empty() {
                    return;
                }
                let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                    return;
                };
                match queues.pop() {
                    Some(job) => (job, permit),
                    None => return,
                }
            };

            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            debug!("派发任务，当前运行 {}/{}", running, self.limit);

            let guard = SlotGuard {
                permit: Some(permit),
                inner: self.clone(),
            };
            handle.spawn(async move {
                let _guard = guard;
                job.await;
            });
        }
    }
}

/// 持有一个槽位；drop 时归还并派发下一个任务
struct SlotGuard {
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<Inner>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.running.fetch_sub(1, Ordering::SeqCst);
        self.inner.completed.fetch_add(1, Ordering::SeqCst);
        drop(self.permit.take());
        self.inner.pump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    async fn wait_completed(scheduler: &ConcurrencyScheduler, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.stats().completed < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_limit_is_respected_and_queue_drains() {
        let scheduler = ConcurrencyScheduler::new(2);
        let mut releases = Vec::new();
        let mut done = Vec::new();

        for _ in 0..5 {
            let (release_tx, release_rx) = oneshot::channel::<()>();
            let (done_tx, done_rx) = oneshot::channel();
            scheduler.submit(
                async move {
                    let _ = release_rx.await;
                    let _ = done_tx.send(());
                },
                false,
            );
            releases.push(release_tx);
            done.push(done_rx);
        }

        let stats = scheduler.stats();
        assert_eq!(stats.running, 2);
        assert_eq!(stats.queued, 3);

        for (release, done) in releases.into_iter().zip(done) {
            release.send(()).unwrap();
            tokio::time::timeout(Duration::from_secs(5), done)
                .await
                .unwrap()
                .unwrap();
        }
        wait_completed(&scheduler, 5).await;

        let stats = scheduler.stats();
        assert_eq!(stats.running, 0);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.peak, 2);
    }

    #[tokio::test]
    async fn test_prioritized_job_runs_before_queued_jobs() {
        let scheduler = ConcurrencyScheduler::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        // 占住唯一的槽位
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (first_tx, first_rx) = oneshot::channel();
        scheduler.submit(
            async move {
                let _ = release_rx.await;
                let _ = first_tx.send(());
            },
            false,
        );

        let (last_tx, last_rx) = oneshot::channel();
        let mut last_tx = Some(last_tx);
        for (name, prioritized) in [("normal-1", false), ("normal-2", false), ("priority", true)] {
            let order = order.clone();
            let tx = if name == "normal-2" { last_tx.take() } else { None };
            scheduler.submit(
                async move {
                    order.lock().unwrap().push(name);
                    if let Some(tx) = tx {
                        let _ = tx.send(());
                    }
                },
                prioritized,
            );
        }

        release_tx.send(()).unwrap();
        first_rx.await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), last_rx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["priority", "normal-1", "normal-2"]);
    }

    #[tokio::test]
    async fn test_panicking_job_releases_slot() {
        let scheduler = ConcurrencyScheduler::new(1);
        scheduler.submit(async { panic!("job exploded") }, false);

        let (tx, rx) = oneshot::channel();
        scheduler.submit(
            async move {
                let _ = tx.send(());
            },
            false,
        );

        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scheduler.stats().peak, 1);
    }
}
