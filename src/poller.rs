//! 可见性轮询器 - 没有可见界面时定期检查进程前后台状态
//!
//! 首次检查在固定延迟后，之后按固定间隔重复；一旦检测到后台，
//! 轮询器自行停止并回调一次，不会自动重新启动。
//! 每个实例只能启动一次，重新轮询需要新建实例。

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// 进程可见性分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessVisibility {
    /// 有用户可交互的界面
    Foreground,
    /// 进程存活但没有可见界面（类似前台服务）
    ForegroundService,
    /// 完全进入后台
    Background,
}

impl ProcessVisibility {
    /// 最低的两档都按后台处理
    pub fn is_background_like(self) -> bool {
        matches!(
            self,
            ProcessVisibility::ForegroundService | ProcessVisibility::Background
        )
    }

    fn to_u8(self) -> u8 {
        match self {
            ProcessVisibility::Foreground => 0,
            ProcessVisibility::ForegroundService => 1,
            ProcessVisibility::Background => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProcessVisibility::Foreground,
            1 => ProcessVisibility::ForegroundService,
            _ => ProcessVisibility::Background,
        }
    }
}

/// 平台相关的前后台判断
pub trait VisibilityProbe: Send + Sync {
    fn classify(&self) -> ProcessVisibility;
}

/// 由宿主应用显式设置的可见性
#[derive(Debug)]
pub struct ManualVisibility {
    state: AtomicU8,
}

impl ManualVisibility {
    pub fn new(initial: ProcessVisibility) -> Self {
        Self {
            state: AtomicU8::new(initial.to_u8()),
        }
    }

    pub fn set(&self, visibility: ProcessVisibility) {
        self.state.store(visibility.to_u8(), Ordering::SeqCst);
    }
}

impl Default for ManualVisibility {
    fn default() -> Self {
        Self::new(ProcessVisibility::Foreground)
    }
}

impl VisibilityProbe for ManualVisibility {
    fn classify(&self) -> ProcessVisibility {
        ProcessVisibility::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// 轮询时序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTiming {
    pub initial_delay: Duration,
    pub interval: Duration,
}

/// 单次使用的后台轮询器
pub struct VisibilityPoller {
    id: u64,
    probe: Arc<dyn VisibilityProbe>,
    timing: PollTiming,
    runtime: Handle,
    stopped: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl VisibilityPoller {
    pub fn new(id: u64, probe: Arc<dyn VisibilityProbe>, timing: PollTiming, runtime: Handle) -> Self {
        Self {
            id,
            probe,
            timing,
            runtime,
            stopped: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// 启动轮询。已启动过（无论是否仍在运行）则返回 `false`，不会产生第二个循环
    pub fn start<F>(&mut self, on_background: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.task.is_some() || self.stopped.load(Ordering::SeqCst) {
            return false;
        }

        let id = self.id;
        let probe = Arc::clone(&self.probe);
        let stopped = Arc::clone(&self.stopped);
        let interval = self.timing.interval.max(Duration::from_millis(1));
        let first = Instant::now() + self.timing.initial_delay;

        debug!(poller = id, "Visibility poller started");
        self.task = Some(self.runtime.spawn(async move {
            let mut ticker = interval_at(first, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if stopped.load(Ordering::SeqCst) {
                    return;
                }

                let visibility = probe.classify();
                debug!(poller = id, ?visibility, "Visibility check");
                if visibility.is_background_like() {
                    // swap 保证与 stop() 竞争时最多只有一方胜出
                    if !stopped.swap(true, Ordering::SeqCst) {
                        info!(poller = id, "Process went to background");
                        on_background();
                    }
                    return;
                }
            }
        }));
        true
    }

    /// 停止轮询；未运行时为空操作。返回后不会再有新的检查开始
    pub fn stop(&mut self) {
        let was_stopped = self.stopped.swap(true, Ordering::SeqCst);
        if let Some(task) = &self.task {
            task.abort();
            if !was_stopped {
                debug!(poller = self.id, "Visibility poller stopped");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        match &self.task {
            Some(task) => !self.stopped.load(Ordering::SeqCst) && !task.is_finished(),
            None => false,
        }
    }

    /// 已经启动过（包括已自行停止的）
    pub fn has_started(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for VisibilityPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
