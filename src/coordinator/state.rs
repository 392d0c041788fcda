//! 协调器的可变状态（一个 blast 周期内有效）

use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

use crate::model::LoadedBlast;
use crate::poller::VisibilityPoller;
use crate::surface::PresentationSurface;

/// 周期阶段
///
/// `READY_TO_PRESENT` 和 `CONCLUDED` 是瞬时状态，在锁内一步完成，不单独存储。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// 没有活动周期
    Idle,
    /// 拉取中，或数据已就绪但在等界面
    AwaitingSurfaceOrData,
    /// 已展示，等待结果回报
    Presented,
}

/// 轮询器观察到的后台状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackgroundObservation {
    #[default]
    None,
    BackgroundLike,
}

/// 已展示、尚未回报结果的通知
#[derive(Debug, Clone)]
pub(crate) struct ActiveBlast {
    pub cycle: u64,
    pub blast: Arc<LoadedBlast>,
    pub user_id: Option<String>,
}

/// 协调器唯一的共享可变状态
pub(crate) struct DeliveryState {
    pub phase: Phase,
    /// 当前周期号；旧周期的拉取结果按周期号丢弃
    pub cycle: u64,
    pub fetch_task: Option<JoinHandle<()>>,
    pub fetch_user: Option<String>,

    /// 会合标志之一：数据已就绪
    pub data_ready: bool,
    pub pending: Option<Arc<LoadedBlast>>,
    /// 已展示的定义，结果回报时清空
    pub active: Option<ActiveBlast>,

    /// 当前界面（不持有所有权）
    pub surface: Option<Weak<dyn PresentationSurface>>,
    /// 会合标志之二：界面注册后置位，触发展示时清除
    pub surface_armed: bool,

    pub background: BackgroundObservation,
    pub poller: Option<VisibilityPoller>,
    pub poller_seq: u64,

    pub shut_down: bool,
}

impl DeliveryState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            cycle: 0,
            fetch_task: None,
            fetch_user: None,
            data_ready: false,
            pending: None,
            active: None,
            surface: None,
            surface_armed: false,
            background: BackgroundObservation::None,
            poller: None,
            poller_seq: 0,
            shut_down: false,
        }
    }

    /// 取得仍然存活的界面
    pub fn live_surface(&self) -> Option<Arc<dyn PresentationSurface>> {
        self.surface.as_ref().and_then(Weak::upgrade)
    }

    pub fn poller_running(&self) -> bool {
        self.poller.as_ref().map(|p| p.is_running()).unwrap_or(false)
    }

    pub fn stop_poller(&mut self) {
        if let Some(mut poller) = self.poller.take() {
            poller.stop();
        }
    }

    /// 取消正在进行的拉取（只影响未完成的任务）
    pub fn cancel_fetch(&mut self) {
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }
    }

    /// 丢弃未展示的数据并回到 Idle；已展示的周期不受影响
    pub fn abandon_pending(&mut self) {
        self.cancel_fetch();
        self.data_ready = false;
        self.pending = None;
        self.fetch_user = None;
        if self.phase == Phase::AwaitingSurfaceOrData {
            self.phase = Phase::Idle;
        }
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            phase: self.phase,
            cycle: self.cycle,
            data_ready: self.data_ready,
            has_surface: self.live_surface().is_some(),
            poller_running: self.poller_running(),
            background: self.background,
            active_notification: self.active.as_ref().map(|a| a.blast.definition.id.clone()),
        }
    }
}

/// 对外暴露的只读状态快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    pub phase: Phase,
    pub cycle: u64,
    pub data_ready: bool,
    pub has_surface: bool,
    pub poller_running: bool,
    pub background: BackgroundObservation,
    pub active_notification: Option<String>,
}
