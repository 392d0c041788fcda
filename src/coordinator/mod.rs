//! 投放协调器 - 数据就绪与界面可见两路信号的会合点
//!
//! # 状态
//! 主周期：`Idle` → `AwaitingSurfaceOrData` → (`READY_TO_PRESENT`) → `Presented` → (`CONCLUDED`) → `Idle`
//!
//! 正交状态：有/无界面，决定可见性轮询器的启停。
//!
//! # 会合规则
//! 数据就绪标志和界面标志都为真时展示，且展示的瞬间两个标志同时清除；
//! 谁后到谁触发。所有状态变更都在同一把锁内完成，外部回调（展示、监听器）
//! 在释放锁之后执行。
//!
//! # 过期数据
//! 轮询器观察到进程进入后台后，宿主界面重新注册时丢弃未展示的数据并重新拉取；
//! 通知自己的界面（[`SurfaceRole::Blast`]）重新注册不触发重新拉取。

pub mod state;

pub use state::{BackgroundObservation, CoordinatorSnapshot, Phase};

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BlastSettings;
use crate::error::BlastError;
use crate::fetcher::{ConfigFetcher, FetchEvent};
use crate::identity::UserIdSource;
use crate::model::{LoadedBlast, Outcome};
use crate::poller::{PollTiming, VisibilityPoller, VisibilityProbe};
use crate::remote::RemoteClient;
use crate::surface::{
    BlastAction, BlastActionListener, OutcomeSink, PresentationRequest, PresentationSurface,
    SurfaceRole,
};
use crate::telemetry::{TelemetryRecord, TelemetryReporter};
use state::{ActiveBlast, DeliveryState};

/// 协调器依赖的外部协作者
#[derive(Clone)]
pub struct Collaborators {
    pub client: Arc<dyn RemoteClient>,
    pub probe: Arc<dyn VisibilityProbe>,
    pub users: Arc<dyn UserIdSource>,
}

/// 锁外执行的副作用
enum Effect {
    Present(Arc<dyn PresentationSurface>, PresentationRequest),
    Notify(Arc<dyn BlastActionListener>, BlastAction),
}

struct Inner {
    project_key: String,
    timing: PollTiming,
    runtime: Handle,
    fetcher: ConfigFetcher,
    telemetry: TelemetryReporter,
    probe: Arc<dyn VisibilityProbe>,
    users: Arc<dyn UserIdSource>,
    listener: Mutex<Option<Arc<dyn BlastActionListener>>>,
    state: Mutex<DeliveryState>,
    /// 指向自身，供后台任务回调使用，不延长生命周期
    this: Weak<Inner>,
}

/// 投放协调器，可廉价 clone
#[derive(Clone)]
pub struct DeliveryCoordinator {
    inner: Arc<Inner>,
}

impl DeliveryCoordinator {
    /// 创建协调器；必须在 tokio runtime 内调用
    pub fn new(settings: &BlastSettings, collaborators: Collaborators) -> Result<Self, BlastError> {
        settings.validate()?;
        let runtime = Handle::try_current().map_err(|_| BlastError::NoRuntime)?;

        let Collaborators { client, probe, users } = collaborators;
        let fetcher = ConfigFetcher::new(Arc::clone(&client), settings.api_base.clone());
        let telemetry = TelemetryReporter::new(client, settings.mark_url(), settings.project_key.clone());
        let timing = PollTiming {
            initial_delay: settings.poll_initial_delay,
            interval: settings.poll_interval,
        };
        let project_key = settings.project_key.clone();

        let inner = Arc::new_cyclic(|this| Inner {
            project_key,
            timing,
            runtime,
            fetcher,
            telemetry,
            probe,
            users,
            listener: Mutex::new(None),
            state: Mutex::new(DeliveryState::new()),
            this: this.clone(),
        });

        Ok(Self { inner })
    }

    /// 设置宿主应用的动作监听器
    pub fn set_listener(&self, listener: Option<Arc<dyn BlastActionListener>>) {
        *self.inner.listener.lock().unwrap_or_else(|e| e.into_inner()) = listener;
    }

    /// 开始一个新的拉取周期。
    ///
    /// 已有活动周期、没有 user id 或已关闭时返回 `false`
    pub fn begin_cycle(&self) -> bool {
        let user_id = self.inner.users.user_id();
        let mut state = self.inner.lock();
        self.inner.begin_cycle_locked(&mut state, user_id)
    }

    /// 丢弃尚未展示的数据，按当前 user id 重新开始拉取。
    ///
    /// 已有通知在展示时保持不变并返回 `false`
    pub fn restart_cycle(&self) -> bool {
        let user_id = self.inner.users.user_id();
        let mut state = self.inner.lock();
        if state.shut_down {
            return false;
        }
        match state.phase {
            Phase::Presented => {
                debug!(cycle = state.cycle, "Notification on screen, keeping current cycle");
                return false;
            }
            Phase::AwaitingSurfaceOrData => {
                info!(cycle = state.cycle, "Abandoning pending cycle");
                state.abandon_pending();
            }
            Phase::Idle => {}
        }
        self.inner.begin_cycle_locked(&mut state, user_id)
    }

    /// 宿主可见界面变化时调用；`None` 表示当前没有可见界面
    pub fn register_surface(&self, surface: Option<&Arc<dyn PresentationSurface>>) {
        // 重新拉取时才用得到，但不能在持锁时读取
        let user_id = surface.and_then(|_| self.inner.users.user_id());
        let effects = {
            let mut state = self.inner.lock();
            if state.shut_down {
                return;
            }
            match surface {
                Some(surface) => self.inner.attach_surface(&mut state, surface, user_id),
                None => {
                    self.inner.detach_surface(&mut state);
                    Vec::new()
                }
            }
        };
        self.inner.run(effects);
    }

    /// 数据就绪（直接注入，不经过拉取器）。已有通知在展示时忽略并返回 `false`
    pub fn on_data_ready(&self, blast: LoadedBlast) -> bool {
        let user_id = self.inner.users.user_id();
        let effects = {
            let mut state = self.inner.lock();
            if state.shut_down {
                return false;
            }
            match state.phase {
                Phase::Presented => {
                    warn!(
                        notification_id = %blast.definition.id,
                        "A notification is already on screen, ignoring new data"
                    );
                    return false;
                }
                Phase::Idle => {}
                Phase::AwaitingSurfaceOrData => {
                    // 注入的数据取代正在进行的拉取；周期号也要前进，
                    // 已越过最后一个 await 的拉取结果会被 deliver 丢弃
                    state.cancel_fetch();
                }
            }
            self.inner.open_cycle(&mut state);
            state.fetch_user = user_id;
            self.inner.mark_data_ready(&mut state, blast)
        };
        self.inner.run(effects);
        true
    }

    /// 拉取失败：终止当前周期，不展示
    pub fn on_load_error(&self) {
        let mut state = self.inner.lock();
        self.inner.abort_cycle(&mut state);
    }

    /// 界面关闭时回报结果。同一周期的重复回报是空操作，返回 `false`
    pub fn on_presentation_outcome(
        &self,
        outcome: Outcome,
        before_visible: Duration,
        visible_to_outcome: Duration,
    ) -> bool {
        self.inner
            .conclude_presentation(outcome, before_visible, visible_to_outcome)
    }

    /// 当前状态快照
    pub fn snapshot(&self) -> CoordinatorSnapshot {
        self.inner.lock().snapshot()
    }

    /// 关闭：停止轮询、取消拉取、丢弃所有状态。之后的调用都是空操作
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        state.stop_poller();
        state.abandon_pending();
        state.active = None;
        state.surface = None;
        state.surface_armed = false;
        state.phase = Phase::Idle;
        info!("Delivery coordinator shut down");
    }

    pub fn project_key(&self) -> &str {
        &self.inner.project_key
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, DeliveryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Present(surface, request) => {
                    info!(
                        surface = surface.name(),
                        cycle = request.cycle(),
                        notification_id = %request.definition().id,
                        "Presenting notification"
                    );
                    surface.present(request);
                }
                Effect::Notify(listener, action) => listener.on_blast_action(action),
            }
        }
    }

    fn begin_cycle_locked(&self, state: &mut DeliveryState, user_id: Option<String>) -> bool {
        if state.shut_down {
            return false;
        }
        if state.phase != Phase::Idle {
            debug!(cycle = state.cycle, phase = ?state.phase, "Cycle already active, ignoring fetch request");
            return false;
        }
        let Some(user_id) = user_id.filter(|id| !id.is_empty()) else {
            debug!("No user id, skipping notification fetch");
            return false;
        };

        let cycle = self.open_cycle(state);
        state.fetch_user = Some(user_id.clone());
        state.fetch_task = Some(self.spawn_fetch(cycle, user_id.clone()));

        info!(cycle, user_id = %user_id, "Notification fetch started");
        true
    }

    /// 打开新周期：周期号加一，后台观察只在本周期内有效。
    /// 没有可见界面时启动轮询器
    fn open_cycle(&self, state: &mut DeliveryState) -> u64 {
        state.cycle += 1;
        state.phase = Phase::AwaitingSurfaceOrData;
        state.data_ready = false;
        state.pending = None;
        state.background = BackgroundObservation::None;
        if state.live_surface().is_none() {
            self.ensure_poller(state);
        }
        state.cycle
    }

    fn spawn_fetch(&self, cycle: u64, user_id: String) -> JoinHandle<()> {
        let fetcher = self.fetcher.clone();
        let project_key = self.project_key.clone();
        let this = self.this.clone();
        self.runtime.spawn(async move {
            let event = fetcher.fetch(&user_id, &project_key).await;
            if let Some(inner) = this.upgrade() {
                inner.deliver(cycle, event);
            }
        })
    }

    /// 拉取任务完成后回到串行区
    fn deliver(&self, cycle: u64, event: FetchEvent) {
        let effects = {
            let mut state = self.lock();
            if state.shut_down || cycle != state.cycle || state.phase != Phase::AwaitingSurfaceOrData {
                debug!(cycle, current = state.cycle, "Dropping result of superseded fetch");
                return;
            }
            state.fetch_task = None;
            match event {
                FetchEvent::DataReady(blast) => self.mark_data_ready(&mut state, blast),
                FetchEvent::ErrorWhileLoading => {
                    self.abort_cycle(&mut state);
                    Vec::new()
                }
            }
        };
        self.run(effects);
    }

    fn mark_data_ready(&self, state: &mut DeliveryState, blast: LoadedBlast) -> Vec<Effect> {
        debug!(
            cycle = state.cycle,
            notification_id = %blast.definition.id,
            media = blast.media.present_count(),
            "Data ready"
        );
        state.pending = Some(Arc::new(blast));
        state.data_ready = true;
        self.try_rendezvous(state).into_iter().collect()
    }

    fn abort_cycle(&self, state: &mut DeliveryState) {
        if state.phase != Phase::AwaitingSurfaceOrData {
            return;
        }
        warn!(cycle = state.cycle, "Error while loading notification data, skipping presentation");
        state.abandon_pending();
    }

    /// 两个标志都满足时展示，并同时清除两个标志
    fn try_rendezvous(&self, state: &mut DeliveryState) -> Option<Effect> {
        if !state.data_ready || !state.surface_armed {
            return None;
        }
        let Some(surface) = state.live_surface() else {
            debug!("Registered surface is gone, holding data");
            state.surface = None;
            state.surface_armed = false;
            return None;
        };
        let blast = state.pending.take()?;

        state.data_ready = false;
        state.surface_armed = false;
        state.phase = Phase::Presented;
        state.stop_poller();
        state.active = Some(ActiveBlast {
            cycle: state.cycle,
            blast: Arc::clone(&blast),
            user_id: state.fetch_user.take(),
        });

        let sink: Weak<dyn OutcomeSink> = self.this.clone();
        let request = PresentationRequest::new(state.cycle, blast, sink);
        Some(Effect::Present(surface, request))
    }

    fn attach_surface(
        &self,
        state: &mut DeliveryState,
        surface: &Arc<dyn PresentationSurface>,
        user_id: Option<String>,
    ) -> Vec<Effect> {
        // 界面可见，不需要再轮询
        state.stop_poller();

        let returned_from_background = state.background == BackgroundObservation::BackgroundLike;
        state.background = BackgroundObservation::None;
        state.surface = Some(Arc::downgrade(surface));
        state.surface_armed = true;
        debug!(surface = surface.name(), role = ?surface.role(), "Surface registered");

        if returned_from_background && surface.role() != SurfaceRole::Blast {
            if state.phase == Phase::Presented {
                debug!("Process resumed while a notification is on screen, keeping it");
            } else {
                info!("Notification start initialized after process being in background");
                state.abandon_pending();
                self.begin_cycle_locked(state, user_id);
                return Vec::new();
            }
        }

        self.try_rendezvous(state).into_iter().collect()
    }

    fn detach_surface(&self, state: &mut DeliveryState) {
        state.surface = None;
        state.surface_armed = false;
        debug!("Surface unregistered");

        if state.background == BackgroundObservation::None {
            self.ensure_poller(state);
        }
    }

    /// 启动轮询器；上一个实例已自行停止时换一个新实例
    fn ensure_poller(&self, state: &mut DeliveryState) {
        if state.poller_running() {
            return;
        }
        state.stop_poller();
        state.poller_seq += 1;
        let id = state.poller_seq;

        let mut poller = VisibilityPoller::new(id, Arc::clone(&self.probe), self.timing, self.runtime.clone());
        let this = self.this.clone();
        poller.start(move || {
            if let Some(inner) = this.upgrade() {
                inner.on_background_detected(id);
            }
        });
        state.poller = Some(poller);
    }

    /// 轮询器的单次回调；不是当前轮询器发出的回调直接忽略
    fn on_background_detected(&self, poller_id: u64) {
        let mut state = self.lock();
        if state.poller.as_ref().map(VisibilityPoller::id) != Some(poller_id) {
            debug!(poller = poller_id, "Ignoring background report from stopped poller");
            return;
        }
        state.poller = None;
        state.background = BackgroundObservation::BackgroundLike;
        info!(cycle = state.cycle, "Process observed in background");
    }

    fn conclude_presentation(&self, outcome: Outcome, before_visible: Duration, visible_to_outcome: Duration) -> bool {
        let active = {
            let mut state = self.lock();
            let Some(active) = state.active.take() else {
                debug!(%outcome, "Outcome reported for a concluded cycle, ignoring");
                return false;
            };
            if state.phase == Phase::Presented {
                state.phase = Phase::Idle;
            }
            active
        };

        let definition = &active.blast.definition;
        info!(
            cycle = active.cycle,
            notification_id = %definition.id,
            %outcome,
            before_visible_ms = before_visible.as_millis() as u64,
            visible_ms = visible_to_outcome.as_millis() as u64,
            "Notification concluded"
        );

        match active.user_id.clone().or_else(|| self.users.user_id()) {
            Some(user_id) => {
                let record = TelemetryRecord {
                    user_id,
                    notification_id: definition.id.clone(),
                    before_visible,
                    visible_to_outcome,
                    outcome,
                };
                self.telemetry.submit_detached(record, &self.runtime);
            }
            None => debug!("No user id, skipping statistics upload"),
        }

        let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let effects = listener
            .map(|listener| {
                let action = match outcome {
                    Outcome::Accept => BlastAction::Accepted {
                        cta_url: definition.cta_url.clone(),
                    },
                    Outcome::Dismiss => BlastAction::Dismissed,
                };
                Effect::Notify(listener, action)
            })
            .into_iter()
            .collect();
        self.run(effects);
        true
    }
}

impl OutcomeSink for Inner {
    fn on_presentation_outcome(&self, outcome: Outcome, before_visible: Duration, visible_to_outcome: Duration) -> bool {
        self.conclude_presentation(outcome, before_visible, visible_to_outcome)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        state.stop_poller();
        state.cancel_fetch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::model::{MediaAsset, MediaBundle, NotificationDefinition};
    use crate::poller::{ManualVisibility, ProcessVisibility};
    use crate::remote::{ParsedPayload, RemoteRequest};
    use async_trait::async_trait;
    use serde_json::json;

    struct NoNetwork;

    #[async_trait]
    impl RemoteClient for NoNetwork {
        async fn request(&self, request: RemoteRequest) -> Result<ParsedPayload, TransportError> {
            Ok(ParsedPayload::new(json!({"target": request.target})))
        }

        async fn download(&self, target: &str) -> Result<MediaAsset, TransportError> {
            Err(TransportError::Status { target: target.to_string(), status: 404 })
        }
    }

    struct NoUser;

    impl UserIdSource for NoUser {
        fn user_id(&self) -> Option<String> {
            None
        }
    }

    #[derive(Default)]
    struct CountingSurface {
        presented: Mutex<Vec<PresentationRequest>>,
    }

    impl PresentationSurface for CountingSurface {
        fn name(&self) -> &str {
            "counting"
        }

        fn present(&self, request: PresentationRequest) {
            self.presented.lock().unwrap().push(request);
        }
    }

    fn coordinator() -> DeliveryCoordinator {
        DeliveryCoordinator::new(
            &BlastSettings::new("proj"),
            Collaborators {
                client: Arc::new(NoNetwork),
                probe: Arc::new(ManualVisibility::new(ProcessVisibility::Foreground)),
                users: Arc::new(NoUser),
            },
        )
        .unwrap()
    }

    fn blast(id: &str) -> LoadedBlast {
        LoadedBlast::new(
            NotificationDefinition {
                id: id.to_string(),
                title: "t".to_string(),
                body: "b".to_string(),
                cta_label: "go".to_string(),
                cta_url: "https://x".to_string(),
                cta_color: Default::default(),
                cta_color_highlighted: Default::default(),
                kind: None,
                media: [None, None, None],
            },
            MediaBundle::new(),
        )
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = DeliveryCoordinator::new(
            &BlastSettings::new("proj"),
            Collaborators {
                client: Arc::new(NoNetwork),
                probe: Arc::new(ManualVisibility::default()),
                users: Arc::new(NoUser),
            },
        );
        assert!(matches!(result, Err(BlastError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_settings() {
        let result = DeliveryCoordinator::new(
            &BlastSettings::default(),
            Collaborators {
                client: Arc::new(NoNetwork),
                probe: Arc::new(ManualVisibility::default()),
                users: Arc::new(NoUser),
            },
        );
        assert!(matches!(result, Err(BlastError::InvalidSettings(_))));
    }

    #[tokio::test]
    async fn test_begin_cycle_without_user_is_noop() {
        let coordinator = coordinator();
        assert!(!coordinator.begin_cycle());
        assert_eq!(coordinator.snapshot().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_surface_then_data_presents_once() {
        let coordinator = coordinator();
        let surface = Arc::new(CountingSurface::default());
        let dyn_surface: Arc<dyn PresentationSurface> = surface.clone();

        coordinator.register_surface(Some(&dyn_surface));
        assert!(surface.presented.lock().unwrap().is_empty());

        assert!(coordinator.on_data_ready(blast("n-1")));
        assert_eq!(surface.presented.lock().unwrap().len(), 1);

        let snap = coordinator.snapshot();
        assert_eq!(snap.phase, Phase::Presented);
        assert!(!snap.data_ready);
        assert_eq!(snap.active_notification.as_deref(), Some("n-1"));

        // 展示期间的新数据被忽略
        assert!(!coordinator.on_data_ready(blast("n-2")));
        assert_eq!(surface.presented.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_surface_is_not_kept_alive() {
        let coordinator = coordinator();
        let surface: Arc<dyn PresentationSurface> = Arc::new(CountingSurface::default());
        coordinator.register_surface(Some(&surface));

        let weak = Arc::downgrade(&surface);
        drop(surface);
        assert!(weak.upgrade().is_none());

        coordinator.on_data_ready(blast("n-1"));
        let snap = coordinator.snapshot();
        assert_eq!(snap.phase, Phase::AwaitingSurfaceOrData);
        assert!(snap.data_ready);
        assert!(!snap.has_surface);
    }

    #[tokio::test]
    async fn test_load_error_resets_to_idle() {
        let coordinator = coordinator();
        coordinator.on_data_ready(blast("n-1"));
        coordinator.on_load_error();
        let snap = coordinator.snapshot();
        assert_eq!(snap.phase, Phase::Idle);
        assert!(!snap.data_ready);
    }

    #[tokio::test]
    async fn test_shutdown_makes_calls_noop() {
        let coordinator = coordinator();
        let surface: Arc<dyn PresentationSurface> = Arc::new(CountingSurface::default());
        coordinator.shutdown();
        coordinator.register_surface(None);
        coordinator.register_surface(Some(&surface));
        assert!(!coordinator.on_data_ready(blast("n-1")));

        let snap = coordinator.snapshot();
        assert_eq!(snap.phase, Phase::Idle);
        assert!(!snap.poller_running);
        assert!(!snap.has_surface);
    }
}
