//! 展示界面接口
//!
//! 界面本身（布局、图片、按钮）由宿主实现；这里只定义协调器与界面之间的边界：
//! - 界面可见时向协调器注册，不可见时注销
//! - 协调器通过 [`PresentationSurface::present`] 触发展示
//! - 界面关闭时通过 [`PresentationRequest::conclude`] 回报结果

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::model::{LoadedBlast, MediaBundle, NotificationDefinition, Outcome};

/// 界面角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SurfaceRole {
    /// 宿主应用自己的页面
    #[default]
    Host,
    /// 用于展示通知的页面本身
    Blast,
}

/// 可承载通知的可见界面
pub trait PresentationSurface: Send + Sync {
    /// 日志中使用的名字
    fn name(&self) -> &str;

    fn role(&self) -> SurfaceRole {
        SurfaceRole::Host
    }

    /// 立即展示；实现不应阻塞
    fn present(&self, request: PresentationRequest);
}

/// 结果回报入口，由协调器实现
pub trait OutcomeSink: Send + Sync {
    /// 返回 `false` 表示本次回报被丢弃（重复或周期已结束）
    fn on_presentation_outcome(&self, outcome: Outcome, before_visible: Duration, visible_to_outcome: Duration) -> bool;
}

/// 一次展示请求
#[derive(Clone)]
pub struct PresentationRequest {
    cycle: u64,
    blast: Arc<LoadedBlast>,
    sink: Weak<dyn OutcomeSink>,
}

impl PresentationRequest {
    pub fn new(cycle: u64, blast: Arc<LoadedBlast>, sink: Weak<dyn OutcomeSink>) -> Self {
        Self { cycle, blast, sink }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn definition(&self) -> &NotificationDefinition {
        &self.blast.definition
    }

    pub fn media(&self) -> &MediaBundle {
        &self.blast.media
    }

    /// 定义加载完成的时刻
    pub fn loaded_at(&self) -> Instant {
        self.blast.loaded_at
    }

    /// 计算 t1/t2 并回报结果。
    ///
    /// `visible_at` 是界面真正可见的时刻；协调器已被销毁时返回 `false`
    pub fn conclude(&self, outcome: Outcome, visible_at: Instant) -> bool {
        let before_visible = visible_at.saturating_duration_since(self.blast.loaded_at);
        let visible_to_outcome = Instant::now().saturating_duration_since(visible_at);
        self.report(outcome, before_visible, visible_to_outcome)
    }

    /// 直接回报已测量好的时长
    pub fn report(&self, outcome: Outcome, before_visible: Duration, visible_to_outcome: Duration) -> bool {
        match self.sink.upgrade() {
            Some(sink) => sink.on_presentation_outcome(outcome, before_visible, visible_to_outcome),
            None => false,
        }
    }
}

impl std::fmt::Debug for PresentationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentationRequest")
            .field("cycle", &self.cycle)
            .field("notification_id", &self.blast.definition.id)
            .field("media", &self.blast.media.present_count())
            .finish()
    }
}

/// 通知结束后转发给宿主应用的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlastAction {
    /// 用户点击 CTA，附带 CTA URL
    Accepted { cta_url: String },
    /// 用户关闭
    Dismissed,
}

/// 宿主应用可选实现的动作监听器
pub trait BlastActionListener: Send + Sync {
    fn on_blast_action(&self, action: BlastAction);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaBundle;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<(Outcome, Duration, Duration)>>,
    }

    impl OutcomeSink for RecordingSink {
        fn on_presentation_outcome(&self, outcome: Outcome, t1: Duration, t2: Duration) -> bool {
            self.calls.lock().unwrap().push((outcome, t1, t2));
            true
        }
    }

    fn blast() -> Arc<LoadedBlast> {
        Arc::new(LoadedBlast::new(
            NotificationDefinition {
                id: "n-1".to_string(),
                title: String::new(),
                body: String::new(),
                cta_label: String::new(),
                cta_url: "https://x".to_string(),
                cta_color: Default::default(),
                cta_color_highlighted: Default::default(),
                kind: None,
                media: [None, None, None],
            },
            MediaBundle::new(),
        ))
    }

    #[test]
    fn test_report_reaches_sink() {
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn OutcomeSink> = Arc::downgrade(&(sink.clone() as Arc<dyn OutcomeSink>));
        let request = PresentationRequest::new(3, blast(), weak);

        assert_eq!(request.cycle(), 3);
        assert_eq!(request.definition().id, "n-1");
        assert!(request.report(Outcome::Dismiss, Duration::from_millis(10), Duration::from_millis(3000)));

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (Outcome::Dismiss, Duration::from_millis(10), Duration::from_millis(3000)));
    }

    #[test]
    fn test_conclude_computes_durations() {
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn OutcomeSink> = Arc::downgrade(&(sink.clone() as Arc<dyn OutcomeSink>));
        let request = PresentationRequest::new(1, blast(), weak);

        let visible_at = Instant::now();
        assert!(request.conclude(Outcome::Accept, visible_at));

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls[0].0, Outcome::Accept);
        assert!(calls[0].1 <= visible_at.duration_since(request.loaded_at()));
    }

    #[test]
    fn test_report_after_sink_dropped() {
        let sink: Arc<dyn OutcomeSink> = Arc::new(RecordingSink::default());
        let request = PresentationRequest::new(1, blast(), Arc::downgrade(&sink));
        drop(sink);
        assert!(!request.report(Outcome::Dismiss, Duration::ZERO, Duration::ZERO));
    }

    #[test]
    fn test_default_role_is_host() {
        struct Plain;
        impl PresentationSurface for Plain {
            fn name(&self) -> &str {
                "plain"
            }
            fn present(&self, _request: PresentationRequest) {}
        }
        assert_eq!(Plain.role(), SurfaceRole::Host);
    }
}
