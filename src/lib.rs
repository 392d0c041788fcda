//! App Blast - 应用内推广通知投放
//!
//! 拉取通知定义和图片，等到数据就绪且应用有可见界面时展示一次，
//! 然后回报用户动作和展示时长。

pub mod app;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod identity;
pub mod model;
pub mod poller;
pub mod remote;
pub mod surface;
pub mod telemetry;

pub use app::AppBlast;
pub use config::{BlastSettings, LogLevel};
pub use coordinator::{BackgroundObservation, Collaborators, CoordinatorSnapshot, DeliveryCoordinator, Phase};
pub use error::{BlastError, TransportError};
pub use fetcher::{ConfigFetcher, FetchEvent};
pub use identity::{DeviceInfo, UserDirectory, UserIdSource, UserStore};
pub use model::{Argb, LoadedBlast, MediaAsset, MediaBundle, MediaSlot, NotificationDefinition, Outcome};
pub use poller::{ManualVisibility, PollTiming, ProcessVisibility, VisibilityPoller, VisibilityProbe};
pub use remote::{HttpRemoteClient, Method, ParsedPayload, RemoteClient, RemoteRequest};
pub use surface::{BlastAction, BlastActionListener, OutcomeSink, PresentationRequest, PresentationSurface, SurfaceRole};
pub use telemetry::{TelemetryRecord, TelemetryReporter};
