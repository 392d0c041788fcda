//! 数据模型 - 通知定义、媒体槽位和展示结果

use serde::Serialize;
use std::fmt;
use std::time::Instant;

use crate::error::TransportError;
use crate::remote::ParsedPayload;

/// 三个可选媒体位置，顺序与服务端字段一一对应
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSlot {
    /// 关闭按钮图标
    CloseIcon,
    /// 覆盖层图片
    Overlay,
    /// 背景图
    Background,
}

impl MediaSlot {
    pub const ALL: [MediaSlot; 3] = [MediaSlot::CloseIcon, MediaSlot::Overlay, MediaSlot::Background];

    pub fn index(self) -> usize {
        match self {
            MediaSlot::CloseIcon => 0,
            MediaSlot::Overlay => 1,
            MediaSlot::Background => 2,
        }
    }

    /// 在 `notification.variation` 下的字段名
    pub fn field(self) -> &'static str {
        match self {
            MediaSlot::CloseIcon => "close_image_url",
            MediaSlot::Overlay => "gradient_overlay_url",
            MediaSlot::Background => "image_url",
        }
    }
}

impl fmt::Display for MediaSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSlot::CloseIcon => write!(f, "close-icon"),
            MediaSlot::Overlay => write!(f, "overlay"),
            MediaSlot::Background => write!(f, "background"),
        }
    }
}

/// ARGB 颜色值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Argb(pub u32);

impl Argb {
    /// 解析 `RRGGBB` 或 `AARRGGBB`（可带 `#` 前缀）
    pub fn parse(hex: &str) -> Option<Self> {
        let hex = hex.trim().trim_start_matches('#');
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let value = u32::from_str_radix(hex, 16).ok()?;
        match hex.len() {
            6 => Some(Argb(0xFF00_0000 | value)),
            8 => Some(Argb(value)),
            _ => None,
        }
    }

    pub fn alpha(self) -> u8 {
        (self.0 >> 24) as u8
    }
}

impl fmt::Display for Argb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:08X}", self.0)
    }
}

const VARIATION: &str = "/notification/variation";

/// 服务端下发的通知定义，每个周期只拉取一次
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationDefinition {
    /// 非空的通知 ID
    pub id: String,
    pub title: String,
    pub body: String,
    pub cta_label: String,
    pub cta_url: String,
    pub cta_color: Argb,
    pub cta_color_highlighted: Argb,
    /// 服务端的 variation 类型，目前只做透传
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// 三个媒体 URL，按 [`MediaSlot::index`] 排列
    pub media: [Option<String>; 3],
}

impl NotificationDefinition {
    /// 从响应体构造；`notification._id` 缺失或为空时视为格式错误
    pub fn from_payload(payload: &ParsedPayload, target: &str) -> Result<Self, TransportError> {
        let id = payload
            .str_at("/notification/_id")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TransportError::Malformed {
                target: target.to_string(),
                reason: "missing notification._id".to_string(),
            })?
            .to_string();

        let text = |field: &str| -> String {
            payload
                .str_at(&format!("{}/{}", VARIATION, field))
                .unwrap_or_default()
                .to_string()
        };
        let color = |field: &str| -> Argb {
            payload
                .str_at(&format!("{}/{}", VARIATION, field))
                .and_then(Argb::parse)
                .unwrap_or_default()
        };
        let media = MediaSlot::ALL.map(|slot| {
            payload
                .str_at(&format!("{}/{}", VARIATION, slot.field()))
                .filter(|url| !url.trim().is_empty())
                .map(|url| url.to_string())
        });

        Ok(Self {
            id,
            title: text("title"),
            body: text("description"),
            cta_label: text("cta"),
            cta_url: text("cta_url"),
            cta_color: color("cta_color"),
            cta_color_highlighted: color("cta_color_highlighted"),
            kind: payload
                .str_at(&format!("{}/type", VARIATION))
                .map(|s| s.to_string()),
            media,
        })
    }

    pub fn media_url(&self, slot: MediaSlot) -> Option<&str> {
        self.media[slot.index()].as_deref()
    }
}

/// 下载好的图片资源（原始字节，解码由展示层负责）
#[derive(Clone, PartialEq)]
pub struct MediaAsset {
    pub source_url: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for MediaAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaAsset")
            .field("source_url", &self.source_url)
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// 与三个媒体 URL 下标对齐的资源集合
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaBundle {
    slots: [Option<MediaAsset>; 3],
}

impl MediaBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, slot: MediaSlot) -> Option<&MediaAsset> {
        self.slots[slot.index()].as_ref()
    }

    pub fn set(&mut self, slot: MediaSlot, asset: Option<MediaAsset>) {
        self.slots[slot.index()] = asset;
    }

    /// 实际拿到资源的槽位数
    pub fn present_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.present_count() == 0
    }
}

/// 数据就绪事件携带的内容：定义 + 媒体
#[derive(Debug, Clone)]
pub struct LoadedBlast {
    pub definition: NotificationDefinition,
    pub media: MediaBundle,
    /// 定义拉取完成的时刻，用于计算 t1
    pub loaded_at: Instant,
}

impl LoadedBlast {
    pub fn new(definition: NotificationDefinition, media: MediaBundle) -> Self {
        Self {
            definition,
            media,
            loaded_at: Instant::now(),
        }
    }
}

/// 用户对通知的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// 点击 CTA
    Accept,
    /// 关闭或返回
    Dismiss,
}

impl Outcome {
    /// 上报给服务端的动作码
    pub fn code(self) -> u8 {
        match self {
            Outcome::Accept => 1,
            Outcome::Dismiss => 0,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Accept => write!(f, "ACCEPT"),
            Outcome::Dismiss => write!(f, "DISMISS"),
        }
    }
}
