//! App Blast CLI
//!
//! 调试工具：拉取通知定义、管理本地 user id、模拟完整的投放流程

use anyhow::{bail, Result};
use app_blast::{
    AppBlast, BlastSettings, ConfigFetcher, DeviceInfo, FetchEvent, HttpRemoteClient, LogLevel,
    ManualVisibility, MediaSlot, Outcome, PresentationRequest, PresentationSurface, RemoteClient,
    UserDirectory, UserIdSource, UserStore,
};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "blast")]
#[command(about = "App Blast - 应用内推广通知投放调试工具")]
#[command(version)]
struct Cli {
    /// 项目 key（默认读取配置文件或 APP_BLAST_PROJECT_KEY）
    #[arg(long, global = true)]
    project_key: Option<String>,
    /// API 基础 URL
    #[arg(long, global = true)]
    api_base: Option<String>,
    /// 日志级别
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::All)]
    log_level: LogLevel,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 拉取一次通知定义和媒体
    Fetch {
        /// 用户 ID
        #[arg(long)]
        user: String,
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 向服务端注册 user id 并保存到本地
    SetUser {
        user_id: String,
    },
    /// 解除设备与用户的关联
    UnsetUser,
    /// 显示本地保存的 user id
    Whoami,
    /// 模拟完整投放：拉取 → 等界面 → 展示 → 回报
    Simulate {
        /// 用户 ID
        #[arg(long)]
        user: String,
        /// 界面注册前等待的毫秒数
        #[arg(long, default_value_t = 0)]
        surface_delay_ms: u64,
        /// 展示多久后用户操作
        #[arg(long, default_value_t = 3000)]
        dismiss_after_ms: u64,
        /// 模拟点击 CTA（默认为关闭）
        #[arg(long)]
        accept: bool,
        /// 最长等待秒数
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
}

/// 在终端打印通知并在延迟后自动回报结果
struct ConsoleSurface {
    dismiss_after: Duration,
    outcome: Outcome,
    done: mpsc::UnboundedSender<Outcome>,
}

impl PresentationSurface for ConsoleSurface {
    fn name(&self) -> &str {
        "console"
    }

    fn present(&self, request: PresentationRequest) {
        let definition = request.definition();
        println!("┌─ {} ─", definition.title);
        println!("│ {}", definition.body);
        println!("│ [{}] → {}", definition.cta_label, definition.cta_url);
        println!(
            "│ media: {}/{} slots, cta color {}",
            request.media().present_count(),
            MediaSlot::ALL.len(),
            definition.cta_color
        );
        println!("└─");

        let visible_at = Instant::now();
        let dismiss_after = self.dismiss_after;
        let outcome = self.outcome;
        let done = self.done.clone();
        tokio::spawn(async move {
            tokio::time::sleep(dismiss_after).await;
            request.conclude(outcome, visible_at);
            let _ = done.send(outcome);
        });
    }
}

fn settings_from(cli: &Cli) -> Result<BlastSettings> {
    let mut settings = BlastSettings::auto_load()?;
    if let Some(key) = &cli.project_key {
        settings.project_key = key.clone();
    }
    if let Some(base) = &cli.api_base {
        settings = settings.with_api_base(base.clone());
    }
    settings.validate()?;
    Ok(settings)
}

fn user_directory(settings: &BlastSettings) -> Result<UserDirectory> {
    let client: Arc<dyn RemoteClient> = Arc::new(HttpRemoteClient::new(settings.timeout_secs)?);
    let store = Arc::new(UserStore::new(&settings.data_dir));
    Ok(UserDirectory::new(client, store, DeviceInfo::detect(), settings))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 通过 RUST_LOG 环境变量覆盖日志级别
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.directive()));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    match &cli.command {
        Commands::Fetch { user, json } => {
            let settings = settings_from(&cli)?;
            let client: Arc<dyn RemoteClient> = Arc::new(HttpRemoteClient::new(settings.timeout_secs)?);
            let fetcher = ConfigFetcher::new(client, settings.api_base.clone());

            match fetcher.fetch(user, &settings.project_key).await {
                FetchEvent::DataReady(blast) => {
                    if *json {
                        let slots: Vec<_> = MediaSlot::ALL
                            .iter()
                            .map(|slot| {
                                serde_json::json!({
                                    "slot": slot,
                                    "url": blast.definition.media_url(*slot),
                                    "bytes": blast.media.get(*slot).map(|a| a.bytes.len()),
                                })
                            })
                            .collect();
                        let out = serde_json::json!({
                            "definition": blast.definition,
                            "media": slots,
                        });
                        println!("{}", serde_json::to_string_pretty(&out)?);
                    } else {
                        println!("通知: {} ({})", blast.definition.title, blast.definition.id);
                        println!("  内容: {}", blast.definition.body);
                        println!("  CTA: {} → {}", blast.definition.cta_label, blast.definition.cta_url);
                        for slot in MediaSlot::ALL {
                            let status = match (blast.definition.media_url(slot), blast.media.get(slot)) {
                                (None, _) => "无".to_string(),
                                (Some(_), Some(asset)) => format!("{} bytes", asset.bytes.len()),
                                (Some(_), None) => "加载失败".to_string(),
                            };
                            println!("  {}: {}", slot, status);
                        }
                    }
                }
                FetchEvent::ErrorWhileLoading => bail!("加载通知失败，详见日志"),
            }
        }
        Commands::SetUser { user_id } => {
            // 只注册，不启动协调器
            let directory = user_directory(&settings_from(&cli)?)?;
            if directory.store().user_id().as_deref() == Some(user_id.as_str()) {
                println!("user id 未变化: {}", user_id);
            } else if directory.set_user_id(user_id).await? {
                println!("✅ user id 已设置: {}", user_id);
            } else {
                bail!("user id 不能为空");
            }
        }
        Commands::UnsetUser => {
            let directory = user_directory(&settings_from(&cli)?)?;
            directory.remove_user_id().await?;
            println!("✅ user id 已删除");
        }
        Commands::Whoami => {
            let settings = BlastSettings::auto_load()?;
            match UserStore::new(&settings.data_dir).load()? {
                Some(record) => println!("{} (更新于 {})", record.user_id, record.updated_at),
                None => println!("未设置 user id"),
            }
        }
        Commands::Simulate {
            user,
            surface_delay_ms,
            dismiss_after_ms,
            accept,
            timeout_secs,
        } => {
            let data_dir = std::env::temp_dir().join(format!("app-blast-sim-{}", std::process::id()));
            let settings = settings_from(&cli)?.with_data_dir(&data_dir);
            UserStore::new(&data_dir).save(user)?;

            let client: Arc<dyn RemoteClient> = Arc::new(HttpRemoteClient::new(settings.timeout_secs)?);
            let blast = AppBlast::with_client(
                settings,
                client,
                Arc::new(ManualVisibility::default()),
                DeviceInfo::detect(),
            )?;

            let (tx, mut rx) = mpsc::unbounded_channel();
            let surface: Arc<dyn PresentationSurface> = Arc::new(ConsoleSurface {
                dismiss_after: Duration::from_millis(*dismiss_after_ms),
                outcome: if *accept { Outcome::Accept } else { Outcome::Dismiss },
                done: tx,
            });

            blast.register_surface(None);
            blast.refresh();
            tokio::time::sleep(Duration::from_millis(*surface_delay_ms)).await;
            blast.register_surface(Some(&surface));
            info!(snapshot = ?blast.coordinator().snapshot(), "Surface registered");

            match tokio::time::timeout(Duration::from_secs(*timeout_secs), rx.recv()).await {
                Ok(Some(outcome)) => {
                    println!("结果: {}", outcome);
                    // 给统计上报留出时间
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Ok(None) => warn!("Surface closed without outcome"),
                Err(_) => {
                    warn!(snapshot = ?blast.coordinator().snapshot(), "No notification presented before timeout");
                }
            }

            blast.shutdown();
            let _ = std::fs::remove_dir_all(&data_dir);
        }
    }

    Ok(())
}
