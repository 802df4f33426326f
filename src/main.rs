// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/main.rs - 火焰烟雾检测主程序
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  fs::OpenOptions,
  path::{Path, PathBuf},
  sync::Mutex,
  time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use fengyan::{
  FromUrl,
  alert::{
    AlertDispatcher, AlertWorker, DiscordBot, DiscordBotConfig, DiscordWebhook, Transport,
  },
  input::InputWrapper,
  model::{FireSmokeLabel, YoloBuilder},
  output::{Draw, OutputWrapper},
  task::{DetectionTask, Task, install_interrupt_handler},
};

const ALERT_QUEUE_SIZE: usize = 8;
const BOT_CONNECT_WAIT: Duration = Duration::from_secs(10);

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum TransportKind {
  /// 只记录日志
  None,
  /// Discord Webhook
  Webhook,
  /// Discord Bot
  Bot,
}

/// Fengyan 火焰烟雾检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// ONNX 模型文件路径
  #[arg(long, value_name = "FILE")]
  model: PathBuf,
  /// 置信度阈值
  #[arg(long, default_value_t = 0.25, value_name = "THRESHOLD")]
  conf: f32,
  /// NMS IoU 阈值
  #[arg(long, default_value_t = 0.45, value_name = "THRESHOLD")]
  iou: f32,
  /// 模型输入尺寸
  #[arg(long, default_value_t = 640, value_name = "PIXELS")]
  imgsz: u32,

  /// 摄像头编号（/dev/videoN）
  #[arg(long, default_value_t = 0, value_name = "INDEX")]
  camera: u32,
  /// 视频文件，指定后不再使用摄像头
  #[arg(long, value_name = "FILE", conflicts_with = "input")]
  video: Option<PathBuf>,
  /// 输入 URL，例如 gst://camera/dev/video0?width=640&height=480 或 image:///a.jpg
  #[arg(long, value_name = "URL")]
  input: Option<Url>,

  /// 保存标注结果
  #[arg(long)]
  save: bool,
  /// 输出路径，图片扩展名（jpg/png 等）保存单张图片，否则保存视频
  #[arg(long, default_value = "output.mp4", value_name = "FILE")]
  output: PathBuf,
  /// 输出视频帧率
  #[arg(long, default_value_t = 20, value_name = "FPS")]
  fps: i32,
  /// 在窗口中显示
  #[arg(long)]
  display: bool,
  /// 标签字体（TTF），不指定则只画框
  #[arg(long, value_name = "FILE")]
  font: Option<PathBuf>,

  /// 报警通道
  #[arg(long, value_enum, default_value_t = TransportKind::None)]
  transport: TransportKind,
  /// Discord Bot 令牌
  #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
  discord_token: Option<String>,
  /// Discord 频道 ID
  #[arg(long, env = "DISCORD_CHANNEL_ID")]
  discord_channel: Option<String>,
  /// Discord Webhook URL
  #[arg(long, env = "DISCORD_WEBHOOK_URL", hide_env_values = true)]
  webhook_url: Option<String>,
  /// 两次报警之间的冷却时间（秒）
  #[arg(long, default_value_t = 300, value_name = "SECONDS")]
  cooldown: u64,
  /// 单次发送超时（秒）
  #[arg(long, default_value_t = 30, value_name = "SECONDS")]
  send_timeout: u64,
  /// 两次推理之间的间隔（秒），0 表示每帧推理
  #[arg(long, default_value = "0", value_name = "SECONDS", value_parser = parse_seconds)]
  detect_interval: Duration,
  /// 快照目录
  #[arg(long, default_value = ".", value_name = "DIR")]
  snapshot_dir: PathBuf,

  /// 最多处理的帧数
  #[arg(long, value_name = "COUNT")]
  max_frames: Option<u64>,
  /// 日志文件，不指定则输出到终端
  #[arg(long, value_name = "FILE")]
  log_file: Option<PathBuf>,
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
  let secs: f64 = value.parse().map_err(|e| format!("{}", e))?;
  Duration::try_from_secs_f64(secs).map_err(|e| format!("{}", e))
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let builder = tracing_subscriber::fmt().with_env_filter(filter);
  match log_file {
    Some(path) => {
      let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("无法打开日志文件 {}", path.display()))?;
      builder
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    }
    None => builder.init(),
  }
  Ok(())
}

fn open_input(args: &Args) -> Result<InputWrapper> {
  let input = match (&args.input, &args.video) {
    (Some(url), _) => InputWrapper::from_url(url),
    (None, Some(video)) => InputWrapper::file(video),
    (None, None) => InputWrapper::camera(args.camera),
  };
  input.context("无法打开输入源")
}

fn build_outputs(args: &Args, draw: &Draw) -> Result<Vec<OutputWrapper>> {
  let mut outputs = Vec::new();
  if !args.save && !args.display {
    return Ok(outputs);
  }

  #[cfg(feature = "save_image_file")]
  if args.save && fengyan::output::SaveImageFileOutput::supports_path(&args.output) {
    use fengyan::output::SaveImageFileOutput;

    info!("保存图片到: {}", args.output.display());
    let output = SaveImageFileOutput::new(&args.output).with_draw(draw.clone());
    outputs.push(OutputWrapper::SaveImageFileOutput(output));
    if !args.display {
      return Ok(outputs);
    }
  }

  #[cfg(feature = "gstreamer_output")]
  {
    use fengyan::output::GStreamerVideoOutput;

    if args.save && outputs.is_empty() {
      info!("保存视频到: {}", args.output.display());
      let output = GStreamerVideoOutput::file(&args.output, args.fps).with_draw(draw.clone());
      outputs.push(OutputWrapper::GStreamerVideoOutput(output));
    }
    if args.display {
      let output = GStreamerVideoOutput::display().with_draw(draw.clone());
      outputs.push(OutputWrapper::GStreamerVideoOutput(output));
    }
    Ok(outputs)
  }
  #[cfg(not(feature = "gstreamer_output"))]
  {
    let _ = draw;
    bail!("--save / --display 需要 gstreamer_output 特性")
  }
}

fn build_alerts(args: &Args) -> Result<Option<AlertWorker>> {
  let send_timeout = Duration::from_secs(args.send_timeout);
  let transport: Box<dyn Transport> = match args.transport {
    TransportKind::None => {
      info!("未配置报警通道，只记录检测结果");
      return Ok(None);
    }
    TransportKind::Webhook => {
      let Some(url) = &args.webhook_url else {
        bail!("--transport webhook 需要 --webhook-url 或 DISCORD_WEBHOOK_URL");
      };
      Box::new(DiscordWebhook::new(url.clone(), send_timeout)?)
    }
    TransportKind::Bot => {
      let (Some(token), Some(channel)) = (&args.discord_token, &args.discord_channel) else {
        bail!(
          "--transport bot 需要 --discord-token/DISCORD_TOKEN 和 --discord-channel/DISCORD_CHANNEL_ID"
        );
      };
      let config = DiscordBotConfig {
        send_timeout,
        ..DiscordBotConfig::new(token.clone(), channel.clone())
      };
      let bot = DiscordBot::start(config).context("无法启动 Discord Bot")?;
      if !bot.wait_until_connected(BOT_CONNECT_WAIT) {
        warn!("Discord Bot 尚未连接，连接前的报警会失败");
      }
      Box::new(bot)
    }
  };

  info!(
    "报警通道: {}，冷却 {} 秒",
    transport.name(),
    args.cooldown
  );
  let dispatcher = AlertDispatcher::new(transport, Duration::from_secs(args.cooldown));
  let worker = AlertWorker::spawn(dispatcher, ALERT_QUEUE_SIZE).context("无法启动报警线程")?;
  Ok(Some(worker))
}

fn main() -> Result<()> {
  let args = Args::parse();
  init_logging(args.log_file.as_deref())?;

  info!("Fengyan 火焰烟雾检测");
  info!("模型文件路径: {}", args.model.display());
  info!("置信度阈值: {}，IoU 阈值: {}", args.conf, args.iou);

  let model = YoloBuilder::new(&args.model)
    .input_size(args.imgsz)
    .confidence(args.conf)
    .iou(args.iou)
    .build::<FireSmokeLabel>()
    .context("加载模型失败")?;

  let draw = match &args.font {
    Some(font) => Draw::with_font_file(font)?,
    None => Draw::default(),
  };

  let input = open_input(&args)?;
  let outputs = build_outputs(&args, &draw)?;
  let alerts = build_alerts(&args)?;
  let stop = install_interrupt_handler().context("无法设置 Ctrl-C 处理")?;

  let mut task = DetectionTask::default()
    .with_max_frames(args.max_frames)
    .with_detect_interval(args.detect_interval)
    .with_snapshot_dir(&args.snapshot_dir)
    .with_draw(draw)
    .with_stop_signal(stop);
  if let Some(alerts) = alerts {
    task = task.with_alerts(alerts);
  }

  let report = task.run_task(input.into_frames(), model, outputs)?;
  if let Some(stats) = report.alert_stats {
    info!(
      "报警: 发送 {}，冷却跳过 {}，失败 {}，丢弃 {}",
      stats.sent, stats.suppressed, stats.failed, stats.dropped
    );
  }

  Ok(())
}
