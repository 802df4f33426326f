// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/bin/batch.rs - 批量视频检测
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

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use fengyan::{
  model::{FireSmokeLabel, YoloBuilder},
  output::Draw,
  task::{BatchVideoTask, Task, install_interrupt_handler, video_files},
};

/// 为目录中的每个视频生成标注后的 detected_<文件名>
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// ONNX 模型文件路径
  #[arg(long, value_name = "FILE")]
  model: PathBuf,
  /// 视频目录
  #[arg(long, default_value = "videos", value_name = "DIR")]
  input: PathBuf,
  /// 输出目录
  #[arg(long, default_value = "output", value_name = "DIR")]
  output: PathBuf,
  /// 置信度阈值
  #[arg(long, default_value_t = 0.5, value_name = "THRESHOLD")]
  conf: f32,
  /// 标签字体（TTF）
  #[arg(long, value_name = "FILE")]
  font: Option<PathBuf>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  info!("视频目录: {}", args.input.display());
  info!("输出目录: {}", args.output.display());

  let videos = video_files(&args.input)
    .with_context(|| format!("无法读取视频目录 {}", args.input.display()))?;
  if videos.is_empty() {
    warn!("{} 中没有视频文件", args.input.display());
    return Ok(());
  }
  info!("共 {} 个视频", videos.len());

  let model = YoloBuilder::new(&args.model)
    .confidence(args.conf)
    .build::<FireSmokeLabel>()
    .context("加载模型失败")?;

  let draw = match &args.font {
    Some(font) => Draw::with_font_file(font)?,
    None => Draw::default(),
  };

  let stop = install_interrupt_handler().context("无法设置 Ctrl-C 处理")?;
  let report = BatchVideoTask::default()
    .with_draw(draw)
    .with_stop_signal(stop)
    .run_task(videos, model, args.output)?;

  for skipped in &report.skipped {
    warn!("已跳过: {}", skipped.display());
  }
  Ok(())
}
