// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/task.rs - 检测任务
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
  path::{Path, PathBuf},
  sync::mpsc::{Receiver, channel},
  thread,
  time::{Duration, Instant},
};

use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::{
  alert::{AlertEvent, AlertKind, AlertWorker, DispatchStats, Snapshot},
  frame::Frame,
  model::{DetectResult, FireSmokeLabel, Model},
  output::{Draw, Render},
};

pub trait Task<I, M, O>: Sized {
  type Report;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Report, Self::Error>;
}

const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

/// 安装 Ctrl-C 处理：通知任务循环退出，30 秒内未退出则强制结束进程
pub fn install_interrupt_handler() -> Result<Receiver<()>, ctrlc::Error> {
  let (tx, rx) = channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
    thread::spawn(|| {
      thread::sleep(FORCE_EXIT_AFTER);
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;
  Ok(rx)
}

/// 每秒统计一次处理帧率
struct FpsMeter {
  window_start: Instant,
  frames: u32,
}

impl FpsMeter {
  fn new() -> Self {
    Self {
      window_start: Instant::now(),
      frames: 0,
    }
  }

  fn tick(&mut self) -> Option<f64> {
    self.frames += 1;
    let elapsed = self.window_start.elapsed();
    if elapsed < Duration::from_secs(1) {
      return None;
    }
    let fps = self.frames as f64 / elapsed.as_secs_f64();
    self.window_start = Instant::now();
    self.frames = 0;
    Some(fps)
  }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DetectionReport {
  pub frames: u64,
  pub inferences: u64,
  pub inference_errors: u64,
  pub detections: u64,
  pub alerts_submitted: u64,
  pub snapshot_errors: u64,
  pub alert_stats: Option<DispatchStats>,
}

/// 持续检测任务
///
/// 逐帧推理并渲染；检测到火焰或烟雾时写入快照并提交报警。
/// 推理失败只跳过该帧。
pub struct DetectionTask {
  max_frames: Option<u64>,
  detect_interval: Duration,
  snapshot_dir: PathBuf,
  draw: Draw,
  alerts: Option<AlertWorker>,
  stop: Option<Receiver<()>>,
}

impl Default for DetectionTask {
  fn default() -> Self {
    Self {
      max_frames: None,
      detect_interval: Duration::ZERO,
      snapshot_dir: PathBuf::from("."),
      draw: Draw::default(),
      alerts: None,
      stop: None,
    }
  }
}

impl DetectionTask {
  pub fn with_max_frames(mut self, max_frames: Option<u64>) -> Self {
    self.max_frames = max_frames;
    self
  }

  /// 两次推理之间的最短间隔，间隔内的帧沿用上一次结果
  pub fn with_detect_interval(mut self, interval: Duration) -> Self {
    self.detect_interval = interval;
    self
  }

  pub fn with_snapshot_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
    self.snapshot_dir = dir.as_ref().to_path_buf();
    self
  }

  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  pub fn with_alerts(mut self, alerts: AlertWorker) -> Self {
    self.alerts = Some(alerts);
    self
  }

  pub fn with_stop_signal(mut self, stop: Receiver<()>) -> Self {
    self.stop = Some(stop);
    self
  }

  fn should_stop(&self) -> bool {
    self.stop.as_ref().is_some_and(|rx| rx.try_recv().is_ok())
  }

  fn handle_detections(
    &mut self,
    frame: &Frame,
    result: &DetectResult<FireSmokeLabel>,
    report: &mut DetectionReport,
  ) {
    if result.is_empty() {
      return;
    }
    report.detections += result.len() as u64;
    for item in result.items.iter() {
      debug!(
        "帧 {}: {:?} {:.2} {:?}",
        frame.index, item.kind, item.score, item.bbox
      );
    }

    let Some(kind) = AlertKind::from_result(result) else {
      return;
    };
    warn!("帧 {}: {}", frame.index, kind.headline());

    let Some(alerts) = self.alerts.as_mut() else {
      return;
    };

    let created_at = Local::now();
    let instant = Instant::now();
    let annotated = self.draw.annotate(&frame.image, result);
    let snapshot = match Snapshot::write(&self.snapshot_dir, &annotated, created_at) {
      Ok(snapshot) => Some(snapshot),
      Err(e) => {
        error!("写入快照失败，报警不附带图片: {}", e);
        report.snapshot_errors += 1;
        None
      }
    };

    if let Some(event) = AlertEvent::from_detections(result, snapshot, created_at, instant)
      && alerts.submit(event)
    {
      report.alerts_submitted += 1;
    }
  }
}

impl<
  ME: std::fmt::Display,
  RE: std::fmt::Display,
  I: Iterator<Item = Frame>,
  M: Model<Input = Frame, Output = DetectResult<FireSmokeLabel>, Error = ME>,
  O: Render<Frame, DetectResult<FireSmokeLabel>, Error = RE>,
> Task<I, M, O> for DetectionTask
{
  type Report = DetectionReport;
  type Error = anyhow::Error;

  fn run_task(mut self, input: I, model: M, output: O) -> Result<Self::Report, Self::Error> {
    info!("开始检测任务...");
    let mut report = DetectionReport::default();
    let mut last_inference: Option<Instant> = None;
    let mut last_result = DetectResult::empty();
    let mut meter = FpsMeter::new();
    let mut fps = 0.0;

    for mut frame in input {
      report.frames += 1;
      let started = Instant::now();

      let due = last_inference.is_none_or(|t| t.elapsed() >= self.detect_interval);
      if due {
        last_inference = Some(started);
        match model.infer(&frame) {
          Ok(result) => {
            report.inferences += 1;
            self.handle_detections(&frame, &result, &mut report);
            last_result = result;
          }
          Err(e) => {
            warn!("帧 {} 推理失败，跳过: {}", frame.index, e);
            report.inference_errors += 1;
            last_result = DetectResult::empty();
          }
        }
      }
      let elapsed_infer = started.elapsed();

      if let Some(measured) = meter.tick() {
        fps = measured;
        info!("FPS: {:.1}", fps);
      }
      // 叠加信息不进入快照
      self.draw.draw_frame_stats(&mut frame.image, fps, started.elapsed());

      if let Err(e) = output.render_result(&frame, &last_result) {
        error!("帧 {} 渲染失败: {}", frame.index, e);
      }
      debug!(
        "帧 {} 完成，推理 {:.2?} / 总计 {:.2?}",
        frame.index,
        elapsed_infer,
        started.elapsed()
      );

      if self.max_frames.is_some_and(|n| report.frames >= n) {
        info!("达到指定帧数 {}, 退出任务循环", report.frames);
        break;
      }
      if self.should_stop() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    report.alert_stats = self.alerts.take().map(AlertWorker::shutdown);
    info!(
      "任务完成: {} 帧，推理 {} 次，检测 {} 个目标，提交报警 {} 次",
      report.frames, report.inferences, report.detections, report.alerts_submitted
    );
    Ok(report)
  }
}

const VIDEO_EXTENSIONS: [&str; 3] = ["mp4", "avi", "mov"];

/// 列出目录下的视频文件（mp4 / avi / mov），按文件名排序
pub fn video_files<P: AsRef<Path>>(dir: P) -> std::io::Result<Vec<PathBuf>> {
  let mut files = Vec::new();
  for entry in std::fs::read_dir(dir)? {
    let path = entry?.path();
    let is_video = path
      .extension()
      .and_then(|e| e.to_str())
      .is_some_and(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()));
    if path.is_file() && is_video {
      files.push(path);
    }
  }
  files.sort();
  Ok(files)
}

/// `<output_dir>/detected_<文件名>`
pub fn detected_output_path<P: AsRef<Path>>(output_dir: P, input: &Path) -> PathBuf {
  let name = input
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_default();
  output_dir.as_ref().join(format!("detected_{}", name))
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchReport {
  pub processed: Vec<PathBuf>,
  pub skipped: Vec<PathBuf>,
  /// 收到中断信号后提前结束
  pub interrupted: bool,
}

/// 批量视频任务：为目录中的每个视频生成标注后的视频
#[cfg(all(feature = "gstreamer_input", feature = "gstreamer_output"))]
#[derive(Default)]
pub struct BatchVideoTask {
  draw: Draw,
  stop: Option<Receiver<()>>,
  // 中断信号只发送一次，收到后一直保持
  stopped: std::cell::Cell<bool>,
}

#[cfg(all(feature = "gstreamer_input", feature = "gstreamer_output"))]
impl BatchVideoTask {
  const DEFAULT_FPS: f64 = 30.0;

  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  pub fn with_stop_signal(mut self, stop: Receiver<()>) -> Self {
    self.stop = Some(stop);
    self
  }

  fn should_stop(&self) -> bool {
    if !self.stopped.get() && self.stop.as_ref().is_some_and(|rx| rx.try_recv().is_ok()) {
      self.stopped.set(true);
    }
    self.stopped.get()
  }

  fn process_video<M, ME>(&self, video: &Path, model: &M, output_dir: &Path) -> anyhow::Result<u64>
  where
    ME: std::fmt::Display,
    M: Model<Input = Frame, Output = DetectResult<FireSmokeLabel>, Error = ME>,
  {
    use crate::{input::InputWrapper, output::GStreamerVideoOutput};

    let mut frames = InputWrapper::file(video)?.into_frames();
    let Some(first) = frames.next() else {
      anyhow::bail!("视频没有可读取的帧");
    };
    let fps = frames.fps().unwrap_or(Self::DEFAULT_FPS).round().max(1.0) as i32;

    let output_path = detected_output_path(output_dir, video);
    let output = GStreamerVideoOutput::file(&output_path, fps).with_draw(self.draw.clone());
    info!("处理 {} -> {} ({} fps)", video.display(), output_path.display(), fps);

    let mut count = 0u64;
    for frame in std::iter::once(first).chain(frames) {
      let result = model.infer(&frame).unwrap_or_else(|e| {
        warn!("帧 {} 推理失败，跳过: {}", frame.index, e);
        DetectResult::empty()
      });
      output.render_result(&frame, &result)?;
      count += 1;
      if count % 100 == 0 {
        info!("{}: 已处理 {} 帧", video.display(), count);
      }
      if self.should_stop() {
        warn!("中断信号接收，停止处理 {}", video.display());
        break;
      }
    }

    Ok(count)
  }
}

#[cfg(all(feature = "gstreamer_input", feature = "gstreamer_output"))]
impl<
  ME: std::fmt::Display,
  I: IntoIterator<Item = PathBuf>,
  M: Model<Input = Frame, Output = DetectResult<FireSmokeLabel>, Error = ME>,
> Task<I, M, PathBuf> for BatchVideoTask
{
  type Report = BatchReport;
  type Error = anyhow::Error;

  fn run_task(self, videos: I, model: M, output_dir: PathBuf) -> Result<Self::Report, Self::Error> {
    std::fs::create_dir_all(&output_dir)?;
    let mut report = BatchReport::default();

    for video in videos {
      if self.should_stop() {
        warn!("中断信号接收，停止批量任务");
        break;
      }
      match self.process_video(&video, &model, &output_dir) {
        Ok(count) => {
          info!("完成 {}，共 {} 帧", video.display(), count);
          report.processed.push(video);
        }
        Err(e) => {
          warn!("跳过无法处理的视频 {}: {:#}", video.display(), e);
          report.skipped.push(video);
        }
      }
    }

    report.interrupted = self.stopped.get();
    info!(
      "批量任务完成: 成功 {} 个，跳过 {} 个",
      report.processed.len(),
      report.skipped.len()
    );
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn lists_only_videos_sorted() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["b.MOV", "a.mp4", "notes.txt", "c.avi", "d.mkv"] {
      std::fs::write(dir.path().join(name), b"").unwrap();
    }
    std::fs::create_dir(dir.path().join("e.mp4")).unwrap();

    let names: Vec<_> = video_files(dir.path())
      .unwrap()
      .iter()
      .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
      .collect();
    assert_eq!(names, vec!["a.mp4", "b.MOV", "c.avi"]);
  }

  #[test]
  fn output_name_is_prefixed() {
    assert_eq!(
      detected_output_path("output", Path::new("videos/clip.mp4")),
      PathBuf::from("output/detected_clip.mp4")
    );
  }

  #[cfg(all(feature = "gstreamer_input", feature = "gstreamer_output"))]
  #[test]
  fn batch_stops_before_the_next_video() {
    struct NoModel;
    impl Model for NoModel {
      type Input = Frame;
      type Output = DetectResult<FireSmokeLabel>;
      type Error = String;
      fn infer(&self, _: &Frame) -> Result<Self::Output, String> {
        Err("不应被调用".to_string())
      }
    }

    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = channel();
    tx.send(()).unwrap();
    let videos = vec![dir.path().join("a.mp4"), dir.path().join("b.mp4")];

    let report = BatchVideoTask::default()
      .with_stop_signal(rx)
      .run_task(videos, NoModel, dir.path().join("out"))
      .unwrap();

    assert!(report.interrupted);
    assert!(report.processed.is_empty());
    assert!(report.skipped.is_empty());
  }

  #[test]
  fn fps_meter_reports_after_a_second() {
    let mut meter = FpsMeter::new();
    assert!(meter.tick().is_none());
    meter.window_start -= Duration::from_secs(2);
    let fps = meter.tick().unwrap();
    assert!(fps > 0.5 && fps < 1.5);
    assert_eq!(meter.frames, 0);
  }
}
