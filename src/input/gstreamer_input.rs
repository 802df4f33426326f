// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
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

//! # GStreamer 视频输入模块
//!
//! 本模块提供基于 GStreamer 的视频输入功能，支持：
//! - 摄像头捕获（V4L2）
//! - 视频文件读取
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! ## URL 格式
//!
//! - 摄像头: `gst://camera/dev/video0?width=640&height=480&fps=15&rotate=180`
//! - 视频文件: `gst://file/path/to/video.mp4`
//!
//! ## Pipeline Builder
//!
//! ```no_run
//! use fengyan::input::GStreamerInputPipelineBuilder;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let input = GStreamerInputPipelineBuilder::new()
//!     .camera("/dev/video0")
//!     .target_format("RGB")
//!     .build()?;
//! for frame in input.into_frames() {
//!     println!("帧 {}: {}x{}", frame.index, frame.width(), frame.height());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! 输出帧统一为 RGB；管道末端若为 BGR 会自动转换。

use std::{
  collections::HashMap,
  time::{Duration, Instant},
};

use crate::{FromUrl, FromUrlWithScheme, frame::Frame};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

const PULL_INTERVAL_MS: u64 = 100;
/// 超过该时长没有新帧视为输入中断
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
pub enum GStreamerInputError {
  /// URI scheme 不匹配（期望 "gst://"）
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 无法获取 appsink 元素
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  /// 无法转换元素为 appsink
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  /// 无法从 caps 获取视频信息
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  /// 不支持的视频格式
  #[error("Unsupported video format")]
  UnsupportedFormat,
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 管道中没有视频源
  #[error("Pipeline has no source")]
  MissingSource,
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

pub enum GStreamerInputBuilderItem {
  FileSource(String),
  CameraSource {
    camera: String,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
  },
  TargetFormat {
    format: String,
  },
  VideoFlip {
    method: u32,
  },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::FileSource(path) => {
        format!("filesrc location=\"{}\" ! decodebin", path)
      }
      GStreamerInputBuilderItem::CameraSource {
        camera,
        width,
        height,
        fps,
      } => {
        let mut caps = vec!["video/x-raw".to_string()];
        if let Some(width) = width {
          caps.push(format!("width={}", width));
        }
        if let Some(height) = height {
          caps.push(format!("height={}", height));
        }
        if let Some(fps) = fps {
          caps.push(format!("framerate={}/1", fps));
        }
        format!("v4l2src device={} ! {}", camera, caps.join(","))
      }
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
      GStreamerInputBuilderItem::VideoFlip { method } => {
        format!("videoflip method={}", method)
      }
    }
  }

  fn is_source(&self) -> bool {
    matches!(
      self,
      GStreamerInputBuilderItem::FileSource(_) | GStreamerInputBuilderItem::CameraSource { .. }
    )
  }

  fn is_live(&self) -> bool {
    matches!(self, GStreamerInputBuilderItem::CameraSource { .. })
  }
}

/// GStreamer 输入管道构建器
#[derive(Default)]
pub struct GStreamerInputPipelineBuilder {
  items: Vec<GStreamerInputBuilderItem>,
}

impl GStreamerInputPipelineBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// 摄像头源，分辨率和帧率由设备决定
  pub fn camera<S: Into<String>>(mut self, device: S) -> Self {
    self.items.push(GStreamerInputBuilderItem::CameraSource {
      camera: device.into(),
      width: None,
      height: None,
      fps: None,
    });
    self
  }

  pub fn file<S: Into<String>>(mut self, path: S) -> Self {
    self
      .items
      .push(GStreamerInputBuilderItem::FileSource(path.into()));
    self
  }

  pub fn target_format<S: Into<String>>(mut self, format: S) -> Self {
    self.items.push(GStreamerInputBuilderItem::TargetFormat {
      format: format.into(),
    });
    self
  }

  fn build_camera_pipeline(path: &str, query: &HashMap<String, String>) -> Self {
    let parse = |key: &str| query.get(key).and_then(|v| v.parse::<u32>().ok());

    let mut items = vec![GStreamerInputBuilderItem::CameraSource {
      camera: path.to_string(),
      width: parse("width"),
      height: parse("height"),
      fps: parse("fps"),
    }];

    if let Some(video_flip) = Self::video_flip(query.get("rotate").map(|s| s.as_ref())) {
      items.push(video_flip);
    }

    GStreamerInputPipelineBuilder { items }
  }

  fn build_file_pipeline(path: &str, query: &HashMap<String, String>) -> Self {
    let mut items = vec![GStreamerInputBuilderItem::FileSource(path.to_string())];

    if let Some(video_flip) = Self::video_flip(query.get("rotate").map(|s| s.as_ref())) {
      items.push(video_flip);
    }

    GStreamerInputPipelineBuilder { items }
  }

  fn video_flip(rotate: Option<&str>) -> Option<GStreamerInputBuilderItem> {
    let method = match rotate? {
      "90" => 1,
      "180" => 2,
      "270" => 3,
      _ => return None,
    };
    // videoflip 在颜色转换之前执行
    Some(GStreamerInputBuilderItem::VideoFlip { method })
  }

  /// 生成完整管道描述
  pub fn pipeline_description(&self) -> Result<String, GStreamerInputError> {
    if !self.items.iter().any(GStreamerInputBuilderItem::is_source) {
      return Err(GStreamerInputError::MissingSource);
    }

    let live = self.items.iter().any(GStreamerInputBuilderItem::is_live);
    let basic_pipeline = self
      .items
      .iter()
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");

    // 摄像头只保留最新帧；文件需要逐帧处理，不能丢帧
    let sink = if live {
      "appsink max-buffers=2 drop=true name=sink"
    } else {
      "appsink max-buffers=4 drop=false sync=false name=sink"
    };

    Ok(format!("{} ! {}", basic_pipeline, sink))
  }

  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    gst::init()?;

    let full_pipeline = self.pipeline_description()?;
    info!("GStreamer pipeline description: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    pipeline.set_state(gst::State::Playing)?;

    Ok(GStreamerInput { pipeline, appsink })
  }
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let mut builder = match url.host_str() {
      Some("camera") => Self::build_camera_pipeline(url.path(), &query),
      Some("file") => Self::build_file_pipeline(url.path(), &query),
      _ => {
        return Err(GStreamerInputError::SchemeMismatch);
      }
    };

    builder.items.push(GStreamerInputBuilderItem::TargetFormat {
      format: "RGB".to_string(),
    });

    Ok(builder)
  }
}

/// GStreamer 视频输入
///
/// 管理 GStreamer 管道和 appsink；丢弃时停止管道。
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl GStreamerInput {
  pub fn into_frames(self) -> GStreamerInputFrames {
    GStreamerInputFrames {
      inner: self,
      index: 0,
      fps: None,
      stall_timeout: DEFAULT_STALL_TIMEOUT,
    }
  }

  // 短间隔轮询，输入卡住时也能按时返回
  fn pull_sample(&self, stall_timeout: Duration) -> Option<gst::Sample> {
    let started = Instant::now();
    loop {
      if let Some(sample) = self
        .appsink
        .try_pull_sample(gst::ClockTime::from_mseconds(PULL_INTERVAL_MS))
      {
        return Some(sample);
      }
      if self.appsink.is_eos() {
        info!("输入流结束");
        return None;
      }
      if self.log_bus_error() {
        return None;
      }
      if started.elapsed() >= stall_timeout {
        error!("{:?} 内没有收到新帧，停止读取输入", stall_timeout);
        return None;
      }
    }
  }

  fn log_bus_error(&self) -> bool {
    let Some(bus) = self.pipeline.bus() else {
      return false;
    };
    if let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error])
      && let gst::MessageView::Error(err) = msg.view()
    {
      error!(
        "GStreamer 管道错误: {} ({:?})",
        err.error(),
        err.debug()
      );
      return true;
    }
    false
  }
}

/// 逐帧迭代器；流结束或出错时返回 `None`
pub struct GStreamerInputFrames {
  inner: GStreamerInput,
  index: u64,
  fps: Option<f64>,
  stall_timeout: Duration,
}

impl GStreamerInputFrames {
  /// 等待新帧的最长时间，默认 10 秒
  pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
    self.stall_timeout = timeout;
    self
  }

  /// 最近一帧 caps 中的帧率
  pub fn fps(&self) -> Option<f64> {
    self.fps
  }
}

impl Iterator for GStreamerInputFrames {
  type Item = Frame;

  fn next(&mut self) -> Option<Self::Item> {
    let sample = self.inner.pull_sample(self.stall_timeout)?;
    match convert_sample(&sample, self.index) {
      Ok((frame, fps)) => {
        self.index += 1;
        if fps.is_some() {
          self.fps = fps;
        }
        Some(frame)
      }
      Err(e) => {
        error!("Failed to fetch sample: {}", e);
        None
      }
    }
  }
}

fn convert_sample(
  sample: &gst::Sample,
  index: u64,
) -> Result<(Frame, Option<f64>), GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

  let bgr = match video_info.format() {
    gst_video::VideoFormat::Rgb => false,
    gst_video::VideoFormat::Bgr => true,
    _ => return Err(GStreamerInputError::UnsupportedFormat),
  };

  let stride = video_info.stride()[0] as usize;
  let timestamp_ms = buffer.pts().map(|pts| pts.mseconds()).unwrap_or(0);

  let map = buffer.map_readable().map_err(|e| {
    GStreamerInputError::PipelineError(format!("Failed to map buffer for reading: {}", e))
  })?;

  let frame = Frame::from_packed(
    map.as_slice(),
    video_info.width(),
    video_info.height(),
    stride,
    bgr,
    index,
    timestamp_ms,
  )
  .ok_or_else(|| GStreamerInputError::PipelineError("Buffer smaller than frame".to_string()))?;

  let fps = video_info.fps();
  let fps = (fps.numer() > 0 && fps.denom() > 0).then(|| fps.numer() as f64 / fps.denom() as f64);

  Ok((frame, fps))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn camera_url_builds_live_pipeline() {
    let url = Url::parse("gst://camera/dev/video2?width=640&height=480&fps=15&rotate=180").unwrap();
    let desc = GStreamerInputPipelineBuilder::from_url(&url)
      .unwrap()
      .pipeline_description()
      .unwrap();
    assert_eq!(
      desc,
      "v4l2src device=/dev/video2 ! video/x-raw,width=640,height=480,framerate=15/1 \
       ! videoflip method=2 ! videoconvert ! video/x-raw,format=RGB \
       ! appsink max-buffers=2 drop=true name=sink"
    );
  }

  #[test]
  fn file_pipeline_keeps_every_frame() {
    let desc = GStreamerInputPipelineBuilder::new()
      .file("clips/a.mp4")
      .target_format("RGB")
      .pipeline_description()
      .unwrap();
    assert!(desc.starts_with("filesrc location=\"clips/a.mp4\" ! decodebin"));
    assert!(desc.ends_with("drop=false sync=false name=sink"));
  }

  #[test]
  fn unknown_host_is_rejected() {
    let url = Url::parse("gst://rtsp/stream").unwrap();
    assert!(matches!(
      GStreamerInputPipelineBuilder::from_url(&url),
      Err(GStreamerInputError::SchemeMismatch)
    ));
  }

  #[test]
  fn stalled_source_ends_the_stream() {
    gst::init().unwrap();
    let pipeline = gst::parse::launch(
      "appsrc name=src caps=video/x-raw,format=RGB,width=8,height=8,framerate=1/1 \
       ! appsink name=sink",
    )
    .unwrap()
    .downcast::<gst::Pipeline>()
    .unwrap();
    let appsink = pipeline
      .by_name("sink")
      .unwrap()
      .downcast::<gst_app::AppSink>()
      .unwrap();
    pipeline.set_state(gst::State::Playing).unwrap();

    let mut frames = GStreamerInput { pipeline, appsink }
      .into_frames()
      .with_stall_timeout(Duration::from_millis(300));
    let started = Instant::now();
    assert!(frames.next().is_none());
    assert!(started.elapsed() < Duration::from_secs(5));
  }

  #[test]
  fn builder_without_source_fails() {
    let builder = GStreamerInputPipelineBuilder::new().target_format("RGB");
    assert!(matches!(
      builder.pipeline_description(),
      Err(GStreamerInputError::MissingSource)
    ));
  }
}
