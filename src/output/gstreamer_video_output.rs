// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 视频文件与窗口输出
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

//! # GStreamer 视频输出模块
//!
//! 把标注后的帧编码成视频文件，或者直接显示在窗口中。
//!
//! ## URL Scheme
//!
//! - `gst://file/output.mp4?fps=20`：写入视频文件，按扩展名选择封装
//!   （mp4 / mkv / avi / webm，其余按 mp4 处理）
//! - `gst://display`：本地窗口显示（`autovideosink`）
//!
//! 帧的宽高在收到第一帧时确定，管道也在那时才创建。
//!
//! ```no_run
//! use fengyan::{FromUrl, output::GStreamerVideoOutput};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let url = Url::parse("gst://file/output.mp4?fps=20")?;
//! let output = GStreamerVideoOutput::from_url(&url)?;
//! # Ok(())
//! # }
//! ```

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::Mutex,
};

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  model::{DetectResult, WithLabel},
  output::{Render, draw::Draw},
};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use image::RgbImage;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

const DEFAULT_FPS: i32 = 20;
const EOS_TIMEOUT_SECS: u64 = 5;

#[derive(Error, Debug)]
pub enum GStreamerVideoOutputError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("Unknown video output target: {0}")]
  UnknownTarget(String),
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsrc element")]
  AppSrcNotFound,
  #[error("Failed to convert element to appsrc")]
  AppSrcConversionFailed,
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("帧尺寸变化: {0}x{1} -> {2}x{3}")]
  FrameSizeChanged(u32, u32, u32, u32),
}

/// 输出目标
#[derive(Debug, Clone, PartialEq)]
pub enum VideoTarget {
  File(PathBuf),
  Display,
}

impl VideoTarget {
  /// 对应的 gst-launch 管道描述
  pub fn pipeline_description(&self) -> String {
    match self {
      VideoTarget::Display => {
        "appsrc name=src is-live=true ! videoconvert ! autovideosink sync=false".to_string()
      }
      VideoTarget::File(path) => {
        let location = path.display();
        let extension = path
          .extension()
          .and_then(|e| e.to_str())
          .map(|e| e.to_lowercase());
        match extension.as_deref() {
          Some("mkv") => format!(
            "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! matroskamux ! filesink location=\"{}\"",
            location
          ),
          Some("avi") => format!(
            "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc ! avimux ! filesink location=\"{}\"",
            location
          ),
          Some("webm") => format!(
            "appsrc name=src ! videoconvert ! vp8enc ! webmmux ! filesink location=\"{}\"",
            location
          ),
          _ => format!(
            "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast tune=zerolatency ! h264parse ! mp4mux ! filesink location=\"{}\"",
            location
          ),
        }
      }
    }
  }
}

struct RunningPipeline {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  width: u32,
  height: u32,
  frame_count: u64,
}

/// GStreamer 视频输出
///
/// 第一帧到达时按帧尺寸建立管道；丢弃时发送 EOS 并等待文件写完。
pub struct GStreamerVideoOutput {
  target: VideoTarget,
  fps: i32,
  draw: Draw,
  running: Mutex<Option<RunningPipeline>>,
}

impl FromUrlWithScheme for GStreamerVideoOutput {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerVideoOutput {
  type Error = GStreamerVideoOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(GStreamerVideoOutputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();
    let fps = query
      .get("fps")
      .and_then(|v| v.parse::<i32>().ok())
      .filter(|v| *v > 0)
      .unwrap_or(DEFAULT_FPS);

    let target = match url.host_str() {
      Some("file") => VideoTarget::File(PathBuf::from(url.path())),
      Some("display") => VideoTarget::Display,
      other => {
        return Err(GStreamerVideoOutputError::UnknownTarget(
          other.unwrap_or_default().to_string(),
        ));
      }
    };

    Ok(Self::new(target, fps))
  }
}

impl GStreamerVideoOutput {
  pub fn new(target: VideoTarget, fps: i32) -> Self {
    Self {
      target,
      fps: fps.max(1),
      draw: Draw::default(),
      running: Mutex::new(None),
    }
  }

  pub fn file<P: AsRef<Path>>(path: P, fps: i32) -> Self {
    Self::new(VideoTarget::File(path.as_ref().to_path_buf()), fps)
  }

  pub fn display() -> Self {
    Self::new(VideoTarget::Display, DEFAULT_FPS)
  }

  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  pub fn target(&self) -> &VideoTarget {
    &self.target
  }

  pub fn fps(&self) -> i32 {
    self.fps
  }

  fn start(&self, width: u32, height: u32) -> Result<RunningPipeline, GStreamerVideoOutputError> {
    gst::init()?;

    let description = self.target.pipeline_description();
    info!("创建视频输出管道: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| {
        GStreamerVideoOutputError::PipelineError("Failed to create pipeline".to_string())
      })?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerVideoOutputError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerVideoOutputError::AppSrcConversionFailed)?;

    let caps = gst::Caps::builder("video/x-raw")
      .field("format", "RGB")
      .field("width", width as i32)
      .field("height", height as i32)
      .field("framerate", gst::Fraction::new(self.fps, 1))
      .build();
    appsrc.set_caps(Some(&caps));
    appsrc.set_format(gst::Format::Time);

    pipeline.set_state(gst::State::Playing)?;
    info!(
      "视频输出已启动: {}x{} @ {} fps -> {:?}",
      width, height, self.fps, self.target
    );

    Ok(RunningPipeline {
      pipeline,
      appsrc,
      width,
      height,
      frame_count: 0,
    })
  }

  fn push_image(&self, image: &RgbImage) -> Result<(), GStreamerVideoOutputError> {
    let mut guard = self.running.lock().unwrap_or_else(|e| e.into_inner());
    if guard.is_none() {
      *guard = Some(self.start(image.width(), image.height())?);
    }
    let Some(running) = guard.as_mut() else {
      return Err(GStreamerVideoOutputError::PipelineError(
        "pipeline not started".to_string(),
      ));
    };

    if (running.width, running.height) != image.dimensions() {
      return Err(GStreamerVideoOutputError::FrameSizeChanged(
        running.width,
        running.height,
        image.width(),
        image.height(),
      ));
    }

    let frame_duration = 1_000_000_000 / self.fps as u64;
    let mut buffer = gst::Buffer::from_mut_slice(pack_rgb_rows(image));
    {
      let buffer = buffer.make_mut();
      buffer.set_pts(gst::ClockTime::from_nseconds(
        running.frame_count * frame_duration,
      ));
      buffer.set_duration(gst::ClockTime::from_nseconds(frame_duration));
    }
    running.frame_count += 1;

    running.appsrc.push_buffer(buffer).map_err(|e| {
      GStreamerVideoOutputError::PipelineError(format!("Failed to push buffer: {:?}", e))
    })?;

    Ok(())
  }
}

impl Drop for GStreamerVideoOutput {
  fn drop(&mut self) {
    let running = self
      .running
      .get_mut()
      .unwrap_or_else(|e| e.into_inner())
      .take();
    let Some(running) = running else {
      return;
    };

    if let Err(e) = running.appsrc.end_of_stream() {
      warn!("发送 EOS 失败: {:?}", e);
    }

    // 等待编码器把剩余数据写完
    if let Some(bus) = running.pipeline.bus() {
      let msg = bus.timed_pop_filtered(
        gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS),
        &[gst::MessageType::Eos, gst::MessageType::Error],
      );
      match msg.as_ref().map(|m| m.view()) {
        Some(gst::MessageView::Error(err)) => {
          error!("视频输出管道错误: {} ({:?})", err.error(), err.debug())
        }
        Some(_) => {}
        None => warn!("等待 EOS 超时"),
      }
    }

    if let Err(e) = running.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer video output pipeline: {}", e);
    }

    info!("视频输出关闭，共写入 {} 帧", running.frame_count);
  }
}

impl<T: WithLabel> Render<Frame, DetectResult<T>> for GStreamerVideoOutput {
  type Error = GStreamerVideoOutputError;

  fn render_result(&self, frame: &Frame, result: &DetectResult<T>) -> Result<(), Self::Error> {
    let image = self.draw.annotate(&frame.image, result);
    self.push_image(&image)
  }
}

/// RGB caps 默认每行按 4 字节对齐，逐行补齐
fn pack_rgb_rows(image: &RgbImage) -> Vec<u8> {
  let row_bytes = image.width() as usize * 3;
  let stride = row_bytes.div_ceil(4) * 4;
  if stride == row_bytes {
    return image.as_raw().clone();
  }

  let mut data = vec![0u8; stride * image.height() as usize];
  for (y, row) in image.as_raw().chunks_exact(row_bytes).enumerate() {
    data[y * stride..y * stride + row_bytes].copy_from_slice(row);
  }
  data
}
