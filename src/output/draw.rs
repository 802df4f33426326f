// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
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

use std::{path::Path, time::Duration};

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;
use tracing::info;

use crate::model::{DetectItem, DetectResult, WithLabel};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const LABEL_PLACEHOLDER_WIDTH: u32 = 12; // 无字体时标签底色块宽度
const BANNER_FONT_SIZE: f32 = 26.0;
const BANNER_MARGIN: i32 = 10;
const STATS_FONT_SIZE: f32 = 22.0;
const STATS_LINE_HEIGHT: i32 = 30;
const STATS_COLOR: [u8; 3] = [0, 255, 0];
const BOX_THICKNESS: i32 = 2;

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("无法读取字体文件: {0}")]
  Io(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
}

/// 检测框绘制器
///
/// 未提供字体时只绘制边框和标签底色，不渲染文字。
#[derive(Clone)]
pub struct Draw {
  font: Option<FontArc>,
  font_size: f32,
  label_text_height: i32,
  label_text_vertical_padding: i32,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      font: None,
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
    }
  }
}

impl Draw {
  pub fn with_font_file<P: AsRef<Path>>(path: P) -> Result<Self, DrawError> {
    let data = std::fs::read(path.as_ref())?;
    let font = FontArc::try_from_vec(data)?;
    info!("加载标签字体: {}", path.as_ref().display());
    Ok(Self {
      font: Some(font),
      ..Self::default()
    })
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  /// 复制一份图像并画上检测结果
  pub fn annotate<T: WithLabel>(&self, image: &RgbImage, result: &DetectResult<T>) -> RgbImage {
    let mut image = image.clone();
    self.draw_detections_on_image(&mut image, result);
    self.draw_status_banner(&mut image, result);
    image
  }

  pub fn draw_detections_on_image<T: WithLabel>(
    &self,
    image: &mut RgbImage,
    result: &DetectResult<T>,
  ) {
    for DetectItem { kind, score, bbox } in result.items.iter() {
      self.draw_bbox_with_label(image, bbox, kind, *score);
    }
  }

  // bbox 为归一化坐标 [x_min, y_min, x_max, y_max]
  fn draw_bbox_with_label<T: WithLabel>(
    &self,
    image: &mut RgbImage,
    bbox: &[f32; 4],
    kind: &T,
    score: f32,
  ) {
    let (w, h) = (image.width() as f32, image.height() as f32);
    if w < 1.0 || h < 1.0 {
      return;
    }

    let x_min = ((bbox[0] * w).floor() as i32).clamp(0, w as i32 - 1);
    let y_min = ((bbox[1] * h).floor() as i32).clamp(0, h as i32 - 1);
    let x_max = ((bbox[2] * w).ceil() as i32).clamp(0, w as i32 - 1);
    let y_max = ((bbox[3] * h).ceil() as i32).clamp(0, h as i32 - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = Rgb(kind.color());
    for t in 0..BOX_THICKNESS {
      let width = (x_max - x_min - 2 * t).max(1) as u32;
      let height = (y_max - y_min - 2 * t).max(1) as u32;
      draw_hollow_rect_mut(image, Rect::at(x_min + t, y_min + t).of_size(width, height), color);
    }

    let label = format!("{}: {:.2}", kind.to_label_str(), score);
    let (text_width, _) = match &self.font {
      Some(font) => text_size(PxScale::from(self.font_size), font, &label),
      None => (LABEL_PLACEHOLDER_WIDTH, 0),
    };

    // 标签放在边框上方，放不下时贴着图像顶部
    let label_x = x_min;
    let label_y = (y_min - self.label_text_height).max(0);
    let label_width = text_width.min((w as i32 - label_x).max(0) as u32);
    if label_width == 0 {
      return;
    }

    let rect = Rect::at(label_x, label_y).of_size(label_width, self.label_text_height as u32);
    draw_filled_rect_mut(image, rect, color);

    if let Some(font) = &self.font {
      draw_text_mut(
        image,
        Rgb([255u8, 255u8, 255u8]),
        label_x,
        label_y + self.label_text_vertical_padding,
        PxScale::from(self.font_size),
        font,
        &label,
      );
    }
  }

  /// 在左下角逐行写出各类别的状态提示（如 "FIRE DETECTED!"），需要字体
  pub fn draw_status_banner<T: WithLabel>(&self, image: &mut RgbImage, result: &DetectResult<T>) {
    let Some(font) = &self.font else {
      return;
    };

    let mut lines: Vec<(&'static str, [u8; 3])> = Vec::new();
    for item in result.items.iter() {
      if let Some(text) = item.kind.banner()
        && !lines.iter().any(|(t, _)| *t == text)
      {
        lines.push((text, item.kind.color()));
      }
    }

    let scale = PxScale::from(BANNER_FONT_SIZE);
    let mut y = image.height() as i32 - BANNER_MARGIN;
    for (text, color) in lines {
      let (_, text_height) = text_size(scale, font, text);
      y -= text_height as i32 + BANNER_MARGIN;
      draw_text_mut(image, Rgb(color), BANNER_MARGIN, y.max(0), scale, font, text);
    }
  }

  /// 左上角的帧率和单帧处理耗时，需要字体
  pub fn draw_frame_stats(&self, image: &mut RgbImage, fps: f64, processing: Duration) {
    let Some(font) = &self.font else {
      return;
    };

    let scale = PxScale::from(STATS_FONT_SIZE);
    for (i, text) in frame_stats_lines(fps, processing).iter().enumerate() {
      let y = BANNER_MARGIN + i as i32 * STATS_LINE_HEIGHT;
      draw_text_mut(image, Rgb(STATS_COLOR), BANNER_MARGIN, y, scale, font, text);
    }
  }
}

fn frame_stats_lines(fps: f64, processing: Duration) -> [String; 2] {
  [
    format!("FPS: {:.1}", fps),
    format!(
      "Processing time: {:.1} ms",
      processing.as_secs_f64() * 1000.0
    ),
  ]
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::FireSmokeLabel;

  fn fire_at(bbox: [f32; 4]) -> DetectResult<FireSmokeLabel> {
    DetectResult::from(vec![DetectItem {
      kind: FireSmokeLabel::Fire,
      score: 0.9,
      bbox,
    }])
  }

  #[test]
  fn draws_box_in_label_color() {
    let image = RgbImage::new(100, 100);
    let out = Draw::default().annotate(&image, &fire_at([0.2, 0.4, 0.8, 0.9]));
    // 左边框
    assert_eq!(out.get_pixel(20, 60).0, [255, 0, 0]);
    // 框内部保持原样
    assert_eq!(out.get_pixel(50, 60).0, [0, 0, 0]);
    // 原图不被修改
    assert_eq!(image.get_pixel(20, 60).0, [0, 0, 0]);
  }

  #[test]
  fn degenerate_box_is_skipped() {
    let image = RgbImage::new(10, 10);
    let out = Draw::default().annotate(&image, &fire_at([0.5, 0.5, 0.5, 0.5]));
    assert!(out.pixels().all(|p| p.0 == [0, 0, 0]));
  }

  #[test]
  fn banner_needs_a_font() {
    let mut image = RgbImage::new(50, 50);
    Draw::default().draw_status_banner(&mut image, &fire_at([0.1, 0.1, 0.2, 0.2]));
    assert!(image.pixels().all(|p| p.0 == [0, 0, 0]));
  }

  #[test]
  fn frame_stats_text() {
    let [fps, time] = frame_stats_lines(12.345, Duration::from_micros(33_360));
    assert_eq!(fps, "FPS: 12.3");
    assert_eq!(time, "Processing time: 33.4 ms");
  }

  #[test]
  fn frame_stats_are_drawn_top_left() {
    let mut image = RgbImage::new(320, 120);
    Draw::default().draw_frame_stats(&mut image, 30.0, Duration::from_millis(20));
    assert!(image.pixels().all(|p| p.0 == [0, 0, 0]));

    // 系统没有 DejaVu 字体时只验证无字体的情况
    let Ok(draw) = Draw::with_font_file("/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf") else {
      return;
    };
    draw.draw_frame_stats(&mut image, 30.0, Duration::from_millis(20));
    let mut top = (0..320).flat_map(|x| (0..70).map(move |y| (x, y)));
    assert!(top.any(|(x, y)| image.get_pixel(x, y).0[1] > 0));
    let mut bottom = (0..320).flat_map(|x| (80..120).map(move |y| (x, y)));
    assert!(bottom.all(|(x, y)| image.get_pixel(x, y).0 == [0, 0, 0]));
  }

  #[test]
  fn missing_font_file_is_an_error() {
    assert!(matches!(
      Draw::with_font_file("/nonexistent/font.ttf"),
      Err(DrawError::Io(_))
    ));
  }
}
