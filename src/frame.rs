// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/frame.rs - 视频帧定义
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

use image::RgbImage;

const RGB_CHANNELS: usize = 3;

/// 一帧 RGB 图像及其在流中的位置
#[derive(Debug, Clone)]
pub struct Frame {
  /// RGB 图像数据（HWC 排列）
  pub image: RgbImage,
  /// 帧索引，从 0 开始
  pub index: u64,
  /// 时间戳（毫秒），来自输入源，未知时为 0
  pub timestamp_ms: u64,
}

impl Frame {
  pub fn new(image: RgbImage, index: u64, timestamp_ms: u64) -> Self {
    Self {
      image,
      index,
      timestamp_ms,
    }
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  /// 从 HWC 排列的 RGB 或 BGR 原始数据构造帧，`stride` 为每行字节数
  pub fn from_packed(
    data: &[u8],
    width: u32,
    height: u32,
    stride: usize,
    bgr: bool,
    index: u64,
    timestamp_ms: u64,
  ) -> Option<Self> {
    let row_bytes = width as usize * RGB_CHANNELS;
    if stride < row_bytes || data.len() < stride * (height as usize).saturating_sub(1) + row_bytes
    {
      return None;
    }

    let mut buffer = Vec::with_capacity(row_bytes * height as usize);
    for y in 0..height as usize {
      let row = &data[y * stride..y * stride + row_bytes];
      if bgr {
        for px in row.chunks_exact(RGB_CHANNELS) {
          buffer.extend_from_slice(&[px[2], px[1], px[0]]);
        }
      } else {
        buffer.extend_from_slice(row);
      }
    }

    RgbImage::from_raw(width, height, buffer).map(|image| Frame::new(image, index, timestamp_ms))
  }
}

impl From<RgbImage> for Frame {
  fn from(image: RgbImage) -> Self {
    Frame::new(image, 0, 0)
  }
}
