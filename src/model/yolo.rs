// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/model/yolo.rs - YOLO (ONNX) 检测模型
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

//! Ultralytics 导出的 YOLO 检测模型（v8/v11/v12，ONNX 格式）。
//!
//! 输出张量为 `[1, 4 + 类别数, 锚点数]`，前 4 个通道是输入图像坐标系下的
//! `cx, cy, w, h`，其后是各类别置信度（已经过 sigmoid）。部分导出会转置为
//! `[1, 锚点数, 4 + 类别数]`，这里两种都接受。

use std::{
  marker::PhantomData,
  path::{Path, PathBuf},
};

use image::{
  Rgb, RgbImage,
  imageops::{self, FilterType},
};
use thiserror::Error;
use tract_onnx::prelude::*;
use tracing::{debug, info};

use crate::{
  frame::Frame,
  model::{DetectItem, DetectResult, Model, WithLabel},
};

const YOLO_DEFAULT_INPUT_SIZE: u32 = 640;
const YOLO_DEFAULT_CONFIDENCE: f32 = 0.25;
const YOLO_DEFAULT_IOU: f32 = 0.45;
const YOLO_MAX_DETECTIONS: usize = 300;
const YOLO_BOX_CHANNELS: usize = 4;
const LETTERBOX_FILL: u8 = 114;

type YoloPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

#[derive(Error, Debug)]
pub enum YoloError {
  #[error("模型文件不存在: {0}")]
  ModelNotFound(PathBuf),
  #[error("模型加载错误: {0:#}")]
  ModelLoad(TractError),
  #[error("推理错误: {0:#}")]
  Inference(TractError),
  #[error("模型没有输出")]
  NoOutput,
  #[error("不支持的模型输出形状: {0:?}")]
  UnexpectedShape(Vec<usize>),
}

pub struct YoloBuilder {
  model_path: PathBuf,
  input_size: u32,
  confidence: f32,
  iou: f32,
  max_detections: usize,
}

impl YoloBuilder {
  pub fn new<P: AsRef<Path>>(model_path: P) -> Self {
    Self {
      model_path: model_path.as_ref().to_path_buf(),
      input_size: YOLO_DEFAULT_INPUT_SIZE,
      confidence: YOLO_DEFAULT_CONFIDENCE,
      iou: YOLO_DEFAULT_IOU,
      max_detections: YOLO_MAX_DETECTIONS,
    }
  }

  pub fn input_size(mut self, size: u32) -> Self {
    self.input_size = size;
    self
  }

  pub fn confidence(mut self, threshold: f32) -> Self {
    self.confidence = threshold;
    self
  }

  pub fn iou(mut self, threshold: f32) -> Self {
    self.iou = threshold;
    self
  }

  pub fn max_detections(mut self, max: usize) -> Self {
    self.max_detections = max;
    self
  }

  pub fn build<T: WithLabel>(self) -> Result<Yolo<T>, YoloError> {
    if !self.model_path.is_file() {
      return Err(YoloError::ModelNotFound(self.model_path));
    }

    info!("加载模型文件: {}", self.model_path.display());
    let size = self.input_size as usize;
    let model = tract_onnx::onnx()
      .model_for_path(&self.model_path)
      .and_then(|model| {
        model.with_input_fact(
          0,
          InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
        )
      })
      .and_then(|model| model.into_optimized())
      .and_then(|model| model.into_runnable())
      .map_err(YoloError::ModelLoad)?;
    info!(
      "模型加载完成，输入尺寸 {}x{}，置信度阈值 {}，NMS 阈值 {}",
      size, size, self.confidence, self.iou
    );

    Ok(Yolo {
      model,
      input_size: self.input_size,
      confidence: self.confidence,
      iou: self.iou,
      max_detections: self.max_detections,
      _label: PhantomData,
    })
  }
}

pub struct Yolo<T> {
  model: YoloPlan,
  input_size: u32,
  confidence: f32,
  iou: f32,
  max_detections: usize,
  _label: PhantomData<T>,
}

impl<T: WithLabel> Model for Yolo<T> {
  type Input = Frame;
  type Output = DetectResult<T>;
  type Error = YoloError;

  fn infer(&self, frame: &Frame) -> Result<Self::Output, Self::Error> {
    if frame.width() == 0 || frame.height() == 0 {
      return Ok(DetectResult::empty());
    }

    let letterbox = Letterbox::new(frame.width(), frame.height(), self.input_size);
    let canvas = letterbox.apply(&frame.image);

    let size = self.input_size as usize;
    let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
      canvas.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    });

    debug!("执行模型推理");
    let outputs = self
      .model
      .run(tvec!(input.into_tensor().into()))
      .map_err(YoloError::Inference)?;
    let output = outputs.first().ok_or(YoloError::NoOutput)?;
    let view = output
      .to_array_view::<f32>()
      .map_err(YoloError::Inference)?;

    let shape = view.shape().to_vec();
    if shape.len() != 3 || shape[0] != 1 {
      return Err(YoloError::UnexpectedShape(shape));
    }
    let preds = view
      .index_axis(tract_ndarray::Axis(0), 0)
      .into_dimensionality::<tract_ndarray::Ix2>()
      .map_err(|_| YoloError::UnexpectedShape(shape.clone()))?;
    // 通道数远小于锚点数，借此判断是否转置
    let preds = if shape[1] <= shape[2] {
      preds
    } else {
      preds.reversed_axes()
    };
    let (channels, anchors) = preds.dim();
    if channels <= YOLO_BOX_CHANNELS {
      return Err(YoloError::UnexpectedShape(shape));
    }
    let flat: Vec<f32> = preds.iter().copied().collect();

    let candidates = decode_predictions::<T>(&flat, channels, anchors, self.confidence);
    debug!("候选框 {} 个", candidates.len());
    let kept = nms(candidates, self.iou, self.max_detections);

    let items = kept
      .into_iter()
      .map(|item| DetectItem {
        bbox: letterbox.normalize_box(&item.bbox),
        ..item
      })
      .collect::<Vec<_>>();
    debug!("检测到 {} 个物体", items.len());

    Ok(DetectResult::from(items))
  }
}

/// 等比缩放并居中填充到正方形输入
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub scale: f32,
  pub pad_x: u32,
  pub pad_y: u32,
  pub resized_width: u32,
  pub resized_height: u32,
  pub source_width: u32,
  pub source_height: u32,
  pub size: u32,
}

impl Letterbox {
  pub fn new(source_width: u32, source_height: u32, size: u32) -> Self {
    let scale = (size as f32 / source_width as f32).min(size as f32 / source_height as f32);
    let resized_width = ((source_width as f32 * scale).round() as u32).clamp(1, size);
    let resized_height = ((source_height as f32 * scale).round() as u32).clamp(1, size);

    Self {
      scale,
      pad_x: (size - resized_width) / 2,
      pad_y: (size - resized_height) / 2,
      resized_width,
      resized_height,
      source_width,
      source_height,
      size,
    }
  }

  pub fn apply(&self, image: &RgbImage) -> RgbImage {
    let resized = imageops::resize(
      image,
      self.resized_width,
      self.resized_height,
      FilterType::Triangle,
    );
    let mut canvas = RgbImage::from_pixel(self.size, self.size, Rgb([LETTERBOX_FILL; 3]));
    imageops::replace(&mut canvas, &resized, self.pad_x as i64, self.pad_y as i64);
    canvas
  }

  /// 模型输入坐标系下的 `[x1, y1, x2, y2]` 转为相对原图的归一化坐标
  pub fn normalize_box(&self, bbox: &[f32; 4]) -> [f32; 4] {
    let to_x = |x: f32| {
      ((x - self.pad_x as f32) / self.scale / self.source_width as f32).clamp(0.0, 1.0)
    };
    let to_y = |y: f32| {
      ((y - self.pad_y as f32) / self.scale / self.source_height as f32).clamp(0.0, 1.0)
    };
    [to_x(bbox[0]), to_y(bbox[1]), to_x(bbox[2]), to_y(bbox[3])]
  }
}

/// 解码通道优先排列的预测值 `preds[c * anchors + a]`，保留最高类别分数不低于阈值的框
pub fn decode_predictions<T: WithLabel>(
  preds: &[f32],
  channels: usize,
  anchors: usize,
  confidence: f32,
) -> Vec<DetectItem<T>> {
  if channels <= YOLO_BOX_CHANNELS || preds.len() < channels * anchors {
    return Vec::new();
  }

  let at = |c: usize, a: usize| preds[c * anchors + a];
  let mut items = Vec::new();

  for a in 0..anchors {
    let (class_id, score) = (YOLO_BOX_CHANNELS..channels)
      .map(|c| (c - YOLO_BOX_CHANNELS, at(c, a)))
      .fold((0usize, f32::MIN), |best, cur| {
        if cur.1 > best.1 { cur } else { best }
      });

    if score < confidence {
      continue;
    }

    let (cx, cy, w, h) = (at(0, a), at(1, a), at(2, a), at(3, a));
    items.push(DetectItem {
      kind: T::from_label_id(class_id as u32),
      score,
      bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
    });
  }

  items
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
  let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
  let inter = ix * iy;
  let area = |r: &[f32; 4]| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
  let union = area(a) + area(b) - inter;
  if union <= 0.0 { 0.0 } else { inter / union }
}

/// 按类别做非极大值抑制，结果按分数降序
pub fn nms<T: WithLabel>(
  mut items: Vec<DetectItem<T>>,
  iou_threshold: f32,
  max_detections: usize,
) -> Vec<DetectItem<T>> {
  items.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut kept: Vec<DetectItem<T>> = Vec::new();
  for item in items {
    if kept.len() >= max_detections {
      break;
    }
    let suppressed = kept.iter().any(|k| {
      k.kind.to_label_id() == item.kind.to_label_id() && iou(&k.bbox, &item.bbox) > iou_threshold
    });
    if !suppressed {
      kept.push(item);
    }
  }
  kept
}
