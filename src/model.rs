// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/model.rs - 模型
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

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem<T> {
  pub kind: T,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，相对帧宽高归一化
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectResult<T> {
  pub items: Box<[DetectItem<T>]>,
}

impl<T> DetectResult<T> {
  pub fn empty() -> Self {
    Self {
      items: Box::new([]),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

impl<T> From<Vec<DetectItem<T>>> for DetectResult<T> {
  fn from(items: Vec<DetectItem<T>>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

pub trait WithLabel: Sized + std::fmt::Debug {
  fn to_label_str(&self) -> String;
  fn to_label_id(&self) -> u32;
  fn from_label_id(id: u32) -> Self;

  /// 绘制颜色 (RGB)
  fn color(&self) -> [u8; 3] {
    [0, 0, 255]
  }

  /// 画面状态栏提示，返回 None 表示该类别不提示
  fn banner(&self) -> Option<&'static str> {
    None
  }
}

/// 火灾模型的类别：0 为火焰，1 为烟雾
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FireSmokeLabel {
  Fire,
  Smoke,
  Other(u32),
}

impl FireSmokeLabel {
  /// 是否需要报警
  pub fn is_hazard(&self) -> bool {
    matches!(self, FireSmokeLabel::Fire | FireSmokeLabel::Smoke)
  }
}

impl WithLabel for FireSmokeLabel {
  fn to_label_str(&self) -> String {
    match self {
      FireSmokeLabel::Fire => "fire".to_string(),
      FireSmokeLabel::Smoke => "smoke".to_string(),
      FireSmokeLabel::Other(id) => format!("Class {}", id),
    }
  }

  fn to_label_id(&self) -> u32 {
    match self {
      FireSmokeLabel::Fire => 0,
      FireSmokeLabel::Smoke => 1,
      FireSmokeLabel::Other(id) => *id,
    }
  }

  fn from_label_id(id: u32) -> Self {
    match id {
      0 => FireSmokeLabel::Fire,
      1 => FireSmokeLabel::Smoke,
      other => FireSmokeLabel::Other(other),
    }
  }

  // 火焰红色，烟雾灰色，其余绿色
  fn color(&self) -> [u8; 3] {
    match self {
      FireSmokeLabel::Fire => [255, 0, 0],
      FireSmokeLabel::Smoke => [128, 128, 128],
      FireSmokeLabel::Other(_) => [0, 255, 0],
    }
  }

  fn banner(&self) -> Option<&'static str> {
    match self {
      FireSmokeLabel::Fire => Some("FIRE DETECTED!"),
      FireSmokeLabel::Smoke => Some("SMOKE DETECTED!"),
      FireSmokeLabel::Other(_) => None,
    }
  }
}

mod yolo;
pub use self::yolo::{Letterbox, Yolo, YoloBuilder, YoloError, decode_predictions, nms};

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn label_ids_round_trip_and_unknowns_are_not_hazards() {
    assert_eq!(FireSmokeLabel::from_label_id(0), FireSmokeLabel::Fire);
    assert_eq!(FireSmokeLabel::from_label_id(1), FireSmokeLabel::Smoke);
    let other = FireSmokeLabel::from_label_id(7);
    assert_eq!(other.to_label_id(), 7);
    assert_eq!(other.to_label_str(), "Class 7");
    assert!(!other.is_hazard());
    assert!(FireSmokeLabel::Smoke.is_hazard());
  }
}
