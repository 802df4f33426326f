// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/alert/event.rs - 报警事件与快照
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
  io::ErrorKind,
  path::{Path, PathBuf},
  time::Instant,
};

use chrono::{DateTime, Local};
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{DetectResult, FireSmokeLabel};

#[derive(Error, Debug)]
pub enum SnapshotError {
  #[error("无法创建快照目录: {0}")]
  Io(#[from] std::io::Error),
  #[error("无法写入快照: {0}")]
  Image(#[from] image::ImageError),
}

/// 临时快照文件
///
/// 丢弃时删除对应文件，快照的生命周期不会超过持有它的报警事件。
#[derive(Debug)]
pub struct Snapshot {
  path: PathBuf,
}

impl Snapshot {
  /// 以 `detection_<YYYYmmdd_HHMMSS_mmm>.jpg` 为名写入 JPEG
  pub fn write<P: AsRef<Path>>(
    dir: P,
    image: &RgbImage,
    at: DateTime<Local>,
  ) -> Result<Self, SnapshotError> {
    let dir = dir.as_ref();
    if !dir.as_os_str().is_empty() {
      std::fs::create_dir_all(dir)?;
    }
    // 同一毫秒内的多张快照追加序号
    let mut path = dir.join(Self::file_name(at));
    let mut seq = 1u32;
    while path.exists() {
      path = dir.join(format!(
        "detection_{}_{}.jpg",
        at.format("%Y%m%d_%H%M%S_%3f"),
        seq
      ));
      seq += 1;
    }
    image.save_with_format(&path, image::ImageFormat::Jpeg)?;
    debug!("写入快照: {}", path.display());
    Ok(Self { path })
  }

  pub fn file_name(at: DateTime<Local>) -> String {
    format!("detection_{}.jpg", at.format("%Y%m%d_%H%M%S_%3f"))
  }

  /// 接管一个已存在的文件
  pub fn adopt<P: Into<PathBuf>>(path: P) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn read(&self) -> std::io::Result<Vec<u8>> {
    std::fs::read(&self.path)
  }
}

impl Drop for Snapshot {
  fn drop(&mut self) {
    match std::fs::remove_file(&self.path) {
      Ok(()) => debug!("删除快照: {}", self.path.display()),
      Err(e) if e.kind() == ErrorKind::NotFound => {}
      Err(e) => warn!("删除快照 {} 失败: {}", self.path.display(), e),
    }
  }
}

/// 报警类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
  Fire,
  Smoke,
  Both,
}

impl AlertKind {
  /// 从检测结果归纳报警类型，没有火焰和烟雾时返回 `None`
  pub fn from_result(result: &DetectResult<FireSmokeLabel>) -> Option<Self> {
    let fire = result.items.iter().any(|i| i.kind == FireSmokeLabel::Fire);
    let smoke = result.items.iter().any(|i| i.kind == FireSmokeLabel::Smoke);
    match (fire, smoke) {
      (true, true) => Some(AlertKind::Both),
      (true, false) => Some(AlertKind::Fire),
      (false, true) => Some(AlertKind::Smoke),
      (false, false) => None,
    }
  }

  pub fn headline(&self) -> &'static str {
    match self {
      AlertKind::Fire => "🔥 Fire Detected!",
      AlertKind::Smoke => "💨 Smoke Detected!",
      AlertKind::Both => "🔥💨 Fire & Smoke Detected!",
    }
  }

  /// Discord embed 颜色
  pub fn color(&self) -> u32 {
    match self {
      AlertKind::Fire => 0x00FF00,
      AlertKind::Smoke => 0x0000FF,
      AlertKind::Both => 0xFFA500,
    }
  }
}

/// 一次报警
#[derive(Debug)]
pub struct AlertEvent {
  pub message: String,
  pub kind: AlertKind,
  /// 每个检测一行，例如 `Fire 0.87`
  pub details: Vec<String>,
  pub snapshot: Option<Snapshot>,
  pub created_at: DateTime<Local>,
  /// 单调时钟，用于冷却判断
  pub instant: Instant,
}

impl AlertEvent {
  pub fn new(kind: AlertKind, details: Vec<String>, snapshot: Option<Snapshot>) -> Self {
    Self::at(kind, details, snapshot, Local::now(), Instant::now())
  }

  pub fn at(
    kind: AlertKind,
    details: Vec<String>,
    snapshot: Option<Snapshot>,
    created_at: DateTime<Local>,
    instant: Instant,
  ) -> Self {
    let message = format!(
      "⚠️ **{}** {}",
      kind.headline(),
      created_at.format("%Y-%m-%d %H:%M:%S")
    );
    Self {
      message,
      kind,
      details,
      snapshot,
      created_at,
      instant,
    }
  }

  /// 由检测结果生成报警；只统计火焰和烟雾
  pub fn from_detections(
    result: &DetectResult<FireSmokeLabel>,
    snapshot: Option<Snapshot>,
    created_at: DateTime<Local>,
    instant: Instant,
  ) -> Option<Self> {
    let kind = AlertKind::from_result(result)?;
    let details = result
      .items
      .iter()
      .filter(|i| i.kind.is_hazard())
      .map(|i| {
        let name = match i.kind {
          FireSmokeLabel::Fire => "Fire",
          _ => "Smoke",
        };
        format!("{} {:.2}", name, i.score)
      })
      .collect();
    Some(Self::at(kind, details, snapshot, created_at, instant))
  }

  pub fn snapshot_path(&self) -> Option<&Path> {
    self.snapshot.as_ref().map(Snapshot::path)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::DetectItem;
  use chrono::TimeZone;

  fn item(kind: FireSmokeLabel, score: f32) -> DetectItem<FireSmokeLabel> {
    DetectItem {
      kind,
      score,
      bbox: [0.0, 0.0, 0.5, 0.5],
    }
  }

  #[test]
  fn snapshot_is_removed_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    let at = Local.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
    let snapshot = Snapshot::write(dir.path(), &RgbImage::new(8, 8), at).unwrap();
    let path = snapshot.path().to_path_buf();
    assert_eq!(
      path.file_name().unwrap().to_str().unwrap(),
      "detection_20260304_050607_000.jpg"
    );
    assert!(path.exists());

    let second = Snapshot::write(dir.path(), &RgbImage::new(8, 8), at).unwrap();
    assert_eq!(
      second.path().file_name().unwrap().to_str().unwrap(),
      "detection_20260304_050607_000_1.jpg"
    );

    drop(snapshot);
    assert!(!path.exists());
    assert!(second.path().exists());
  }

  #[test]
  fn dropping_a_missing_snapshot_is_quiet() {
    let dir = tempfile::tempdir().unwrap();
    drop(Snapshot::adopt(dir.path().join("gone.jpg")));
  }

  #[test]
  fn kind_and_details_follow_detections() {
    let at = Local.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
    let result = DetectResult::from(vec![
      item(FireSmokeLabel::Fire, 0.871),
      item(FireSmokeLabel::Other(5), 0.9),
      item(FireSmokeLabel::Smoke, 0.5),
    ]);
    let event = AlertEvent::from_detections(&result, None, at, Instant::now()).unwrap();
    assert_eq!(event.kind, AlertKind::Both);
    assert_eq!(event.details, vec!["Fire 0.87", "Smoke 0.50"]);
    assert_eq!(
      event.message,
      "⚠️ **🔥💨 Fire & Smoke Detected!** 2026-01-02 03:04:05"
    );
  }

  #[test]
  fn no_hazard_means_no_event() {
    let result = DetectResult::from(vec![item(FireSmokeLabel::Other(2), 0.9)]);
    assert!(AlertEvent::from_detections(&result, None, Local::now(), Instant::now()).is_none());
    assert!(
      AlertEvent::from_detections(&DetectResult::empty(), None, Local::now(), Instant::now())
        .is_none()
    );
  }
}
