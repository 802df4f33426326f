// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/alert/transport.rs - 消息通道定义
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

use std::time::Duration;

use thiserror::Error;

use crate::alert::AlertEvent;

#[derive(Error, Debug)]
pub enum TransportError {
  #[error("频道尚未就绪")]
  ChannelNotReady,
  #[error("HTTP 请求失败: {0}")]
  Http(#[from] reqwest::Error),
  #[error("服务器返回 {status}: {body}")]
  Status { status: u16, body: String },
  #[error("读取快照失败: {0}")]
  Snapshot(#[from] std::io::Error),
  #[error("序列化消息失败: {0}")]
  Serialize(#[from] serde_json::Error),
  #[error("发送超时 ({0:?})")]
  Timeout(Duration),
  #[error("会话繁忙，已有请求在排队")]
  Busy,
  #[error("会话已关闭")]
  Closed,
  #[error("无法启动会话线程: {0}")]
  Runtime(std::io::Error),
}

/// 报警消息通道
///
/// `send` 同步返回结果；快照由调用方在返回后删除，通道只读取一次。
pub trait Transport: Send {
  fn name(&self) -> &'static str;
  fn send(&self, alert: &AlertEvent) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
  fn name(&self) -> &'static str {
    (**self).name()
  }

  fn send(&self, alert: &AlertEvent) -> Result<(), TransportError> {
    (**self).send(alert)
  }
}
