// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/alert/cooldown.rs - 报警冷却
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

use std::time::{Duration, Instant};

/// 冷却门：两次报警之间至少间隔 `cooldown`
///
/// `may_fire` 只做判断，没有副作用；发送成功后由调用方调用 `record_fire`。
/// 距上次报警恰好等于冷却时长时视为已过期。
#[derive(Debug, Clone)]
pub struct CooldownGate {
  cooldown: Duration,
  last_fire: Option<Instant>,
}

impl CooldownGate {
  pub fn new(cooldown: Duration) -> Self {
    Self {
      cooldown,
      last_fire: None,
    }
  }

  pub fn cooldown(&self) -> Duration {
    self.cooldown
  }

  pub fn last_fire(&self) -> Option<Instant> {
    self.last_fire
  }

  pub fn may_fire(&self, now: Instant) -> bool {
    match self.last_fire {
      None => true,
      Some(last) => now.saturating_duration_since(last) >= self.cooldown,
    }
  }

  pub fn record_fire(&mut self, now: Instant) {
    self.last_fire = Some(now);
  }

  /// 距离下次允许报警还剩多久
  pub fn remaining(&self, now: Instant) -> Duration {
    match self.last_fire {
      None => Duration::ZERO,
      Some(last) => self
        .cooldown
        .saturating_sub(now.saturating_duration_since(last)),
    }
  }
}
