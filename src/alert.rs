// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/alert.rs - 报警
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

//! 检测到火焰或烟雾后的报警流程：
//! 冷却门 → 分发器 → 消息通道（Bot 会话或 Webhook）。

mod bot;
mod cooldown;
mod dispatcher;
mod event;
mod transport;
mod webhook;

#[cfg(test)]
mod test_http;

pub use self::bot::{DiscordBot, DiscordBotConfig};
pub use self::cooldown::CooldownGate;
pub use self::dispatcher::{AlertDispatcher, AlertWorker, DispatchResult, DispatchStats};
pub use self::event::{AlertEvent, AlertKind, Snapshot, SnapshotError};
pub use self::transport::{Transport, TransportError};
pub use self::webhook::{ATTACHMENT_NAME, DiscordWebhook};
