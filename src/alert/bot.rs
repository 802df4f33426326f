// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/alert/bot.rs - Discord Bot 会话通道
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

//! # Discord Bot 会话
//!
//! 会话运行在独立线程的 tokio 运行时中，状态为
//! Disconnected → Connecting → Connected → Disconnected。
//!
//! 连接阶段校验令牌（`GET /users/@me`）并确认目标频道存在
//! （`GET /channels/{id}`），失败后按固定间隔重试直到关闭。
//! 发送请求经通道交给会话，调用方带超时等待结果；
//! 未连接时直接返回 [`TransportError::ChannelNotReady`]。

use std::{
  sync::{Arc, Mutex, mpsc as std_mpsc},
  thread::JoinHandle,
  time::{Duration, Instant},
};

use reqwest::{Client, header::AUTHORIZATION, multipart};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::alert::{AlertEvent, Transport, TransportError, webhook::ATTACHMENT_NAME};

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
const REQUEST_QUEUE_SIZE: usize = 4;
/// 调用方多等一会儿，HTTP 客户端先超时，结果以会话一侧为准
const REPLY_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DiscordBotConfig {
  pub token: String,
  pub channel_id: String,
  pub api_base: String,
  pub send_timeout: Duration,
  pub retry_interval: Duration,
}

impl DiscordBotConfig {
  pub fn new<T: Into<String>, C: Into<String>>(token: T, channel_id: C) -> Self {
    Self {
      token: token.into(),
      channel_id: channel_id.into(),
      api_base: DISCORD_API_BASE.to_string(),
      send_timeout: Duration::from_secs(30),
      retry_interval: Duration::from_secs(10),
    }
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.api_base.trim_end_matches('/'), path)
  }

  fn authorization(&self) -> String {
    format!("Bot {}", self.token)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
  Disconnected,
  Connecting,
  Connected,
}

struct SendRequest {
  content: String,
  image: Option<Vec<u8>>,
  reply: std_mpsc::SyncSender<Result<(), TransportError>>,
}

/// Discord Bot 通道
pub struct DiscordBot {
  state: Arc<Mutex<SessionState>>,
  requests: mpsc::Sender<SendRequest>,
  shutdown: Option<oneshot::Sender<()>>,
  handle: Option<JoinHandle<()>>,
  send_timeout: Duration,
}

impl DiscordBot {
  /// 启动会话线程，立即返回；连接在后台进行
  pub fn start(config: DiscordBotConfig) -> Result<Self, TransportError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .map_err(TransportError::Runtime)?;
    let client = Client::builder().timeout(config.send_timeout).build()?;

    let state = Arc::new(Mutex::new(SessionState::Disconnected));
    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_SIZE);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let send_timeout = config.send_timeout;

    let session_state = state.clone();
    let handle = std::thread::Builder::new()
      .name("discord-bot".to_string())
      .spawn(move || {
        runtime.block_on(run_session(
          config,
          client,
          session_state,
          request_rx,
          shutdown_rx,
        ))
      })
      .map_err(TransportError::Runtime)?;

    Ok(Self {
      state,
      requests: request_tx,
      shutdown: Some(shutdown_tx),
      handle: Some(handle),
      send_timeout,
    })
  }

  pub(crate) fn state(&self) -> SessionState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// 等待连接建立，超时返回 false
  pub fn wait_until_connected(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
      if self.state() == SessionState::Connected {
        return true;
      }
      if Instant::now() >= deadline {
        return false;
      }
      std::thread::sleep(Duration::from_millis(50));
    }
  }

  fn reply_wait(&self) -> Duration {
    self.send_timeout + REPLY_GRACE
  }

  /// 关闭会话并等待线程退出，可重复调用
  pub fn shutdown(&mut self) {
    if let Some(shutdown) = self.shutdown.take() {
      let _ = shutdown.send(());
    }
    if let Some(handle) = self.handle.take()
      && handle.join().is_err()
    {
      error!("Bot 会话线程异常退出");
    }
  }
}

impl Drop for DiscordBot {
  fn drop(&mut self) {
    self.shutdown();
  }
}

impl Transport for DiscordBot {
  fn name(&self) -> &'static str {
    "bot"
  }

  fn send(&self, alert: &AlertEvent) -> Result<(), TransportError> {
    if self.state() != SessionState::Connected {
      return Err(TransportError::ChannelNotReady);
    }

    let image = alert.snapshot.as_ref().map(|s| s.read()).transpose()?;
    let mut content = alert.message.clone();
    if !alert.details.is_empty() {
      content.push('\n');
      content.push_str(&alert.details.join("\n"));
    }

    let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
    self
      .requests
      .try_send(SendRequest {
        content,
        image,
        reply: reply_tx,
      })
      .map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => TransportError::Busy,
        mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
      })?;

    match reply_rx.recv_timeout(self.reply_wait()) {
      Ok(result) => result,
      Err(std_mpsc::RecvTimeoutError::Timeout) => Err(TransportError::Timeout(self.reply_wait())),
      Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
    }
  }
}

fn set_state(state: &Mutex<SessionState>, next: SessionState) {
  let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
  if *guard != next {
    debug!("Bot 会话状态: {:?} -> {:?}", *guard, next);
    *guard = next;
  }
}

async fn run_session(
  config: DiscordBotConfig,
  client: Client,
  state: Arc<Mutex<SessionState>>,
  mut requests: mpsc::Receiver<SendRequest>,
  mut shutdown: oneshot::Receiver<()>,
) {
  // 连接阶段
  loop {
    set_state(&state, SessionState::Connecting);
    let connected = tokio::select! {
      _ = &mut shutdown => {
        set_state(&state, SessionState::Disconnected);
        return;
      }
      result = connect(&client, &config) => result,
    };

    match connected {
      Ok(description) => {
        set_state(&state, SessionState::Connected);
        info!("Bot 已连接: {}", description);
        break;
      }
      Err(e) => {
        set_state(&state, SessionState::Disconnected);
        warn!(
          "Bot 连接失败: {}，{:?} 后重试",
          e, config.retry_interval
        );
      }
    }

    let retry = tokio::time::sleep(config.retry_interval);
    tokio::pin!(retry);
    loop {
      tokio::select! {
        _ = &mut shutdown => return,
        _ = &mut retry => break,
        request = requests.recv() => match request {
          Some(request) => {
            let _ = request.reply.send(Err(TransportError::ChannelNotReady));
          }
          None => return,
        },
      }
    }
  }

  // 已连接，处理发送请求
  loop {
    tokio::select! {
      _ = &mut shutdown => break,
      request = requests.recv() => match request {
        Some(request) => {
          let result = post_message(&client, &config, request.content, request.image).await;
          if let Err(e) = &result {
            warn!("Bot 发送失败: {}", e);
          }
          let _ = request.reply.send(result);
        }
        None => break,
      },
    }
  }

  set_state(&state, SessionState::Disconnected);
  info!("Bot 会话已关闭");
}

async fn get_json(client: &Client, config: &DiscordBotConfig, path: &str) -> Result<Value, TransportError> {
  let response = client
    .get(config.url(path))
    .header(AUTHORIZATION, config.authorization())
    .send()
    .await?;
  let status = response.status();
  if !status.is_success() {
    let body = response.text().await.unwrap_or_default();
    return Err(TransportError::Status {
      status: status.as_u16(),
      body,
    });
  }
  Ok(response.json::<Value>().await?)
}

async fn connect(client: &Client, config: &DiscordBotConfig) -> Result<String, TransportError> {
  let me = get_json(client, config, "/users/@me").await?;
  let channel = get_json(client, config, &format!("/channels/{}", config.channel_id)).await?;
  Ok(format!(
    "{} -> #{}",
    me["username"].as_str().unwrap_or("?"),
    channel["name"].as_str().unwrap_or(&config.channel_id)
  ))
}

async fn post_message(
  client: &Client,
  config: &DiscordBotConfig,
  content: String,
  image: Option<Vec<u8>>,
) -> Result<(), TransportError> {
  let url = config.url(&format!("/channels/{}/messages", config.channel_id));
  let request = client
    .post(url)
    .header(AUTHORIZATION, config.authorization());

  let request = match image {
    Some(bytes) => {
      let payload = json!({
        "content": content,
        "attachments": [{ "id": 0, "filename": ATTACHMENT_NAME }],
      });
      let part = multipart::Part::bytes(bytes)
        .file_name(ATTACHMENT_NAME)
        .mime_str("image/jpeg")?;
      let form = multipart::Form::new()
        .text("payload_json", serde_json::to_string(&payload)?)
        .part("files[0]", part);
      request.multipart(form)
    }
    None => request.json(&json!({ "content": content })),
  };

  let response = request.send().await?;
  let status = response.status();
  if !status.is_success() {
    let body = response.text().await.unwrap_or_default();
    return Err(TransportError::Status {
      status: status.as_u16(),
      body,
    });
  }

  info!("Bot 报警已发送");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alert::{AlertKind, Snapshot, test_http};
  use chrono::Local;
  use image::RgbImage;

  fn unreachable_config() -> DiscordBotConfig {
    DiscordBotConfig {
      api_base: "http://127.0.0.1:9/api".to_string(),
      send_timeout: Duration::from_secs(1),
      retry_interval: Duration::from_secs(60),
      ..DiscordBotConfig::new("token", "42")
    }
  }

  #[test]
  fn urls_join_the_api_base() {
    let config = DiscordBotConfig {
      api_base: "http://localhost/api/".to_string(),
      ..DiscordBotConfig::new("abc", "7")
    };
    assert_eq!(config.url("/users/@me"), "http://localhost/api/users/@me");
    assert_eq!(config.authorization(), "Bot abc");
  }

  #[test]
  fn refuses_to_send_before_connected() {
    let mut bot = DiscordBot::start(unreachable_config()).unwrap();
    assert!(!bot.wait_until_connected(Duration::from_millis(200)));
    assert_ne!(bot.state(), SessionState::Connected);

    let alert = AlertEvent::new(AlertKind::Fire, vec!["Fire 0.90".into()], None);
    assert!(matches!(
      bot.send(&alert),
      Err(TransportError::ChannelNotReady)
    ));

    // 重试等待中也能及时关闭
    bot.shutdown();
    assert_eq!(bot.state(), SessionState::Disconnected);
  }

  #[test]
  fn caller_waits_longer_than_the_http_client() {
    let mut bot = DiscordBot::start(unreachable_config()).unwrap();
    assert!(bot.reply_wait() > bot.send_timeout);
    bot.shutdown();
  }

  #[test]
  fn connects_then_posts_to_the_channel() {
    let server = test_http::serve(vec![
      (200, r#"{"username":"fengyan"}"#),
      (200, r#"{"name":"alerts"}"#),
      (200, "{}"),
    ]);
    let mut bot = DiscordBot::start(DiscordBotConfig {
      api_base: format!("{}/api", server.base_url),
      send_timeout: Duration::from_secs(5),
      ..DiscordBotConfig::new("secret", "42")
    })
    .unwrap();
    assert!(bot.wait_until_connected(Duration::from_secs(5)));

    let dir = tempfile::tempdir().unwrap();
    let snapshot = Snapshot::write(dir.path(), &RgbImage::new(8, 8), Local::now()).unwrap();
    let alert = AlertEvent::new(AlertKind::Fire, vec!["Fire 0.90".into()], Some(snapshot));
    bot.send(&alert).unwrap();
    bot.shutdown();

    let requests = server.finish();
    let lines: Vec<_> = requests.iter().map(|r| r.request_line.as_str()).collect();
    assert_eq!(
      lines,
      vec![
        "GET /api/users/@me HTTP/1.1",
        "GET /api/channels/42 HTTP/1.1",
        "POST /api/channels/42/messages HTTP/1.1",
      ]
    );
    assert!(requests.iter().all(|r| r.header("authorization") == Some("Bot secret")));
    let body = String::from_utf8_lossy(&requests[2].body);
    assert!(body.contains("name=\"payload_json\""));
    assert!(body.contains("name=\"files[0]\""));
    assert!(body.contains("filename=\"detection.jpg\""));
    assert!(body.contains("Fire Detected!"));
  }
}
