// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/alert/webhook.rs - Discord Webhook 通道
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

use reqwest::blocking::{Client, multipart};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::alert::{AlertEvent, Transport, TransportError};

/// 附件在消息中的文件名
pub const ATTACHMENT_NAME: &str = "detection.jpg";

/// 无状态的 Webhook 通道，每次发送一个 POST
pub struct DiscordWebhook {
  url: String,
  client: Client,
}

impl DiscordWebhook {
  pub fn new<S: Into<String>>(url: S, timeout: Duration) -> Result<Self, TransportError> {
    let client = Client::builder().timeout(timeout).build()?;
    Ok(Self {
      url: url.into(),
      client,
    })
  }

  /// 生成 Discord 消息体
  pub fn payload(alert: &AlertEvent, with_image: bool) -> Value {
    let mut embed = json!({
      "title": "Detection Details",
      "description": alert.details.join("\n"),
      "color": alert.kind.color(),
    });
    if with_image {
      embed["image"] = json!({ "url": format!("attachment://{}", ATTACHMENT_NAME) });
    }

    json!({
      "content": alert.message,
      "embeds": [embed],
    })
  }
}

impl Transport for DiscordWebhook {
  fn name(&self) -> &'static str {
    "webhook"
  }

  fn send(&self, alert: &AlertEvent) -> Result<(), TransportError> {
    let image = alert.snapshot.as_ref().map(|s| s.read()).transpose()?;
    let payload = Self::payload(alert, image.is_some());

    let request = match image {
      Some(bytes) => {
        debug!("Webhook 附带快照 ({} 字节)", bytes.len());
        let part = multipart::Part::bytes(bytes)
          .file_name(ATTACHMENT_NAME)
          .mime_str("image/jpeg")?;
        let form = multipart::Form::new()
          .text("payload_json", serde_json::to_string(&payload)?)
          .part("file", part);
        self.client.post(&self.url).multipart(form)
      }
      None => self.client.post(&self.url).json(&payload),
    };

    let response = request.send()?;
    let status = response.status();
    if !status.is_success() {
      let body = response.text().unwrap_or_default();
      return Err(TransportError::Status {
        status: status.as_u16(),
        body,
      });
    }

    info!("Webhook 报警已发送: {}", alert.kind.headline());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alert::{AlertKind, test_http};

  fn event(kind: AlertKind) -> AlertEvent {
    AlertEvent::new(kind, vec!["Fire 0.87".into(), "Smoke 0.42".into()], None)
  }

  #[test]
  fn payload_carries_headline_color_and_details() {
    for (kind, color) in [
      (AlertKind::Fire, 0x00FF00),
      (AlertKind::Smoke, 0x0000FF),
      (AlertKind::Both, 0xFFA500),
    ] {
      let alert = event(kind);
      let payload = DiscordWebhook::payload(&alert, false);
      let content = payload["content"].as_str().unwrap();
      assert!(content.starts_with("⚠️ **"));
      assert!(content.contains(kind.headline()));
      let embed = &payload["embeds"][0];
      assert_eq!(embed["title"], "Detection Details");
      assert_eq!(embed["color"], color);
      assert_eq!(embed["description"], "Fire 0.87\nSmoke 0.42");
      assert!(embed.get("image").is_none());
    }
  }

  #[test]
  fn payload_references_attachment_when_image_is_sent() {
    let payload = DiscordWebhook::payload(&event(AlertKind::Fire), true);
    assert_eq!(
      payload["embeds"][0]["image"]["url"],
      "attachment://detection.jpg"
    );
  }

  #[test]
  fn unreachable_endpoint_is_an_error() {
    let webhook = DiscordWebhook::new("http://127.0.0.1:9/webhook", Duration::from_secs(2)).unwrap();
    assert!(matches!(
      webhook.send(&event(AlertKind::Smoke)),
      Err(TransportError::Http(_))
    ));
  }

  #[test]
  fn non_success_status_is_an_error() {
    let server = test_http::serve(vec![(500, "{}")]);
    let webhook = DiscordWebhook::new(server.base_url.clone(), Duration::from_secs(5)).unwrap();

    let result = webhook.send(&event(AlertKind::Fire));
    assert!(matches!(
      result,
      Err(TransportError::Status { status: 500, ref body }) if body == "{}"
    ));

    let requests = server.finish();
    assert_eq!(requests[0].request_line, "POST / HTTP/1.1");
    assert_eq!(requests[0].header("content-type"), Some("application/json"));
  }

  #[test]
  fn snapshot_is_sent_as_multipart_file() {
    let server = test_http::serve(vec![(200, "")]);
    let webhook =
      DiscordWebhook::new(format!("{}/hook", server.base_url), Duration::from_secs(5)).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let snapshot = crate::alert::Snapshot::write(
      dir.path(),
      &image::RgbImage::new(8, 8),
      chrono::Local::now(),
    )
    .unwrap();
    let alert = AlertEvent::new(AlertKind::Smoke, vec!["Smoke 0.66".into()], Some(snapshot));

    webhook.send(&alert).unwrap();

    let requests = server.finish();
    let body = String::from_utf8_lossy(&requests[0].body);
    assert!(body.contains("name=\"payload_json\""));
    assert!(body.contains("name=\"file\"; filename=\"detection.jpg\""));
    assert!(body.contains("attachment://detection.jpg"));
  }
}
