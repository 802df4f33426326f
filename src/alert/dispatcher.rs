// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/alert/dispatcher.rs - 报警分发与后台线程
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
  sync::{
    Arc, Mutex,
    mpsc::{Receiver, SyncSender, TrySendError, sync_channel},
  },
  thread::JoinHandle,
  time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::alert::{AlertEvent, CooldownGate, Transport, TransportError};

#[derive(Debug)]
pub enum DispatchResult {
  Sent,
  Suppressed,
  Failed(TransportError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
  pub sent: u64,
  pub suppressed: u64,
  pub failed: u64,
  /// 队列满或线程已停止而丢弃的事件
  pub dropped: u64,
}

/// 报警分发器
///
/// 冷却门在 `may_fire` → 发送 → `record_fire` 整个过程中保持加锁，
/// 两个并发报警不会同时通过。发送失败不更新冷却时间。
/// 不论结果如何，事件携带的快照在 `dispatch` 返回前都会被删除。
pub struct AlertDispatcher<T: Transport> {
  transport: T,
  gate: Arc<Mutex<CooldownGate>>,
  stats: Mutex<DispatchStats>,
}

impl<T: Transport> AlertDispatcher<T> {
  pub fn new(transport: T, cooldown: Duration) -> Self {
    Self {
      transport,
      gate: Arc::new(Mutex::new(CooldownGate::new(cooldown))),
      stats: Mutex::new(DispatchStats::default()),
    }
  }

  pub fn gate(&self) -> Arc<Mutex<CooldownGate>> {
    self.gate.clone()
  }

  pub fn stats(&self) -> DispatchStats {
    *self.stats.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn transport(&self) -> &T {
    &self.transport
  }

  pub fn dispatch(&self, event: AlertEvent) -> DispatchResult {
    let result = self.dispatch_inner(&event);
    // 快照随事件一起释放
    drop(event);

    let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
    match &result {
      DispatchResult::Sent => stats.sent += 1,
      DispatchResult::Suppressed => stats.suppressed += 1,
      DispatchResult::Failed(_) => stats.failed += 1,
    }
    result
  }

  fn dispatch_inner(&self, event: &AlertEvent) -> DispatchResult {
    let mut gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
    if !gate.may_fire(event.instant) {
      debug!(
        "冷却中，跳过报警 {}（剩余 {:?}）",
        event.kind.headline(),
        gate.remaining(event.instant)
      );
      return DispatchResult::Suppressed;
    }

    match self.transport.send(event) {
      Ok(()) => {
        gate.record_fire(event.instant);
        info!(
          "报警已通过 {} 发送: {}",
          self.transport.name(),
          event.message
        );
        DispatchResult::Sent
      }
      Err(e) => {
        error!("通过 {} 发送报警失败: {}", self.transport.name(), e);
        DispatchResult::Failed(e)
      }
    }
  }
}

/// 后台报警线程
///
/// 检测循环只调用非阻塞的 `submit`，慢速网络不会拖住取帧。
pub struct AlertWorker {
  sender: Option<SyncSender<AlertEvent>>,
  handle: Option<JoinHandle<DispatchStats>>,
  dropped: u64,
}

impl AlertWorker {
  pub fn spawn<T: Transport + 'static>(
    dispatcher: AlertDispatcher<T>,
    queue_size: usize,
  ) -> std::io::Result<Self> {
    let (sender, receiver) = sync_channel(queue_size.max(1));
    let handle = std::thread::Builder::new()
      .name("alert-worker".to_string())
      .spawn(move || Self::run(dispatcher, receiver))?;
    Ok(Self {
      sender: Some(sender),
      handle: Some(handle),
      dropped: 0,
    })
  }

  fn run<T: Transport>(dispatcher: AlertDispatcher<T>, receiver: Receiver<AlertEvent>) -> DispatchStats {
    info!("报警线程启动，通道: {}", dispatcher.transport().name());
    for event in receiver {
      dispatcher.dispatch(event);
    }
    let stats = dispatcher.stats();
    info!("报警线程退出");
    stats
  }

  /// 提交事件，不阻塞；队列满或线程已退出时丢弃事件并删除快照
  pub fn submit(&mut self, event: AlertEvent) -> bool {
    let Some(sender) = &self.sender else {
      self.dropped += 1;
      return false;
    };
    match sender.try_send(event) {
      Ok(()) => true,
      Err(TrySendError::Full(event)) => {
        warn!("报警队列已满，丢弃 {}", event.kind.headline());
        self.dropped += 1;
        false
      }
      Err(TrySendError::Disconnected(event)) => {
        warn!("报警线程已停止，丢弃 {}", event.kind.headline());
        self.dropped += 1;
        false
      }
    }
  }

  /// 关闭队列，处理完已排队的事件后返回统计
  pub fn shutdown(mut self) -> DispatchStats {
    self.finish()
  }

  fn finish(&mut self) -> DispatchStats {
    self.sender.take();
    let mut stats = match self.handle.take().map(JoinHandle::join) {
      Some(Ok(stats)) => stats,
      Some(Err(_)) => {
        error!("报警线程异常退出");
        DispatchStats::default()
      }
      None => DispatchStats::default(),
    };
    stats.dropped = self.dropped;
    info!(
      "报警统计: 发送 {}，冷却跳过 {}，失败 {}，丢弃 {}",
      stats.sent, stats.suppressed, stats.failed, stats.dropped
    );
    stats
  }
}

impl Drop for AlertWorker {
  fn drop(&mut self) {
    if self.handle.is_some() {
      self.finish();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alert::{AlertKind, Snapshot};
  use chrono::Local;
  use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Instant,
  };

  #[derive(Default)]
  struct MockTransport {
    fail: AtomicBool,
    calls: AtomicUsize,
    saw_snapshot: AtomicBool,
  }

  impl Transport for Arc<MockTransport> {
    fn name(&self) -> &'static str {
      "mock"
    }

    fn send(&self, alert: &AlertEvent) -> Result<(), TransportError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if let Some(path) = alert.snapshot_path() {
        self.saw_snapshot.store(path.exists(), Ordering::SeqCst);
      }
      if self.fail.load(Ordering::SeqCst) {
        Err(TransportError::ChannelNotReady)
      } else {
        Ok(())
      }
    }
  }

  fn snapshot(dir: &Path, name: &str) -> (Snapshot, PathBuf) {
    let path = dir.join(name);
    std::fs::write(&path, b"jpeg").unwrap();
    (Snapshot::adopt(&path), path)
  }

  fn event_at(instant: Instant, snapshot: Option<Snapshot>) -> AlertEvent {
    AlertEvent::at(
      AlertKind::Fire,
      vec!["Fire 0.90".into()],
      snapshot,
      Local::now(),
      instant,
    )
  }

  #[test]
  fn cooldown_scenario_deletes_every_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::default());
    let dispatcher = AlertDispatcher::new(transport.clone(), Duration::from_secs(300));
    let t0 = Instant::now();

    let (s0, p0) = snapshot(dir.path(), "t0.jpg");
    assert!(matches!(
      dispatcher.dispatch(event_at(t0, Some(s0))),
      DispatchResult::Sent
    ));
    assert!(transport.saw_snapshot.load(Ordering::SeqCst));
    assert!(!p0.exists());

    let (s1, p1) = snapshot(dir.path(), "t299.jpg");
    assert!(matches!(
      dispatcher.dispatch(event_at(t0 + Duration::from_secs(299), Some(s1))),
      DispatchResult::Suppressed
    ));
    assert!(!p1.exists());
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

    let t300 = t0 + Duration::from_secs(300);
    let (s2, p2) = snapshot(dir.path(), "t300.jpg");
    assert!(matches!(
      dispatcher.dispatch(event_at(t300, Some(s2))),
      DispatchResult::Sent
    ));
    assert!(!p2.exists());
    assert_eq!(dispatcher.gate().lock().unwrap().last_fire(), Some(t300));

    assert_eq!(
      dispatcher.stats(),
      DispatchStats {
        sent: 2,
        suppressed: 1,
        failed: 0,
        dropped: 0
      }
    );
  }

  #[test]
  fn failed_send_keeps_cooldown_and_deletes_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::default());
    transport.fail.store(true, Ordering::SeqCst);
    let dispatcher = AlertDispatcher::new(transport.clone(), Duration::from_secs(300));
    let t0 = Instant::now();

    let (s, p) = snapshot(dir.path(), "fail.jpg");
    assert!(matches!(
      dispatcher.dispatch(event_at(t0, Some(s))),
      DispatchResult::Failed(TransportError::ChannelNotReady)
    ));
    assert!(!p.exists());
    assert_eq!(dispatcher.gate().lock().unwrap().last_fire(), None);

    // 失败后下一次仍可立即发送
    transport.fail.store(false, Ordering::SeqCst);
    assert!(matches!(
      dispatcher.dispatch(event_at(t0 + Duration::from_secs(1), None)),
      DispatchResult::Sent
    ));
    assert_eq!(dispatcher.stats().failed, 1);
  }

  #[test]
  fn worker_drains_queue_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::default());
    let dispatcher = AlertDispatcher::new(transport.clone(), Duration::from_secs(300));
    let mut worker = AlertWorker::spawn(dispatcher, 8).unwrap();

    let t0 = Instant::now();
    let mut paths = vec![];
    for i in 0..3u64 {
      let (s, p) = snapshot(dir.path(), &format!("{}.jpg", i));
      paths.push(p);
      assert!(worker.submit(event_at(t0 + Duration::from_secs(i), Some(s))));
    }

    let stats = worker.shutdown();
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.suppressed, 2);
    assert!(paths.iter().all(|p| !p.exists()));
  }

  struct Blocking(Arc<AtomicBool>);

  impl Transport for Blocking {
    fn name(&self) -> &'static str {
      "blocking"
    }

    fn send(&self, _: &AlertEvent) -> Result<(), TransportError> {
      while !self.0.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(5));
      }
      Ok(())
    }
  }

  #[test]
  fn worker_drops_events_when_full_and_deletes_their_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let release = Arc::new(AtomicBool::new(false));
    let dispatcher = AlertDispatcher::new(Blocking(release.clone()), Duration::ZERO);
    let mut worker = AlertWorker::spawn(dispatcher, 1).unwrap();

    let mut accepted = 0;
    let mut dropped_paths = vec![];
    for i in 0..20 {
      let (s, p) = snapshot(dir.path(), &format!("q{}.jpg", i));
      if worker.submit(event_at(Instant::now(), Some(s))) {
        accepted += 1;
      } else {
        assert!(!p.exists());
        dropped_paths.push(p);
      }
    }
    // 一个在发送中，一个在队列中
    assert!(accepted <= 2);
    assert!(!dropped_paths.is_empty());

    release.store(true, Ordering::SeqCst);
    let stats = worker.shutdown();
    assert_eq!(stats.sent as usize, accepted);
    assert_eq!(stats.dropped as usize, dropped_paths.len());
  }
}
