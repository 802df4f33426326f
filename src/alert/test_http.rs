// 该文件是 Fengyan （烽烟） 项目的一部分。
// src/alert/test_http.rs - 测试用 HTTP 服务
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

//! 按顺序回放预设响应的本地 HTTP 服务，每个连接处理一个请求。

use std::{
  io::{ErrorKind, Read, Write},
  net::{TcpListener, TcpStream},
  thread::JoinHandle,
  time::{Duration, Instant},
};

const ACCEPT_DEADLINE: Duration = Duration::from_secs(10);

pub struct Recorded {
  pub request_line: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Recorded {
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

pub struct TestServer {
  pub base_url: String,
  handle: JoinHandle<Vec<Recorded>>,
}

impl TestServer {
  /// 等待服务线程结束，返回收到的请求
  pub fn finish(self) -> Vec<Recorded> {
    self.handle.join().unwrap()
  }
}

pub fn serve(responses: Vec<(u16, &'static str)>) -> TestServer {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  listener.set_nonblocking(true).unwrap();
  let base_url = format!("http://{}", listener.local_addr().unwrap());

  let handle = std::thread::spawn(move || {
    let deadline = Instant::now() + ACCEPT_DEADLINE;
    let mut recorded = Vec::new();
    for (status, body) in responses {
      let mut stream = loop {
        match listener.accept() {
          Ok((stream, _)) => break stream,
          Err(e) if e.kind() == ErrorKind::WouldBlock && Instant::now() < deadline => {
            std::thread::sleep(Duration::from_millis(10));
          }
          Err(_) => return recorded,
        }
      };
      stream.set_nonblocking(false).unwrap();
      stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
      let Some(request) = read_request(&mut stream) else {
        return recorded;
      };
      recorded.push(request);
      let response = format!(
        "HTTP/1.1 {} Test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
      );
      let _ = stream.write_all(response.as_bytes());
    }
    recorded
  });

  TestServer { base_url, handle }
}

fn read_request(stream: &mut TcpStream) -> Option<Recorded> {
  let mut data = Vec::new();
  let mut chunk = [0u8; 4096];
  let header_end = loop {
    if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
      break pos + 4;
    }
    let n = stream.read(&mut chunk).ok()?;
    if n == 0 {
      return None;
    }
    data.extend_from_slice(&chunk[..n]);
  };

  let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
  let mut lines = head.split("\r\n");
  let request_line = lines.next()?.to_string();
  let headers: Vec<(String, String)> = lines
    .filter_map(|l| l.split_once(':'))
    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
    .collect();
  let mut request = Recorded {
    request_line,
    headers,
    body: data[header_end..].to_vec(),
  };

  let length = request
    .header("content-length")
    .and_then(|v| v.parse::<usize>().ok());
  let chunked = request
    .header("transfer-encoding")
    .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
  loop {
    let complete = match length {
      Some(length) => request.body.len() >= length,
      None if chunked => request.body.ends_with(b"0\r\n\r\n"),
      None => true,
    };
    if complete {
      break;
    }
    let n = stream.read(&mut chunk).ok()?;
    if n == 0 {
      break;
    }
    request.body.extend_from_slice(&chunk[..n]);
  }

  Some(request)
}
