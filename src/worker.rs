// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/worker.rs - 后台运行线程与结果投递
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

//! 每次运行占用一个命名线程，展示端通过单槽 [`Mailbox`] 读取最新结果。

use std::{
  sync::{
    Arc, Condvar, Mutex, MutexGuard,
    atomic::{AtomicBool, Ordering},
  },
  thread::JoinHandle,
  time::Duration,
};

use image::RgbImage;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum WorkerError {
  #[error("无法创建工作线程: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("工作线程 {name} 异常退出: {message}")]
  Panicked { name: String, message: String },
}

/// 获取锁，忽略其他线程 panic 留下的中毒标记
pub fn acquire<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 协作式停止信号
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn stop(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_stopped(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// 单槽投递箱，新值覆盖未读取的旧值
#[derive(Debug)]
pub struct Mailbox<T> {
  slot: Mutex<Option<T>>,
  ready: Condvar,
}

impl<T> Default for Mailbox<T> {
  fn default() -> Self {
    Self {
      slot: Mutex::new(None),
      ready: Condvar::new(),
    }
  }
}

impl<T> Mailbox<T> {
  pub fn new() -> Self {
    Self::default()
  }

  /// 放入新值，返回被覆盖的旧值
  pub fn post(&self, value: T) -> Option<T> {
    let previous = acquire(&self.slot).replace(value);
    self.ready.notify_all();
    previous
  }

  pub fn take(&self) -> Option<T> {
    acquire(&self.slot).take()
  }

  pub fn is_empty(&self) -> bool {
    acquire(&self.slot).is_none()
  }

  /// 等待至多 `timeout` 取出一个值
  pub fn wait_take(&self, timeout: Duration) -> Option<T> {
    let guard = acquire(&self.slot);
    let (mut guard, _) = self
      .ready
      .wait_timeout_while(guard, timeout, |slot| slot.is_none())
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.take()
  }
}

/// 最近一帧处理结果
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
  pub frame_index: u64,
  pub image: RgbImage,
  pub objects: Vec<String>,
}

/// 运行状态
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
  Running {
    frame_index: u64,
    processed: u64,
  },
  Finished {
    processed: u64,
    total: u64,
    cancelled: bool,
  },
  Failed(String),
}

/// 工作线程向展示端发布结果的通道
#[derive(Debug, Default)]
pub struct RunMonitor {
  pub frames: Mailbox<FrameSnapshot>,
  pub status: Mailbox<RunStatus>,
}

impl RunMonitor {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "未知错误".to_string()
  }
}

/// 一次运行对应的后台线程
pub struct Worker<T> {
  name: String,
  stop: StopSignal,
  handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> Worker<T> {
  pub fn spawn<F>(name: &str, run: F) -> Result<Self, WorkerError>
  where
    F: FnOnce(StopSignal) -> T + Send + 'static,
  {
    Self::spawn_with_signal(name, StopSignal::new(), run)
  }

  pub fn spawn_with_signal<F>(name: &str, stop: StopSignal, run: F) -> Result<Self, WorkerError>
  where
    F: FnOnce(StopSignal) -> T + Send + 'static,
  {
    let signal = stop.clone();
    let handle = std::thread::Builder::new()
      .name(name.to_string())
      .spawn(move || run(signal))?;
    info!("工作线程已启动: {}", name);
    Ok(Self {
      name: name.to_string(),
      stop,
      handle: Some(handle),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn stop_signal(&self) -> &StopSignal {
    &self.stop
  }

  pub fn stop(&self) {
    self.stop.stop();
  }

  pub fn is_finished(&self) -> bool {
    self
      .handle
      .as_ref()
      .map(JoinHandle::is_finished)
      .unwrap_or(true)
  }

  /// 等待线程结束
  pub fn join(mut self) -> Result<T, WorkerError> {
    self.join_inner()
  }

  fn join_inner(&mut self) -> Result<T, WorkerError> {
    let Some(handle) = self.handle.take() else {
      return Err(WorkerError::Panicked {
        name: self.name.clone(),
        message: "线程已被回收".to_string(),
      });
    };
    handle.join().map_err(|payload| WorkerError::Panicked {
      name: self.name.clone(),
      message: panic_message(payload),
    })
  }
}

impl<T> Drop for Worker<T> {
  fn drop(&mut self) {
    if let Some(handle) = self.handle.take() {
      self.stop.stop();
      if handle.join().is_err() {
        warn!("工作线程 {} 异常退出", self.name);
      }
    }
  }
}

/// 至多持有一个活动的运行
pub struct MediaSession<T> {
  active: Option<Worker<T>>,
}

impl<T> Default for MediaSession<T> {
  fn default() -> Self {
    Self { active: None }
  }
}

impl<T: Send + 'static> MediaSession<T> {
  pub fn new() -> Self {
    Self::default()
  }

  /// 停止并回收上一次运行后启动新的运行，返回上一次运行的结果
  pub fn start<F>(&mut self, name: &str, run: F) -> Result<Option<T>, WorkerError>
  where
    F: FnOnce(StopSignal) -> T + Send + 'static,
  {
    let previous = self.stop();
    self.active = Some(Worker::spawn(name, run)?);
    Ok(previous)
  }

  /// 停止当前运行并等待其退出
  pub fn stop(&mut self) -> Option<T> {
    let worker = self.active.take()?;
    worker.stop();
    let name = worker.name().to_string();
    match worker.join() {
      Ok(output) => {
        info!("工作线程已回收: {}", name);
        Some(output)
      }
      Err(e) => {
        error!("{}", e);
        None
      }
    }
  }

  /// 等待当前运行自然结束
  pub fn wait(&mut self) -> Option<T> {
    let worker = self.active.take()?;
    match worker.join() {
      Ok(output) => Some(output),
      Err(e) => {
        error!("{}", e);
        None
      }
    }
  }

  pub fn is_running(&self) -> bool {
    self
      .active
      .as_ref()
      .map(|worker| !worker.is_finished())
      .unwrap_or(false)
  }

  pub fn stop_signal(&self) -> Option<StopSignal> {
    self.active.as_ref().map(|worker| worker.stop_signal().clone())
  }
}
