// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/task.rs - 帧调度任务
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
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  time::Instant,
};

use image::RgbImage;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl,
  input::{InputError, InputSource, InputWrapper},
  model::{DetectResult, Model},
  output::{OutputError, OutputWriter},
  pipeline::{FilterPipeline, PipelineError, PreparedQuery},
  resolver::TextClassifier,
  summary::{ProcessingSummary, SummaryError},
  worker::{FrameSnapshot, MediaSession, RunMonitor, RunStatus, StopSignal, WorkerError, acquire},
};

#[derive(Error, Debug)]
pub enum TaskError {
  #[error("无法打开输入源 {location}: {source}")]
  SourceUnavailable {
    location: String,
    #[source]
    source: InputError,
  },
  #[error("读取第 {frame_index} 帧失败: {source}")]
  Capture {
    frame_index: u64,
    #[source]
    source: InputError,
    /// 出错前已经处理的部分
    summary: Option<Box<ProcessingSummary>>,
  },
  #[error("写入输出失败: {path}: {source}")]
  Output {
    path: String,
    #[source]
    source: OutputError,
    summary: Option<Box<ProcessingSummary>>,
  },
  #[error(transparent)]
  Pipeline(#[from] PipelineError),
  #[error(transparent)]
  Summary(#[from] SummaryError),
  #[error("输入源没有任何帧")]
  NoFrame,
  #[error("帧间隔必须大于 0")]
  InvalidFrameSkip,
}

pub type RunResult = Result<ProcessingSummary, TaskError>;

impl TaskError {
  /// 运行中途出错时已结束的部分摘要
  pub fn partial_summary(&self) -> Option<&ProcessingSummary> {
    match self {
      TaskError::Capture { summary, .. } | TaskError::Output { summary, .. } => summary.as_deref(),
      _ => None,
    }
  }

  fn with_summary(self, partial: ProcessingSummary) -> Self {
    match self {
      TaskError::Capture {
        frame_index,
        source,
        ..
      } => TaskError::Capture {
        frame_index,
        source,
        summary: Some(Box::new(partial)),
      },
      TaskError::Output { path, source, .. } => TaskError::Output {
        path,
        source,
        summary: Some(Box::new(partial)),
      },
      other => other,
    }
  }
}

/// 打开输入源，失败时返回 [`TaskError::SourceUnavailable`]
pub fn open_source(location: &Url) -> Result<InputWrapper, TaskError> {
  InputWrapper::from_url(location).map_err(|source| {
    error!("无法打开输入源 {}: {}", location, source);
    TaskError::SourceUnavailable {
      location: location.to_string(),
      source,
    }
  })
}

pub trait Task<I, P, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, pipeline: P, output: O) -> Result<Self::Output, Self::Error>;
}

fn write<O: OutputWriter>(output: &mut O, image: &RgbImage) -> Result<(), TaskError> {
  output.write_frame(image).map_err(|source| TaskError::Output {
    path: output.path().to_string(),
    source,
    summary: None,
  })
}

fn finish<O: OutputWriter>(output: &mut O) -> Result<(), TaskError> {
  output.finish().map_err(|source| TaskError::Output {
    path: output.path().to_string(),
    source,
    summary: None,
  })
}

/// 单张图像的处理结果
#[derive(Debug, Clone)]
pub struct ImageReport {
  pub detections: DetectResult,
  pub objects: Vec<String>,
  pub found: usize,
  pub annotated: RgbImage,
  pub saved: bool,
}

/// 单张图像任务，流水线错误直接返回
pub struct OneShotTask {
  query: String,
}

impl OneShotTask {
  pub fn new(query: impl Into<String>) -> Self {
    Self {
      query: query.into(),
    }
  }
}

impl<'p, I, O, M, C> Task<I, &'p FilterPipeline<M, C>, O> for OneShotTask
where
  I: InputSource,
  O: OutputWriter,
  M: Model<Input = RgbImage, Output = DetectResult>,
  M::Error: std::error::Error + Send + Sync + 'static,
  C: TextClassifier,
{
  type Output = ImageReport;
  type Error = TaskError;

  fn run_task(
    self,
    mut input: I,
    pipeline: &'p FilterPipeline<M, C>,
    mut output: O,
  ) -> Result<Self::Output, Self::Error> {
    info!("开始任务: \"{}\"", self.query);
    let frame = match input.next() {
      Some(Ok(frame)) => frame,
      Some(Err(source)) => {
        return Err(TaskError::Capture {
          frame_index: 0,
          source,
          summary: None,
        });
      }
      None => return Err(TaskError::NoFrame),
    };

    let now = Instant::now();
    let result = pipeline.run(&frame.image, &self.query)?;
    info!("处理完成，耗时: {:.2?}", now.elapsed());

    let objects = pipeline.object_names(&result.detections);
    let saved = !result.is_empty();
    if saved {
      write(&mut output, &result.annotated)?;
      info!("找到 {} 个目标: {:?}，结果保存到 {}", objects.len(), objects, output.path());
    } else {
      info!("没有找到符合查询的目标");
    }
    finish(&mut output)?;

    Ok(ImageReport {
      found: objects.len(),
      objects,
      detections: result.detections,
      annotated: result.annotated,
      saved,
    })
  }
}

/// 有限长度视频任务
///
/// 第 `i` 帧在 `i % frame_skip == 0` 且已处理帧数小于 `max_frames` 时处理，
/// 其余帧原样写入，输出始终包含全部输入帧。
pub struct BoundedTask {
  query: String,
  frame_skip: u64,
  max_frames: Option<u64>,
  source_name: String,
  stop: StopSignal,
  monitor: Option<Arc<RunMonitor>>,
}

impl BoundedTask {
  pub fn new(query: impl Into<String>, frame_skip: u64) -> Result<Self, TaskError> {
    if frame_skip == 0 {
      return Err(TaskError::InvalidFrameSkip);
    }
    Ok(Self {
      query: query.into(),
      frame_skip,
      max_frames: None,
      source_name: String::new(),
      stop: StopSignal::new(),
      monitor: None,
    })
  }

  pub fn with_max_frames(mut self, max_frames: Option<u64>) -> Self {
    self.max_frames = max_frames;
    self
  }

  pub fn with_source_name(mut self, source_name: impl Into<String>) -> Self {
    self.source_name = source_name.into();
    self
  }

  pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
    self.stop = stop;
    self
  }

  pub fn with_monitor(mut self, monitor: Arc<RunMonitor>) -> Self {
    self.monitor = Some(monitor);
    self
  }

  /// 在会话的工作线程中运行，工作线程在整个运行期间持有流水线锁
  pub fn spawn<I, O, M, C>(
    self,
    session: &mut MediaSession<RunResult>,
    pipeline: Arc<Mutex<FilterPipeline<M, C>>>,
    input: I,
    output: O,
  ) -> Result<Option<RunResult>, WorkerError>
  where
    I: InputSource + 'static,
    O: OutputWriter + 'static,
    M: Model<Input = RgbImage, Output = DetectResult> + Send + 'static,
    M::Error: std::error::Error + Send + Sync + 'static,
    C: TextClassifier + Send + 'static,
  {
    session.start("gozcu-video", move |stop| {
      let pipeline = acquire(&pipeline);
      self.with_stop_signal(stop).run_task(input, &*pipeline, output)
    })
  }
}

/// 帧循环共用的状态
struct RunLoop<'a, M, C> {
  pipeline: &'a FilterPipeline<M, C>,
  prepared: PreparedQuery,
  summary: ProcessingSummary,
  monitor: Option<Arc<RunMonitor>>,
}

impl<M, C> RunLoop<'_, M, C>
where
  M: Model<Input = RgbImage, Output = DetectResult>,
  M::Error: std::error::Error + Send + Sync + 'static,
  C: TextClassifier,
{
  /// 处理一帧，失败时记录日志并返回原图
  fn process(&mut self, frame_index: u64, image: RgbImage) -> RgbImage {
    match self.pipeline.run_prepared(&image, &self.prepared) {
      Ok(result) => {
        let objects = self.pipeline.object_names(&result.detections);
        if !objects.is_empty() {
          info!("第 {} 帧: {:?}", frame_index, objects);
        }
        self.summary.record_processed(frame_index, objects);
        result.annotated
      }
      Err(e) => {
        warn!("第 {} 帧处理失败，原样输出: {}", frame_index, e);
        image
      }
    }
  }

  fn publish(&self, frame_index: u64, image: &RgbImage, processed: bool) {
    let Some(monitor) = &self.monitor else {
      return;
    };
    let objects = match self.summary.frames.last() {
      Some(last) if processed && last.frame_index == frame_index => last.objects.clone(),
      _ => Vec::new(),
    };
    monitor.frames.post(FrameSnapshot {
      frame_index,
      image: image.clone(),
      objects,
    });
    monitor.status.post(RunStatus::Running {
      frame_index,
      processed: self.summary.processed_frames,
    });
  }

  /// 关闭输出并结束摘要
  fn close<O: OutputWriter>(
    mut self,
    output: &mut O,
    outcome: Result<(), TaskError>,
    cancelled: bool,
  ) -> RunResult {
    let finished = finish(output);
    let result = outcome.and(finished);

    if let Some(monitor) = &self.monitor {
      monitor.status.post(match &result {
        Ok(()) => RunStatus::Finished {
          processed: self.summary.processed_frames,
          total: self.summary.total_frames,
          cancelled,
        },
        Err(e) => RunStatus::Failed(e.to_string()),
      });
    }

    if let Err(e) = result {
      self.summary.fail(&e);
      warn!(
        "任务中止: 已处理 {} / {} 帧",
        self.summary.processed_frames, self.summary.total_frames
      );
      return Err(e.with_summary(self.summary));
    }

    self.summary.finalize(cancelled);
    info!(
      "任务结束: 处理 {} / {} 帧{}",
      self.summary.processed_frames,
      self.summary.total_frames,
      if cancelled { "（已取消）" } else { "" }
    );
    Ok(self.summary)
  }
}

impl<'p, I, O, M, C> Task<I, &'p FilterPipeline<M, C>, O> for BoundedTask
where
  I: InputSource,
  O: OutputWriter,
  M: Model<Input = RgbImage, Output = DetectResult>,
  M::Error: std::error::Error + Send + Sync + 'static,
  C: TextClassifier,
{
  type Output = ProcessingSummary;
  type Error = TaskError;

  fn run_task(
    self,
    mut input: I,
    pipeline: &'p FilterPipeline<M, C>,
    mut output: O,
  ) -> Result<Self::Output, Self::Error> {
    let metadata = input.metadata();
    info!(
      "开始视频任务: {} ({:?} 帧, 间隔 {}, 上限 {:?})",
      self.source_name, metadata.frame_count, self.frame_skip, self.max_frames
    );

    let mut run = RunLoop {
      pipeline,
      prepared: pipeline.prepare(&self.query),
      summary: ProcessingSummary::start(
        self.source_name.clone(),
        &metadata,
        self.query.clone(),
        self.frame_skip,
        self.max_frames,
      ),
      monitor: self.monitor.clone(),
    };

    let mut frame_index = 0u64;
    let mut cancelled = false;
    let mut outcome = Ok(());
    loop {
      if self.stop.is_stopped() {
        warn!("收到停止信号，结束视频任务");
        cancelled = true;
        break;
      }
      let frame = match input.next() {
        Some(Ok(frame)) => frame,
        Some(Err(source)) => {
          error!("读取第 {} 帧失败: {}", frame_index, source);
          outcome = Err(TaskError::Capture {
            frame_index,
            source,
            summary: None,
          });
          break;
        }
        None => break,
      };
      run.summary.record_frame();

      let within_budget = self
        .max_frames
        .map(|max| run.summary.processed_frames < max)
        .unwrap_or(true);
      let selected = frame_index % self.frame_skip == 0 && within_budget;
      let before = run.summary.processed_frames;
      let image = if selected {
        run.process(frame_index, frame.image)
      } else {
        frame.image
      };

      if let Err(e) = write(&mut output, &image) {
        error!("{}", e);
        outcome = Err(e);
        break;
      }
      run.publish(frame_index, &image, run.summary.processed_frames > before);
      frame_index += 1;
    }

    run.close(&mut output, outcome, cancelled)
  }
}

/// 实时调节的检测参数
#[derive(Debug)]
pub struct LiveControls {
  detection_enabled: AtomicBool,
  detection_frame_skip: AtomicU64,
}

impl LiveControls {
  pub fn new(detection_enabled: bool, detection_frame_skip: u64) -> Result<Arc<Self>, TaskError> {
    if detection_frame_skip == 0 {
      return Err(TaskError::InvalidFrameSkip);
    }
    Ok(Arc::new(Self {
      detection_enabled: AtomicBool::new(detection_enabled),
      detection_frame_skip: AtomicU64::new(detection_frame_skip),
    }))
  }

  pub fn set_enabled(&self, enabled: bool) {
    self.detection_enabled.store(enabled, Ordering::SeqCst);
  }

  pub fn is_enabled(&self) -> bool {
    self.detection_enabled.load(Ordering::SeqCst)
  }

  pub fn set_frame_skip(&self, frame_skip: u64) -> Result<(), TaskError> {
    if frame_skip == 0 {
      return Err(TaskError::InvalidFrameSkip);
    }
    self.detection_frame_skip.store(frame_skip, Ordering::SeqCst);
    Ok(())
  }

  pub fn frame_skip(&self) -> u64 {
    self.detection_frame_skip.load(Ordering::SeqCst).max(1)
  }

  /// 第 `frame_counter` 帧是否需要检测
  pub fn should_process(&self, frame_counter: u64) -> bool {
    self.is_enabled() && frame_counter % self.frame_skip() == 0
  }
}

/// 实时任务，直到停止信号或流结束
pub struct LiveTask {
  query: String,
  controls: Arc<LiveControls>,
  source_name: String,
  stop: StopSignal,
  monitor: Option<Arc<RunMonitor>>,
  pacing: bool,
}

impl LiveTask {
  pub fn new(query: impl Into<String>, controls: Arc<LiveControls>) -> Self {
    Self {
      query: query.into(),
      controls,
      source_name: String::new(),
      stop: StopSignal::new(),
      monitor: None,
      pacing: true,
    }
  }

  pub fn with_source_name(mut self, source_name: impl Into<String>) -> Self {
    self.source_name = source_name.into();
    self
  }

  pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
    self.stop = stop;
    self
  }

  pub fn with_monitor(mut self, monitor: Arc<RunMonitor>) -> Self {
    self.monitor = Some(monitor);
    self
  }

  /// 按输入帧率限速
  pub fn with_pacing(mut self, pacing: bool) -> Self {
    self.pacing = pacing;
    self
  }

  pub fn spawn<I, O, M, C>(
    self,
    session: &mut MediaSession<RunResult>,
    pipeline: Arc<Mutex<FilterPipeline<M, C>>>,
    input: I,
    output: O,
  ) -> Result<Option<RunResult>, WorkerError>
  where
    I: InputSource + 'static,
    O: OutputWriter + 'static,
    M: Model<Input = RgbImage, Output = DetectResult> + Send + 'static,
    M::Error: std::error::Error + Send + Sync + 'static,
    C: TextClassifier + Send + 'static,
  {
    session.start("gozcu-live", move |stop| {
      let pipeline = acquire(&pipeline);
      self.with_stop_signal(stop).run_task(input, &*pipeline, output)
    })
  }
}

impl<'p, I, O, M, C> Task<I, &'p FilterPipeline<M, C>, O> for LiveTask
where
  I: InputSource,
  O: OutputWriter,
  M: Model<Input = RgbImage, Output = DetectResult>,
  M::Error: std::error::Error + Send + Sync + 'static,
  C: TextClassifier,
{
  type Output = ProcessingSummary;
  type Error = TaskError;

  fn run_task(
    self,
    mut input: I,
    pipeline: &'p FilterPipeline<M, C>,
    mut output: O,
  ) -> Result<Self::Output, Self::Error> {
    let metadata = input.metadata();
    let interval = if self.pacing {
      metadata.frame_interval()
    } else {
      None
    };
    info!(
      "开始实时任务: {} (检测 {}, 间隔 {})",
      self.source_name,
      if self.controls.is_enabled() { "开启" } else { "关闭" },
      self.controls.frame_skip()
    );

    let mut run = RunLoop {
      pipeline,
      prepared: pipeline.prepare(&self.query),
      summary: ProcessingSummary::start(
        self.source_name.clone(),
        &metadata,
        self.query.clone(),
        self.controls.frame_skip(),
        None,
      ),
      monitor: self.monitor.clone(),
    };

    let mut frame_counter = 0u64;
    let mut cancelled = false;
    let mut outcome = Ok(());
    loop {
      if self.stop.is_stopped() {
        info!("收到停止信号，结束实时任务");
        cancelled = true;
        break;
      }
      let started = Instant::now();
      let frame = match input.next() {
        Some(Ok(frame)) => frame,
        Some(Err(source)) => {
          error!("读取第 {} 帧失败: {}", frame_counter, source);
          outcome = Err(TaskError::Capture {
            frame_index: frame_counter,
            source,
            summary: None,
          });
          break;
        }
        None => {
          info!("输入流结束");
          break;
        }
      };
      run.summary.record_frame();

      let processed = self.controls.should_process(frame_counter);
      let image = if processed {
        run.process(frame_counter, frame.image)
      } else {
        frame.image
      };

      if let Err(e) = write(&mut output, &image) {
        error!("{}", e);
        outcome = Err(e);
        break;
      }
      run.publish(frame_counter, &image, processed);
      frame_counter += 1;

      if let Some(interval) = interval {
        let elapsed = started.elapsed();
        if elapsed < interval {
          std::thread::sleep(interval - elapsed);
        }
      }
    }

    run.close(&mut output, outcome, cancelled)
  }
}

/// 同一会话中多段运行的合并摘要
#[derive(Debug, Default)]
pub struct SessionSummary {
  merged: Option<ProcessingSummary>,
}

impl SessionSummary {
  /// 并入一段运行的结果，出错的运行保留其部分摘要后返回错误
  pub fn record(&mut self, result: RunResult) -> Result<(), TaskError> {
    let (summary, error) = match result {
      Ok(summary) => (Some(summary), None),
      Err(e) => (e.partial_summary().cloned(), Some(e)),
    };
    if let Some(summary) = summary {
      match &mut self.merged {
        Some(merged) => merged.absorb(summary),
        None => self.merged = Some(summary),
      }
    }
    error.map_or(Ok(()), Err)
  }

  pub fn summary(&self) -> Option<&ProcessingSummary> {
    self.merged.as_ref()
  }

  pub fn into_summary(self) -> Option<ProcessingSummary> {
    self.merged
  }
}
