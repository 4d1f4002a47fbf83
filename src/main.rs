// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod args;

use std::{
  io::BufRead,
  path::{Path, PathBuf},
  sync::{Arc, Mutex, mpsc},
  time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use tracing::{debug, error, info, warn};
use url::Url;

use gozcu::{
  FromUrl, FromUrlWithScheme,
  model::{Mode, Vocabulary, YoloBuilder, YoloModel},
  output::{DiscardOutput, OutputWrapper, OutputWriter, SaveImageFileOutput},
  pipeline::FilterPipeline,
  resolver::OllamaClassifier,
  summary::ProcessingSummary,
  task::{BoundedTask, LiveControls, LiveTask, OneShotTask, RunResult, SessionSummary, Task, open_source},
  utils::parse_location,
  worker::{FrameSnapshot, MediaSession, RunMonitor, RunStatus, StopSignal},
};

use args::{Args, Command, ImageArgs, LiveArgs, ModelArgs, VideoArgs};

type Pipeline = FilterPipeline<YoloModel, OllamaClassifier>;

const LIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn build_pipeline(args: &ModelArgs, mode: Mode) -> Result<Pipeline> {
  let location = match mode {
    Mode::Segment => args.seg_model.as_deref().unwrap_or(&args.model),
    Mode::Detect => &args.model,
  };
  let url = parse_location(location, YoloBuilder::SCHEME)?;
  info!("模型: {} ({})", url, mode);
  let mut builder = YoloBuilder::from_url(&url)?.with_mode(mode);
  if let Some(labels) = &args.labels {
    builder = builder.with_vocabulary(Vocabulary::from_toml_file(labels)?);
  }
  let model = builder.build()?;

  let url = parse_location(&args.classifier, OllamaClassifier::SCHEME)?;
  info!("文本分类服务: {}", url);
  let classifier = OllamaClassifier::from_url(&url)?;

  Ok(FilterPipeline::new(model, classifier)?)
}

fn run_image(args: ImageArgs) -> Result<()> {
  let input_url = parse_location(&args.input, "image")?;
  let output_url = parse_location(&args.output, "image")?;
  info!("输入来源: {}", input_url);
  info!("输出路径: {}", output_url);

  let pipeline = build_pipeline(&args.model, args.model.mode)?;
  let input = open_source(&input_url)?;
  let output = OutputWrapper::from_url(&output_url)?;

  let report = OneShotTask::new(args.query).run_task(input, &pipeline, output)?;
  if report.found == 0 {
    info!("没有找到符合查询的目标");
  } else {
    info!("找到 {} 个目标: {}", report.found, report.objects.join(", "));
  }
  Ok(())
}

fn write_summary(summary: &ProcessingSummary, path: &Path) -> Result<()> {
  summary
    .save(path)
    .with_context(|| format!("无法保存处理摘要: {}", path.display()))?;
  info!(
    "处理 {} / {} 帧{}",
    summary.processed_frames,
    summary.total_frames,
    if summary.cancelled { "（已取消）" } else { "" }
  );
  Ok(())
}

/// 出错的运行也写下已处理部分的摘要
fn save_summary(result: RunResult, path: &Path) -> Result<()> {
  let mut session = SessionSummary::default();
  let outcome = session.record(result);
  if let Some(summary) = session.summary() {
    write_summary(summary, path)?;
  }
  Ok(outcome?)
}

fn run_video(args: VideoArgs) -> Result<()> {
  let input_url = parse_location(&args.input, "folder")?;
  let output_url = parse_location(&args.output, "folder")?;
  info!("输入来源: {}", input_url);
  info!("输出路径: {}", output_url);

  let pipeline = build_pipeline(&args.model, args.model.mode)?;
  let input = open_source(&input_url)?;
  let output = OutputWrapper::from_url(&output_url)?;

  let mut session = MediaSession::new();
  BoundedTask::new(args.query, args.frame_skip)?
    .with_max_frames(args.max_frames)
    .with_source_name(input_url.as_str())
    .spawn(&mut session, Arc::new(Mutex::new(pipeline)), input, output)?;

  if let Some(stop) = session.stop_signal() {
    ctrlc::set_handler(move || {
      warn!("收到 Ctrl-C，正在停止");
      stop.stop();
    })?;
  }

  let result = session.wait().ok_or_else(|| anyhow!("工作线程异常退出"))?;
  save_summary(result, &args.summary)
}

#[derive(Debug, Clone, PartialEq)]
enum LiveCommand {
  On,
  Off,
  Skip(u64),
  Mode(Mode),
  Save(PathBuf),
  Quit,
}

fn parse_command(line: &str) -> Result<LiveCommand> {
  let mut words = line.split_whitespace();
  let command = words.next().unwrap_or_default();
  let argument = words.next();
  Ok(match (command, argument) {
    ("on", None) => LiveCommand::On,
    ("off", None) => LiveCommand::Off,
    ("quit" | "exit" | "q", None) => LiveCommand::Quit,
    ("skip", Some(n)) => match n.parse::<u64>() {
      Ok(n) if n > 0 => LiveCommand::Skip(n),
      _ => bail!("帧间隔必须是正整数: {}", n),
    },
    ("mode", Some("detect")) => LiveCommand::Mode(Mode::Detect),
    ("mode", Some("segment")) => LiveCommand::Mode(Mode::Segment),
    ("save", Some(path)) => LiveCommand::Save(PathBuf::from(path)),
    _ => bail!("未知命令: {}", line.trim()),
  })
}

fn spawn_stdin_reader() -> mpsc::Receiver<String> {
  let (sender, receiver) = mpsc::channel();
  std::thread::spawn(move || {
    for line in std::io::stdin().lock().lines() {
      let Ok(line) = line else {
        break;
      };
      if sender.send(line).is_err() {
        break;
      }
    }
  });
  receiver
}

struct LiveRunner {
  args: LiveArgs,
  input_url: Url,
  output_url: Option<Url>,
  controls: Arc<LiveControls>,
  monitor: Arc<RunMonitor>,
  session: MediaSession<RunResult>,
  segments: SessionSummary,
}

impl LiveRunner {
  /// 启动新的运行，上一次运行会先被停止并回收
  fn start(&mut self, pipeline: Pipeline) -> Result<()> {
    if let Some(result) = self.session.stop() {
      if let Err(e) = self.segments.record(result) {
        warn!("上一次运行以错误结束: {}", e);
      }
    }
    // 丢弃上一次运行留下的状态
    self.monitor.status.take();

    let input = open_source(&self.input_url)?;
    let output: Box<dyn OutputWriter> = match &self.output_url {
      Some(url) => Box::new(OutputWrapper::from_url(url)?),
      None => Box::new(DiscardOutput),
    };
    LiveTask::new(self.args.query.clone(), self.controls.clone())
      .with_source_name(self.input_url.as_str())
      .with_monitor(self.monitor.clone())
      .spawn(&mut self.session, Arc::new(Mutex::new(pipeline)), input, output)?;
    Ok(())
  }

  /// 处理一条命令，返回 `false` 表示退出
  fn handle(&mut self, command: LiveCommand, latest: Option<&FrameSnapshot>) -> Result<bool> {
    match command {
      LiveCommand::On => {
        self.controls.set_enabled(true);
        info!("检测已开启");
      }
      LiveCommand::Off => {
        self.controls.set_enabled(false);
        info!("检测已关闭");
      }
      LiveCommand::Skip(n) => {
        self.controls.set_frame_skip(n)?;
        info!("检测间隔: {}", n);
      }
      LiveCommand::Mode(mode) => {
        info!("切换模型: {}", mode);
        let pipeline = build_pipeline(&self.args.model, mode)?;
        self.start(pipeline)?;
      }
      LiveCommand::Save(path) => {
        let Some(snapshot) = latest else {
          bail!("还没有可保存的帧");
        };
        let mut output = SaveImageFileOutput::new(path.display().to_string());
        output.write_frame(&snapshot.image)?;
        output.finish()?;
        info!("第 {} 帧已保存到 {}", snapshot.frame_index, path.display());
      }
      LiveCommand::Quit => return Ok(false),
    }
    Ok(true)
  }
}

fn run_live(args: LiveArgs) -> Result<()> {
  let input_url = parse_location(&args.input, "folder")?;
  let output_url = args
    .output
    .as_deref()
    .map(|output| parse_location(output, "folder"))
    .transpose()?;
  info!("输入来源: {}", input_url);

  let quit = StopSignal::new();
  {
    let quit = quit.clone();
    ctrlc::set_handler(move || {
      warn!("收到 Ctrl-C，正在停止");
      quit.stop();
    })?;
  }

  let pipeline = build_pipeline(&args.model, args.model.mode)?;
  let controls = LiveControls::new(!args.detection_disabled, args.detection_frame_skip)?;
  let summary_path = args.summary.clone();
  let mut runner = LiveRunner {
    args,
    input_url,
    output_url,
    controls,
    monitor: RunMonitor::new(),
    session: MediaSession::new(),
    segments: SessionSummary::default(),
  };
  runner.start(pipeline)?;
  info!("命令: on | off | skip N | mode detect|segment | save PATH | quit");

  let mut commands = Some(spawn_stdin_reader());
  let mut latest: Option<FrameSnapshot> = None;
  while !quit.is_stopped() {
    if let Some(snapshot) = runner.monitor.frames.take() {
      if !snapshot.objects.is_empty() {
        debug!("第 {} 帧: {:?}", snapshot.frame_index, snapshot.objects);
      }
      latest = Some(snapshot);
    }
    match runner.monitor.status.take() {
      Some(RunStatus::Finished { .. }) | Some(RunStatus::Failed(_)) => break,
      _ if !runner.session.is_running() => break,
      _ => {}
    }

    let Some(receiver) = &commands else {
      std::thread::sleep(LIVE_POLL_INTERVAL);
      continue;
    };
    match receiver.recv_timeout(LIVE_POLL_INTERVAL) {
      Ok(line) if line.trim().is_empty() => {}
      Ok(line) => {
        let outcome = parse_command(&line).and_then(|command| runner.handle(command, latest.as_ref()));
        match outcome {
          Ok(true) => {}
          Ok(false) => break,
          Err(e) => error!("{:#}", e),
        }
      }
      Err(mpsc::RecvTimeoutError::Timeout) => {}
      Err(mpsc::RecvTimeoutError::Disconnected) => {
        debug!("标准输入已关闭");
        commands = None;
      }
    }
  }

  let outcome = match runner.session.stop() {
    Some(result) => runner.segments.record(result),
    None => Ok(()),
  };
  match runner.segments.summary() {
    Some(summary) => write_summary(summary, &summary_path)?,
    None => warn!("没有完成的运行，不写处理摘要"),
  }
  Ok(outcome?)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  match Args::parse().command {
    Command::Image(args) => run_image(args),
    Command::Video(args) => run_video(args),
    Command::Live(args) => run_live(args),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn live_commands_are_parsed() {
    assert_eq!(parse_command("on").unwrap(), LiveCommand::On);
    assert_eq!(parse_command(" off ").unwrap(), LiveCommand::Off);
    assert_eq!(parse_command("skip 3").unwrap(), LiveCommand::Skip(3));
    assert_eq!(
      parse_command("mode segment").unwrap(),
      LiveCommand::Mode(Mode::Segment)
    );
    assert_eq!(
      parse_command("save /tmp/frame.png").unwrap(),
      LiveCommand::Save(PathBuf::from("/tmp/frame.png"))
    );
    assert_eq!(parse_command("quit").unwrap(), LiveCommand::Quit);
  }

  #[test]
  fn invalid_live_commands_are_rejected() {
    assert!(parse_command("skip 0").is_err());
    assert!(parse_command("skip x").is_err());
    assert!(parse_command("mode panoptic").is_err());
    assert!(parse_command("dance").is_err());
  }

  #[test]
  fn image_output_has_a_default() {
    let args = Args::parse_from([
      "gozcu",
      "image",
      "--model",
      "yolo:///models/yolov8n.onnx",
      "--input",
      "image:///data/street.jpg",
      "--query",
      "kırmızı arabalar",
    ]);
    let Command::Image(image) = args.command else {
      panic!("应解析为 image 子命令");
    };
    assert_eq!(image.output, args::DEFAULT_IMAGE_OUTPUT);
  }

  #[test]
  fn failed_run_still_writes_partial_summary() {
    use gozcu::{frame::SourceMetadata, input::InputError, task::TaskError};

    let mut partial = ProcessingSummary::start("cam", &SourceMetadata::default(), "araba", 1, None);
    partial.record_frame();
    partial.record_processed(0, vec!["car".into()]);
    partial.fail("设备断开");
    let result: RunResult = Err(TaskError::Capture {
      frame_index: 1,
      source: InputError::Capture {
        frame_index: 1,
        message: "设备断开".into(),
      },
      summary: Some(Box::new(partial)),
    });

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("summary.json");
    assert!(save_summary(result, &path).is_err());

    let saved = ProcessingSummary::load(&path).unwrap();
    assert_eq!(saved.processed_frames, 1);
    assert_eq!(saved.total_frames, 1);
    assert_eq!(saved.error.as_deref(), Some("设备断开"));
  }
}
