// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/args.rs - 命令行参数
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use gozcu::{model::Mode, summary::DEFAULT_SUMMARY_PATH};

pub const DEFAULT_CLASSIFIER: &str = "ollama://127.0.0.1:11434/llama3.1:latest";
pub const DEFAULT_IMAGE_OUTPUT: &str = "output_detection.jpg";

/// Gözcü 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// 在单张图片中查找目标
  Image(ImageArgs),
  /// 处理视频，按间隔抽帧
  Video(VideoArgs),
  /// 实时处理摄像头或视频流
  Live(LiveArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ModelArgs {
  /// 检测模型，如 yolo:///models/yolov8n.onnx?conf=0.25
  #[arg(long, value_name = "MODEL")]
  pub model: String,

  /// 分割模型，未指定时使用 --model
  #[arg(long, value_name = "MODEL")]
  pub seg_model: Option<String>,

  /// 文本分类服务
  #[arg(long, value_name = "CLASSIFIER", default_value = DEFAULT_CLASSIFIER)]
  pub classifier: String,

  #[arg(long, value_enum, default_value_t = Mode::Detect)]
  pub mode: Mode,

  /// 类别词表（TOML，`labels = [...]`），默认 COCO
  #[arg(long, value_name = "FILE")]
  pub labels: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct ImageArgs {
  #[command(flatten)]
  pub model: ModelArgs,

  /// 输入图片，如 image:///data/street.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: String,

  /// 标注结果输出路径
  #[arg(long, value_name = "OUTPUT", default_value = DEFAULT_IMAGE_OUTPUT)]
  pub output: String,

  /// 查询语句，如 "kırmızı arabaları göster"
  #[arg(long, value_name = "TEXT")]
  pub query: String,
}

#[derive(clap::Args, Debug)]
pub struct VideoArgs {
  #[command(flatten)]
  pub model: ModelArgs,

  /// 输入视频，如 folder:///data/frames?fps=25
  #[arg(long, value_name = "SOURCE")]
  pub input: String,

  #[arg(long, value_name = "OUTPUT")]
  pub output: String,

  #[arg(long, value_name = "TEXT")]
  pub query: String,

  /// 每 N 帧处理一帧
  #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
  pub frame_skip: u64,

  /// 最多处理的帧数
  #[arg(long, value_name = "COUNT")]
  pub max_frames: Option<u64>,

  /// 处理摘要（JSON）
  #[arg(long, value_name = "FILE", default_value = DEFAULT_SUMMARY_PATH)]
  pub summary: PathBuf,
}

#[derive(clap::Args, Debug)]
pub struct LiveArgs {
  #[command(flatten)]
  pub model: ModelArgs,

  /// 摄像头或视频流，如 gst://camera/dev/video0
  #[arg(long, value_name = "SOURCE")]
  pub input: String,

  /// 未指定时不写出帧
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<String>,

  #[arg(long, value_name = "TEXT")]
  pub query: String,

  #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
  pub detection_frame_skip: u64,

  /// 启动时关闭检测
  #[arg(long)]
  pub detection_disabled: bool,

  #[arg(long, value_name = "FILE", default_value = DEFAULT_SUMMARY_PATH)]
  pub summary: PathBuf,
}
