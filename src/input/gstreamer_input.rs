// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
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

//! # GStreamer 视频输入
//!
//! 支持两种 URL：
//! - `gst://file/path/to/video.mp4`：解码视频文件；
//! - `gst://camera/dev/video0?width=640&height=480&fps=30`：通过 `v4l2src` 读取摄像头。
//!
//! 查询参数 `rotate=90|180|270` 在管道中加入 `videoflip`。
//!
//! ## 系统依赖
//!
//! 需要 GStreamer 开发库，例如 Ubuntu/Debian 上的
//! `libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev`。

use std::collections::HashMap;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, SourceMetadata},
  input::{InputError, InputSource, InputSourceType},
  utils::{query_map, query_param, url_path},
};

#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 布尔操作错误: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("找不到 appsink 元素")]
  AppSinkNotFound,
  #[error("无法转换为 appsink 元素")]
  AppSinkConversionFailed,
  #[error("无法从 caps 获取视频信息")]
  VideoInfoError,
  #[error("不支持的视频格式: {0}")]
  UnsupportedFormat(String),
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("状态改变错误: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_CAMERA_FPS: u32 = 30;

pub enum GStreamerInputBuilderItem {
  FileSource(String),
  CameraSource {
    camera: String,
    io_mode: Option<u32>,
    width: u32,
    height: u32,
    fps: u32,
  },
  VideoFlip {
    method: u32,
  },
  TargetFormat,
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::FileSource(path) => {
        format!("filesrc location=\"{}\" ! decodebin", path)
      }
      GStreamerInputBuilderItem::CameraSource {
        camera,
        io_mode,
        width,
        height,
        fps,
      } => {
        let io_mode = io_mode
          .map(|mode| format!(" io-mode={}", mode))
          .unwrap_or_default();
        format!(
          "v4l2src device={}{} ! videoconvert ! videoscale ! video/x-raw,width={},height={},framerate={}/1",
          camera, io_mode, width, height, fps
        )
      }
      GStreamerInputBuilderItem::VideoFlip { method } => {
        format!("videoflip method={}", method)
      }
      GStreamerInputBuilderItem::TargetFormat => "videoconvert ! video/x-raw,format=RGB".to_string(),
    }
  }
}

/// GStreamer 输入管道构建器
pub struct GStreamerInputPipelineBuilder {
  items: Vec<GStreamerInputBuilderItem>,
  source_type: InputSourceType,
}

impl GStreamerInputPipelineBuilder {
  pub fn file(path: &str) -> Self {
    Self {
      items: vec![GStreamerInputBuilderItem::FileSource(path.to_string())],
      source_type: InputSourceType::Video,
    }
  }

  pub fn camera(device: &str, width: u32, height: u32, fps: u32) -> Self {
    Self {
      items: vec![GStreamerInputBuilderItem::CameraSource {
        camera: device.to_string(),
        io_mode: None,
        width,
        height,
        fps,
      }],
      source_type: InputSourceType::Camera,
    }
  }

  fn with_io_mode(mut self, mode: Option<u32>) -> Self {
    if let Some(GStreamerInputBuilderItem::CameraSource { io_mode, .. }) = self.items.first_mut() {
      *io_mode = mode;
    }
    self
  }

  pub fn rotate(mut self, degrees: u32) -> Self {
    let method = match degrees {
      90 => 1,
      180 => 2,
      270 => 3,
      _ => return self,
    };
    self.items.push(GStreamerInputBuilderItem::VideoFlip { method });
    self
  }

  pub fn description(&self) -> String {
    let mut parts: Vec<String> = self.items.iter().map(GStreamerInputBuilderItem::to_pipeline).collect();
    parts.push(GStreamerInputBuilderItem::TargetFormat.to_pipeline());
    parts.push("appsink max-buffers=2 name=sink".to_string());
    parts.join(" ! ")
  }

  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    gst::init()?;

    let description = self.description();
    info!("GStreamer 管道描述: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("无法创建管道".to_string()))?;
    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    // 摄像头丢弃积压帧，文件逐帧读取
    if self.source_type == InputSourceType::Camera {
      appsink.set_drop(true);
    }

    pipeline.set_state(gst::State::Playing)?;

    let mut input = GStreamerInput {
      pipeline,
      appsink,
      source_type: self.source_type,
      pending: None,
      next_index: 0,
      metadata: SourceMetadata::default(),
      finished: false,
    };

    // 预读第一帧以获得尺寸和帧率
    let (image, fps) = input
      .pull_image()?
      .ok_or_else(|| GStreamerInputError::PipelineError("输入没有任何帧".to_string()))?;
    let frame_count = match self.source_type {
      InputSourceType::Camera => None,
      _ => input.estimate_frame_count(fps),
    };
    input.metadata = SourceMetadata {
      frame_count,
      fps,
      width: image.width(),
      height: image.height(),
    };
    input.pending = Some(image);

    Ok(input)
  }
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch(url.scheme().to_string()));
    }

    let query: HashMap<String, String> = query_map(url);
    let path = url_path(url);
    let builder = match url.host_str() {
      Some("camera") => Self::camera(
        &path,
        query_param(&query, "width").unwrap_or(DEFAULT_CAMERA_WIDTH),
        query_param(&query, "height").unwrap_or(DEFAULT_CAMERA_HEIGHT),
        query_param(&query, "fps").unwrap_or(DEFAULT_CAMERA_FPS),
      )
      .with_io_mode(query_param(&query, "io-mode")),
      Some("file") => Self::file(&path),
      other => {
        error!("未知的 GStreamer 输入类型: {:?}", other);
        return Err(GStreamerInputError::SchemeMismatch(format!(
          "gst://{}",
          other.unwrap_or_default()
        )));
      }
    };

    Ok(match query_param::<u32>(&query, "rotate") {
      Some(degrees) => builder.rotate(degrees),
      None => builder,
    })
  }
}

/// GStreamer 视频输入
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  source_type: InputSourceType,
  pending: Option<RgbImage>,
  next_index: u64,
  metadata: SourceMetadata,
  finished: bool,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止 GStreamer 管道失败: {}", e);
    }
  }
}

impl GStreamerInput {
  /// 读取下一帧，流结束时返回 `None`
  fn pull_image(&self) -> Result<Option<(RgbImage, Option<f64>)>, GStreamerInputError> {
    match self.appsink.pull_sample() {
      Ok(sample) => convert_sample(&sample).map(Some),
      Err(_) if self.appsink.is_eos() => Ok(None),
      Err(e) => Err(GStreamerInputError::PipelineError(format!(
        "读取采样失败: {}",
        e
      ))),
    }
  }

  fn estimate_frame_count(&self, fps: Option<f64>) -> Option<u64> {
    let duration = self.pipeline.query_duration::<gst::ClockTime>()?;
    fps.map(|fps| (duration.seconds_f64() * fps).round() as u64)
  }
}

impl Iterator for GStreamerInput {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }

    let image = match self.pending.take() {
      Some(image) => image,
      None => match self.pull_image() {
        Ok(Some((image, _))) => image,
        Ok(None) => {
          self.finished = true;
          return None;
        }
        Err(e) => {
          self.finished = true;
          error!("读取第 {} 帧失败: {}", self.next_index, e);
          return Some(Err(e.into()));
        }
      },
    };

    let index = self.next_index;
    self.next_index += 1;
    let timestamp_ms = self
      .metadata
      .fps
      .map(|fps| (index as f64 * 1000.0 / fps) as u64)
      .unwrap_or(0);
    Some(Ok(Frame::new(image, index, timestamp_ms)))
  }
}

impl InputSource for GStreamerInput {
  fn source_type(&self) -> InputSourceType {
    self.source_type
  }

  fn metadata(&self) -> SourceMetadata {
    self.metadata.clone()
  }
}

fn convert_sample(sample: &gst::Sample) -> Result<(RgbImage, Option<f64>), GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("采样中没有缓冲区".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("采样中没有 caps".to_string()))?;
  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0] as usize;
  let fps = video_info.fps();
  let fps = (fps.numer() > 0 && fps.denom() > 0).then(|| fps.numer() as f64 / fps.denom() as f64);

  let map = buffer
    .map_readable()
    .map_err(|e| GStreamerInputError::PipelineError(format!("无法映射缓冲区: {}", e)))?;
  let data = map.as_slice();

  let expected = stride * (height.saturating_sub(1)) + width * 3;
  if data.len() < expected {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  // 去掉每行末尾的对齐填充
  let mut pixels = Vec::with_capacity(width * height * 3);
  match video_info.format() {
    gst_video::VideoFormat::Rgb => {
      for row in 0..height {
        let start = row * stride;
        pixels.extend_from_slice(&data[start..start + width * 3]);
      }
    }
    gst_video::VideoFormat::Bgr => {
      for row in 0..height {
        let start = row * stride;
        for bgr in data[start..start + width * 3].chunks_exact(3) {
          pixels.extend_from_slice(&[bgr[2], bgr[1], bgr[0]]);
        }
      }
    }
    other => return Err(GStreamerInputError::UnsupportedFormat(format!("{:?}", other))),
  }

  let image = RgbImage::from_raw(width as u32, height as u32, pixels)
    .ok_or_else(|| GStreamerInputError::PipelineError("无法创建 RGB 图像".to_string()))?;
  Ok((image, fps))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn camera_url_builds_v4l2_pipeline() {
    let url = Url::parse("gst://camera/dev/video2?width=320&height=240&fps=15&rotate=180").unwrap();
    let builder = GStreamerInputPipelineBuilder::from_url(&url).unwrap();
    let description = builder.description();
    assert!(description.starts_with("v4l2src device=/dev/video2"));
    assert!(description.contains("width=320,height=240,framerate=15/1"));
    assert!(description.contains("videoflip method=2"));
    assert!(description.ends_with("appsink max-buffers=2 name=sink"));
  }

  #[test]
  fn file_url_builds_decode_pipeline() {
    let url = Url::parse("gst://file/data/in.mp4").unwrap();
    let builder = GStreamerInputPipelineBuilder::from_url(&url).unwrap();
    assert!(builder.description().starts_with("filesrc location=\"/data/in.mp4\" ! decodebin"));

    let url = Url::parse("gst://rtsp/stream").unwrap();
    assert!(GStreamerInputPipelineBuilder::from_url(&url).is_err());
  }
}
