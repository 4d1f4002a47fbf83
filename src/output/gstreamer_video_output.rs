// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 视频文件输出
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

//! # GStreamer 视频文件输出
//!
//! URL 形如 `gstvideo:///output.mp4?fps=30`。帧尺寸取自第一帧，
//! 编码管道在第一次写入时创建。
//!
//! 按扩展名选择封装：`.mp4` / `.mkv` / `.avi` 使用 H.264，`.webm` 使用 VP8，
//! 其他扩展名按 MP4 处理。

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use image::RgbImage;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{OutputError, OutputWriter},
  utils::{query_map, query_param, url_path},
};

#[derive(Error, Debug)]
pub enum GStreamerVideoOutputError {
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 布尔操作错误: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("找不到 appsrc 元素")]
  AppSrcNotFound,
  #[error("无法转换为 appsrc 元素")]
  AppSrcConversionFailed,
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("状态改变错误: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("帧尺寸 {actual:?} 与视频尺寸 {expected:?} 不一致")]
  FrameSizeMismatch {
    expected: (u32, u32),
    actual: (u32, u32),
  },
}

const DEFAULT_FPS: i32 = 30;
const EOS_TIMEOUT_SECS: u64 = 10;

fn encoder_for(path: &str) -> &'static str {
  if path.ends_with(".webm") {
    "vp8enc ! webmmux"
  } else if path.ends_with(".mkv") {
    "x264enc speed-preset=fast ! h264parse ! matroskamux"
  } else if path.ends_with(".avi") {
    "x264enc ! avimux"
  } else {
    "x264enc speed-preset=fast tune=zerolatency ! h264parse ! mp4mux"
  }
}

struct EncodingPipeline {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  size: (u32, u32),
}

pub struct GStreamerVideoOutput {
  path: String,
  fps: i32,
  pipeline: Option<EncodingPipeline>,
  frame_count: u64,
  finished: bool,
}

impl FromUrlWithScheme for GStreamerVideoOutput {
  const SCHEME: &'static str = "gstvideo";
}

impl FromUrl for GStreamerVideoOutput {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(OutputError::SchemeMismatch(url.scheme().to_string()));
    }

    gst::init().map_err(GStreamerVideoOutputError::from)?;

    let query = query_map(url);
    let fps = query_param::<i32>(&query, "fps")
      .filter(|fps| *fps > 0)
      .unwrap_or(DEFAULT_FPS);

    Ok(Self {
      path: url_path(url),
      fps,
      pipeline: None,
      frame_count: 0,
      finished: false,
    })
  }
}

impl GStreamerVideoOutput {
  pub fn with_fps(mut self, fps: f64) -> Self {
    if fps.is_finite() && fps >= 1.0 {
      self.fps = fps.round() as i32;
    }
    self
  }

  fn start(&self, width: u32, height: u32) -> Result<EncodingPipeline, GStreamerVideoOutputError> {
    let description = format!(
      "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! {} ! filesink location=\"{}\"",
      encoder_for(&self.path),
      self.path
    );
    info!("创建视频输出管道: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerVideoOutputError::PipelineError("无法创建管道".to_string()))?;
    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerVideoOutputError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerVideoOutputError::AppSrcConversionFailed)?;

    let caps = gst::Caps::builder("video/x-raw")
      .field("format", "RGB")
      .field("width", width as i32)
      .field("height", height as i32)
      .field("framerate", gst::Fraction::new(self.fps, 1))
      .build();
    appsrc.set_caps(Some(&caps));
    appsrc.set_format(gst::Format::Time);

    pipeline.set_state(gst::State::Playing)?;
    info!(
      "视频输出已初始化: {}x{} @ {} fps -> {}",
      width, height, self.fps, self.path
    );

    Ok(EncodingPipeline {
      pipeline,
      appsrc,
      size: (width, height),
    })
  }

  fn push_frame(&mut self, image: &RgbImage) -> Result<(), GStreamerVideoOutputError> {
    if self.pipeline.is_none() {
      self.pipeline = Some(self.start(image.width(), image.height())?);
    }
    let Some(encoding) = self.pipeline.as_ref() else {
      return Err(GStreamerVideoOutputError::PipelineError("管道未启动".to_string()));
    };
    if image.dimensions() != encoding.size {
      return Err(GStreamerVideoOutputError::FrameSizeMismatch {
        expected: encoding.size,
        actual: image.dimensions(),
      });
    }

    let frame_ns = 1_000_000_000 / self.fps as u64;
    let mut buffer = gst::Buffer::from_slice(image.as_raw().clone());
    {
      let buffer_ref = buffer
        .get_mut()
        .ok_or_else(|| GStreamerVideoOutputError::PipelineError("缓冲区不可写".to_string()))?;
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(self.frame_count * frame_ns));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(frame_ns));
    }

    encoding
      .appsrc
      .push_buffer(buffer)
      .map_err(|e| GStreamerVideoOutputError::PipelineError(format!("推送缓冲区失败: {:?}", e)))?;
    self.frame_count += 1;
    Ok(())
  }

  fn close(&mut self) -> Result<(), GStreamerVideoOutputError> {
    let Some(encoding) = self.pipeline.take() else {
      return Ok(());
    };
    encoding
      .appsrc
      .end_of_stream()
      .map_err(|e| GStreamerVideoOutputError::PipelineError(format!("发送 EOS 失败: {:?}", e)))?;

    // 等待 EOS 走完管道，文件尾才会写入
    if let Some(bus) = encoding.pipeline.bus() {
      let message = bus.timed_pop_filtered(
        gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS),
        &[gst::MessageType::Eos, gst::MessageType::Error],
      );
      if let Some(message) = message
        && let gst::MessageView::Error(err) = message.view()
      {
        warn!("视频输出管道错误: {}", err.error());
      }
    }
    encoding.pipeline.set_state(gst::State::Null)?;
    info!("视频输出关闭，共写入 {} 帧: {}", self.frame_count, self.path);
    Ok(())
  }
}

impl OutputWriter for GStreamerVideoOutput {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError> {
    if self.finished {
      return Err(OutputError::Finished(self.path.clone()));
    }
    Ok(self.push_frame(image)?)
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    self.finished = true;
    Ok(self.close()?)
  }

  fn path(&self) -> &str {
    &self.path
  }
}

impl Drop for GStreamerVideoOutput {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      warn!("关闭视频输出失败: {}", e);
    }
  }
}
