// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/input.rs - 视频/图像输入
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

use thiserror::Error;
use url::Url;

use crate::{
  FromUrl,
  frame::{Frame, SourceMetadata},
};

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "directory_input")]
mod directory_input;
#[cfg(feature = "directory_input")]
pub use self::directory_input::{DirectoryInput, DirectoryInputError};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{
  GStreamerInput, GStreamerInputError, GStreamerInputPipelineBuilder,
};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("图像文件输入错误: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "directory_input")]
  #[error("目录输入错误: {0}")]
  DirectoryInputError(#[from] DirectoryInputError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer 输入错误: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("读取第 {frame_index} 帧失败: {message}")]
  Capture { frame_index: u64, message: String },
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 输入源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSourceType {
  /// 单张图片
  Image,
  /// 有限长度的视频或图像序列
  Video,
  /// 实时摄像头
  Camera,
}

/// 输入源
pub trait InputSource: Iterator<Item = Result<Frame, InputError>> + Send {
  fn source_type(&self) -> InputSourceType;

  fn metadata(&self) -> SourceMetadata;
}

impl<I: InputSource + ?Sized> InputSource for Box<I> {
  fn source_type(&self) -> InputSourceType {
    (**self).source_type()
  }

  fn metadata(&self) -> SourceMetadata {
    (**self).metadata()
  }
}

pub enum InputWrapper {
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
  #[cfg(feature = "directory_input")]
  Directory(DirectoryInput),
  #[cfg(feature = "gstreamer_input")]
  GStreamerInput(GStreamerInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    #[cfg(feature = "directory_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == DirectoryInput::SCHEME {
        let input = DirectoryInput::from_url(url)?;
        return Ok(InputWrapper::Directory(input));
      }
    }
    #[cfg(feature = "gstreamer_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == GStreamerInputPipelineBuilder::SCHEME {
        let input = GStreamerInputPipelineBuilder::from_url(url)?.build()?;
        return Ok(InputWrapper::GStreamerInput(input));
      }
    }
    Err(InputError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl Iterator for InputWrapper {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.next(),
      #[cfg(feature = "directory_input")]
      InputWrapper::Directory(input) => input.next(),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.next(),
      #[allow(unreachable_patterns)]
      _ => None,
    }
  }
}

impl InputSource for InputWrapper {
  fn source_type(&self) -> InputSourceType {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.source_type(),
      #[cfg(feature = "directory_input")]
      InputWrapper::Directory(input) => input.source_type(),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.source_type(),
      #[allow(unreachable_patterns)]
      _ => InputSourceType::Image,
    }
  }

  fn metadata(&self) -> SourceMetadata {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.metadata(),
      #[cfg(feature = "directory_input")]
      InputWrapper::Directory(input) => input.metadata(),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.metadata(),
      #[allow(unreachable_patterns)]
      _ => SourceMetadata::default(),
    }
  }
}

/// 内存中的帧序列，可选地在指定位置插入读取错误
pub struct MemoryInput {
  frames: std::vec::IntoIter<image::RgbImage>,
  metadata: SourceMetadata,
  source_type: InputSourceType,
  next_index: u64,
  fail_at: Option<u64>,
}

impl MemoryInput {
  pub fn new(frames: Vec<image::RgbImage>, fps: Option<f64>) -> Self {
    let (width, height) = frames.first().map(|f| f.dimensions()).unwrap_or((0, 0));
    let metadata = SourceMetadata {
      frame_count: Some(frames.len() as u64),
      fps,
      width,
      height,
    };
    Self {
      frames: frames.into_iter(),
      metadata,
      source_type: InputSourceType::Video,
      next_index: 0,
      fail_at: None,
    }
  }

  pub fn with_source_type(mut self, source_type: InputSourceType) -> Self {
    self.source_type = source_type;
    self
  }

  /// 读取到第 `frame_index` 帧时返回错误
  pub fn with_failure_at(mut self, frame_index: u64) -> Self {
    self.fail_at = Some(frame_index);
    self
  }
}

impl Iterator for MemoryInput {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    let index = self.next_index;
    if self.fail_at == Some(index) {
      self.fail_at = None;
      self.next_index += 1;
      self.frames.next();
      return Some(Err(InputError::Capture {
        frame_index: index,
        message: "模拟读取失败".to_string(),
      }));
    }
    let image = self.frames.next()?;
    self.next_index += 1;
    let timestamp_ms = self
      .metadata
      .fps
      .map(|fps| (index as f64 * 1000.0 / fps) as u64)
      .unwrap_or(0);
    Some(Ok(Frame::new(image, index, timestamp_ms)))
  }
}

impl InputSource for MemoryInput {
  fn source_type(&self) -> InputSourceType {
    self.source_type
  }

  fn metadata(&self) -> SourceMetadata {
    self.metadata.clone()
  }
}
