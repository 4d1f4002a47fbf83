// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/output.rs - 输出定义
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

use image::RgbImage;
use thiserror::Error;
use url::Url;

use crate::FromUrl;
#[cfg(any(
  feature = "save_image_file",
  feature = "directory_record",
  feature = "gstreamer_output"
))]
use crate::FromUrlWithScheme;

pub mod draw;

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::SaveImageFileOutput;

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::DirectoryRecordOutput;

#[cfg(feature = "gstreamer_output")]
mod gstreamer_video_output;
#[cfg(feature = "gstreamer_output")]
pub use self::gstreamer_video_output::{GStreamerVideoOutput, GStreamerVideoOutputError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("I/O 错误: {path}: {source}")]
  Io {
    path: String,
    source: std::io::Error,
  },
  #[error("图像编码错误: {path}: {source}")]
  Image {
    path: String,
    source: image::ImageError,
  },
  #[cfg(feature = "gstreamer_output")]
  #[error("GStreamer 视频输出错误: {0}")]
  GStreamerVideoOutputError(#[from] GStreamerVideoOutputError),
  #[error("输出已关闭: {0}")]
  Finished(String),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 帧输出
pub trait OutputWriter: Send {
  /// 写入一帧
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError>;

  /// 完成写入，之后不再接受新帧
  fn finish(&mut self) -> Result<(), OutputError>;

  /// 输出位置，用于日志与错误信息
  fn path(&self) -> &str;
}

impl<W: OutputWriter + ?Sized> OutputWriter for Box<W> {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError> {
    (**self).write_frame(image)
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    (**self).finish()
  }

  fn path(&self) -> &str {
    (**self).path()
  }
}

impl<W: OutputWriter + ?Sized> OutputWriter for &mut W {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError> {
    (**self).write_frame(image)
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    (**self).finish()
  }

  fn path(&self) -> &str {
    (**self).path()
  }
}

pub enum OutputWrapper {
  #[cfg(feature = "save_image_file")]
  SaveImageFileOutput(SaveImageFileOutput),
  #[cfg(feature = "directory_record")]
  DirectoryRecordOutput(DirectoryRecordOutput),
  #[cfg(feature = "gstreamer_output")]
  GStreamerVideoOutput(GStreamerVideoOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "save_image_file")]
      SaveImageFileOutput::SCHEME => Ok(OutputWrapper::SaveImageFileOutput(
        SaveImageFileOutput::from_url(url)?,
      )),
      #[cfg(feature = "directory_record")]
      DirectoryRecordOutput::SCHEME => Ok(OutputWrapper::DirectoryRecordOutput(
        DirectoryRecordOutput::from_url(url)?,
      )),
      #[cfg(feature = "gstreamer_output")]
      GStreamerVideoOutput::SCHEME => Ok(OutputWrapper::GStreamerVideoOutput(
        GStreamerVideoOutput::from_url(url)?,
      )),
      scheme => Err(OutputError::SchemeMismatch(scheme.to_string())),
    }
  }
}

impl OutputWriter for OutputWrapper {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError> {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => output.write_frame(image),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output.write_frame(image),
      #[cfg(feature = "gstreamer_output")]
      OutputWrapper::GStreamerVideoOutput(output) => output.write_frame(image),
      #[allow(unreachable_patterns)]
      _ => unreachable!(),
    }
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => output.finish(),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output.finish(),
      #[cfg(feature = "gstreamer_output")]
      OutputWrapper::GStreamerVideoOutput(output) => output.finish(),
      #[allow(unreachable_patterns)]
      _ => unreachable!(),
    }
  }

  fn path(&self) -> &str {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => output.path(),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output.path(),
      #[cfg(feature = "gstreamer_output")]
      OutputWrapper::GStreamerVideoOutput(output) => output.path(),
      #[allow(unreachable_patterns)]
      _ => unreachable!(),
    }
  }
}

/// 丢弃全部帧，实时模式未指定输出时使用
#[derive(Debug, Default)]
pub struct DiscardOutput;

impl OutputWriter for DiscardOutput {
  fn write_frame(&mut self, _image: &RgbImage) -> Result<(), OutputError> {
    Ok(())
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    Ok(())
  }

  fn path(&self) -> &str {
    "discard"
  }
}

/// 在内存中收集帧
#[derive(Debug, Default)]
pub struct MemoryOutput {
  frames: Vec<RgbImage>,
  finished: bool,
}

impl MemoryOutput {
  pub fn frames(&self) -> &[RgbImage] {
    &self.frames
  }

  pub fn is_finished(&self) -> bool {
    self.finished
  }
}

impl OutputWriter for MemoryOutput {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError> {
    if self.finished {
      return Err(OutputError::Finished(self.path().to_string()));
    }
    self.frames.push(image.clone());
    Ok(())
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    self.finished = true;
    Ok(())
  }

  fn path(&self) -> &str {
    "memory"
  }
}
