// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::path::Path;

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, SourceMetadata},
  input::{InputError, InputSource, InputSourceType},
  utils::url_path,
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("无法打开图片文件: {path}: {source}")]
  Io {
    path: String,
    source: std::io::Error,
  },
  #[error("无法解码图片文件: {path}: {source}")]
  Decode {
    path: String,
    source: image::ImageError,
  },
}

/// 单张图片输入，只产生一帧
pub struct ImageFileInput {
  image: Option<RgbImage>,
  width: u32,
  height: u32,
}

impl ImageFileInput {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageFileInputError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    let image = ImageReader::open(path)
      .map_err(|source| ImageFileInputError::Io {
        path: display.clone(),
        source,
      })?
      .with_guessed_format()
      .map_err(|source| ImageFileInputError::Io {
        path: display.clone(),
        source,
      })?
      .decode()
      .map_err(|source| ImageFileInputError::Decode {
        path: display.clone(),
        source,
      })?
      .to_rgb8();

    Ok(Self::from_image(image))
  }

  pub fn from_image(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      image: Some(image),
      width,
      height,
    }
  }
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch(url.scheme().to_string()));
    }
    Self::open(url_path(url))
  }
}

impl Iterator for ImageFileInput {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    self.image.take().map(|image| Ok(Frame::new(image, 0, 0)))
  }
}

impl InputSource for ImageFileInput {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Image
  }

  fn metadata(&self) -> SourceMetadata {
    SourceMetadata {
      frame_count: Some(1),
      fps: None,
      width: self.width,
      height: self.height,
    }
  }
}
