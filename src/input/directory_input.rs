// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/input/directory_input.rs - 图像序列目录输入
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

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, SourceMetadata},
  input::{InputError, InputSource, InputSourceType},
  utils::{query_map, query_param, url_path},
};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "webp"];
const DEFAULT_FPS: f64 = 25.0;

#[derive(Error, Debug)]
pub enum DirectoryInputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("无法读取目录: {path}: {source}")]
  Io {
    path: String,
    source: std::io::Error,
  },
  #[error("目录中没有图像文件: {0}")]
  Empty(String),
  #[error("无法解码图像: {path}: {source}")]
  Decode {
    path: String,
    source: image::ImageError,
  },
}

/// 按文件名顺序读取目录中的图像，作为视频帧序列
///
/// URL 形如 `folder:///data/frames?fps=25`。
pub struct DirectoryInput {
  files: Vec<PathBuf>,
  position: usize,
  fps: f64,
  width: u32,
  height: u32,
}

fn is_image_file(path: &Path) -> bool {
  path.is_file()
    && path
      .extension()
      .and_then(|ext| ext.to_str())
      .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
      .unwrap_or(false)
}

fn decode(path: &Path) -> Result<image::RgbImage, DirectoryInputError> {
  image::open(path)
    .map(|image| image.to_rgb8())
    .map_err(|source| DirectoryInputError::Decode {
      path: path.display().to_string(),
      source,
    })
}

impl DirectoryInput {
  pub fn open(directory: impl AsRef<Path>, fps: f64) -> Result<Self, DirectoryInputError> {
    let directory = directory.as_ref();
    let location = directory.display().to_string();
    let entries = std::fs::read_dir(directory).map_err(|source| DirectoryInputError::Io {
      path: location.clone(),
      source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
      let entry = entry.map_err(|source| DirectoryInputError::Io {
        path: location.clone(),
        source,
      })?;
      let path = entry.path();
      if is_image_file(&path) {
        files.push(path);
      }
    }
    files.sort();

    let first = files
      .first()
      .ok_or_else(|| DirectoryInputError::Empty(location.clone()))?;
    let (width, height) = image::image_dimensions(first).map_err(|source| {
      DirectoryInputError::Decode {
        path: first.display().to_string(),
        source,
      }
    })?;

    info!(
      "打开图像序列: {} ({} 帧, {}x{} @ {} fps)",
      location,
      files.len(),
      width,
      height,
      fps
    );

    Ok(Self {
      files,
      position: 0,
      fps,
      width,
      height,
    })
  }
}

impl FromUrlWithScheme for DirectoryInput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryInput {
  type Error = DirectoryInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(DirectoryInputError::SchemeMismatch(url.scheme().to_string()));
    }
    let query = query_map(url);
    let fps = query_param::<f64>(&query, "fps")
      .filter(|fps| fps.is_finite() && *fps > 0.0)
      .unwrap_or(DEFAULT_FPS);
    Self::open(url_path(url), fps)
  }
}

impl Iterator for DirectoryInput {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    let path = self.files.get(self.position)?;
    let index = self.position as u64;
    self.position += 1;

    let timestamp_ms = (index as f64 * 1000.0 / self.fps) as u64;
    Some(
      decode(path)
        .map(|image| Frame::new(image, index, timestamp_ms))
        .map_err(InputError::from),
    )
  }
}

impl InputSource for DirectoryInput {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Video
  }

  fn metadata(&self) -> SourceMetadata {
    SourceMetadata {
      frame_count: Some(self.files.len() as u64),
      fps: Some(self.fps),
      width: self.width,
      height: self.height,
    }
  }
}
