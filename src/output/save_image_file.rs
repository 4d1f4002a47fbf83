// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/output/save_image_file.rs - 保存图像文件
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

use image::RgbImage;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{OutputError, OutputWriter},
  utils::url_path,
};

/// 单张图像输出，多次写入时保留最后一帧
pub struct SaveImageFileOutput {
  path: String,
  written: u64,
}

impl SaveImageFileOutput {
  pub fn new(path: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      written: 0,
    }
  }

  pub fn written(&self) -> u64 {
    self.written
  }
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = OutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }
    Ok(Self::new(url_path(uri)))
  }
}

impl OutputWriter for SaveImageFileOutput {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError> {
    if let Some(parent) = Path::new(&self.path).parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent).map_err(|source| OutputError::Io {
        path: self.path.clone(),
        source,
      })?;
    }

    image.save(&self.path).map_err(|source| OutputError::Image {
      path: self.path.clone(),
      source,
    })?;
    self.written += 1;

    info!("保存图像到文件: {}", self.path);
    Ok(())
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    Ok(())
  }

  fn path(&self) -> &str {
    &self.path
  }
}
