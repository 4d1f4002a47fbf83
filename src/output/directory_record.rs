// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use std::path::PathBuf;

use chrono::{Datelike, Local};
use image::RgbImage;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{OutputError, OutputWriter},
  utils::url_path,
};

/// 按序号把帧保存为 PNG：`<dir>/000000.png`, `<dir>/000001.png`, ...
///
/// 带 `?dated` 参数时写入 `<dir>/YYYY/MM/DD/` 子目录。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  display: String,
  dated: bool,
  frame_counter: u64,
  finished: bool,
}

impl DirectoryRecordOutput {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    let directory = directory.into();
    Self {
      display: directory.display().to_string(),
      directory,
      dated: false,
      frame_counter: 0,
      finished: false,
    }
  }

  pub fn with_dated(mut self, dated: bool) -> Self {
    self.dated = dated;
    self
  }

  pub fn frames_written(&self) -> u64 {
    self.frame_counter
  }

  fn frame_directory(&self) -> PathBuf {
    if !self.dated {
      return self.directory.clone();
    }
    let now = Local::now();
    self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()))
  }
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = OutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch(uri.scheme().to_string()));
    }
    let dated = uri.query_pairs().any(|(k, _)| k == "dated");
    Ok(Self::new(url_path(uri)).with_dated(dated))
  }
}

impl OutputWriter for DirectoryRecordOutput {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError> {
    if self.finished {
      return Err(OutputError::Finished(self.display.clone()));
    }

    let directory = self.frame_directory();
    std::fs::create_dir_all(&directory).map_err(|source| OutputError::Io {
      path: directory.display().to_string(),
      source,
    })?;

    let path = directory.join(format!("{:06}.png", self.frame_counter));
    image.save(&path).map_err(|source| OutputError::Image {
      path: path.display().to_string(),
      source,
    })?;
    debug!("保存第 {} 帧: {}", self.frame_counter, path.display());
    self.frame_counter += 1;
    Ok(())
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    if !self.finished {
      self.finished = true;
      info!("目录输出完成: {} 共 {} 帧", self.display, self.frame_counter);
    }
    Ok(())
  }

  fn path(&self) -> &str {
    &self.display
  }
}
