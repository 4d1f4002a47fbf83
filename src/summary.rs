// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/summary.rs - 处理摘要
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

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::frame::SourceMetadata;

pub const DEFAULT_SUMMARY_PATH: &str = "processing_summary.json";

#[derive(Error, Debug)]
pub enum SummaryError {
  #[error("写入摘要失败: {path}: {source}")]
  Io {
    path: String,
    source: std::io::Error,
  },
  #[error("摘要序列化失败: {0}")]
  Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
  pub source: String,
  pub frame_count: Option<u64>,
  pub fps: Option<f64>,
  pub width: u32,
  pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSummary {
  pub frame_index: u64,
  pub objects: Vec<String>,
  pub count: usize,
}

/// 一次运行的处理摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSummary {
  pub video: VideoInfo,
  pub query: String,
  pub frame_skip: u64,
  pub max_frames: Option<u64>,
  pub processed_frames: u64,
  pub total_frames: u64,
  pub started_at: DateTime<Local>,
  pub finished_at: Option<DateTime<Local>>,
  pub cancelled: bool,
  /// 运行因错误提前结束时的原因
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub frames: Vec<FrameSummary>,
}

impl ProcessingSummary {
  pub fn start(
    source: impl Into<String>,
    metadata: &SourceMetadata,
    query: impl Into<String>,
    frame_skip: u64,
    max_frames: Option<u64>,
  ) -> Self {
    Self {
      video: VideoInfo {
        source: source.into(),
        frame_count: metadata.frame_count,
        fps: metadata.fps,
        width: metadata.width,
        height: metadata.height,
      },
      query: query.into(),
      frame_skip,
      max_frames,
      processed_frames: 0,
      total_frames: 0,
      started_at: Local::now(),
      finished_at: None,
      cancelled: false,
      error: None,
      frames: Vec::new(),
    }
  }

  /// 记录一帧经过的帧（无论是否处理）
  pub fn record_frame(&mut self) {
    self.total_frames += 1;
  }

  /// 记录一帧处理结果
  pub fn record_processed(&mut self, frame_index: u64, objects: Vec<String>) {
    self.processed_frames += 1;
    self.frames.push(FrameSummary {
      frame_index,
      count: objects.len(),
      objects,
    });
  }

  pub fn finalize(&mut self, cancelled: bool) {
    self.cancelled = cancelled;
    self.finished_at = Some(Local::now());
  }

  /// 以错误结束
  pub fn fail(&mut self, error: impl std::fmt::Display) {
    self.error = Some(error.to_string());
    self.finished_at = Some(Local::now());
  }

  /// 把同一会话中后续一段运行并入本摘要，帧序号接续在已有帧之后
  pub fn absorb(&mut self, later: ProcessingSummary) {
    let offset = self.total_frames;
    self.frames.extend(later.frames.into_iter().map(|mut frame| {
      frame.frame_index += offset;
      frame
    }));
    self.processed_frames += later.processed_frames;
    self.total_frames += later.total_frames;
    self.finished_at = later.finished_at;
    self.cancelled = later.cancelled;
    self.error = later.error;
  }

  pub fn is_finalized(&self) -> bool {
    self.finished_at.is_some()
  }

  pub fn to_json(&self) -> Result<String, SummaryError> {
    Ok(serde_json::to_string_pretty(self)?)
  }

  pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SummaryError> {
    let path = path.as_ref();
    let to_io = |source| SummaryError::Io {
      path: path.display().to_string(),
      source,
    };
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent).map_err(to_io)?;
    }
    std::fs::write(path, self.to_json()?).map_err(to_io)?;
    info!("处理摘要已保存: {}", path.display());
    Ok(())
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self, SummaryError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| SummaryError::Io {
      path: path.display().to_string(),
      source,
    })?;
    Ok(serde_json::from_str(&text)?)
  }
}
