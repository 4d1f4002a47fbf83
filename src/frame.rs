// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/frame.rs - 帧与输入源元数据
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
use serde::{Deserialize, Serialize};

/// 帧数据
#[derive(Debug, Clone)]
pub struct Frame {
  /// RGB 图像数据
  pub image: RgbImage,
  /// 帧索引，从 0 开始
  pub index: u64,
  /// 时间戳（毫秒）
  pub timestamp_ms: u64,
}

impl Frame {
  pub fn new(image: RgbImage, index: u64, timestamp_ms: u64) -> Self {
    Self {
      image,
      index,
      timestamp_ms,
    }
  }
}

/// 输入源元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
  /// 总帧数，实时源为 `None`
  pub frame_count: Option<u64>,
  pub fps: Option<f64>,
  pub width: u32,
  pub height: u32,
}

impl SourceMetadata {
  /// 按帧率计算的单帧间隔
  pub fn frame_interval(&self) -> Option<std::time::Duration> {
    self
      .fps
      .filter(|fps| fps.is_finite() && *fps > 0.0)
      .map(|fps| std::time::Duration::from_secs_f64(1.0 / fps))
  }
}
