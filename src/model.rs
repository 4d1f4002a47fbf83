// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/model.rs - 模型
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

use image::GrayImage;
use serde::Deserialize;
use thiserror::Error;

use crate::color::fold_case;

#[cfg(feature = "backend_tract")]
mod yolo;
#[cfg(feature = "backend_tract")]
pub use self::yolo::{YoloBuilder, YoloError, YoloModel};

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

/// 模型变体：检测或实例分割
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Mode {
  #[default]
  Detect,
  Segment,
}

impl std::fmt::Display for Mode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Mode::Detect => write!(f, "detect"),
      Mode::Segment => write!(f, "segment"),
    }
  }
}

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;

  /// 模型能输出的全部类别名
  fn vocabulary(&self) -> &Vocabulary;

  /// 构建时确定的模型变体
  fn mode(&self) -> Mode;
}

/// 检测区域
#[derive(Debug, Clone, PartialEq)]
pub enum Region {
  /// 归一化坐标 [x_min, y_min, x_max, y_max]
  Box([f32; 4]),
  /// 与原图同分辨率的占用栅格，值大于 0 的像素属于目标
  Mask(GrayImage),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub region: Region,
  pub class_id: u32,
  pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, DetectItem> {
    self.items.iter()
  }

  /// 按顺序保留满足条件的检测结果
  pub fn retain<F: FnMut(&DetectItem) -> bool>(self, mut keep: F) -> Self {
    let items: Vec<DetectItem> = self
      .items
      .into_vec()
      .into_iter()
      .filter(|item| keep(item))
      .collect();
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

#[derive(Error, Debug)]
pub enum VocabularyError {
  #[error("I/O 错误: {path}: {source}")]
  Io {
    path: String,
    source: std::io::Error,
  },
  #[error("类别文件格式错误: {path}: {source}")]
  Parse {
    path: String,
    source: toml::de::Error,
  },
  #[error("类别文件为空: {0}")]
  Empty(String),
}

#[derive(Deserialize)]
struct LabelFile {
  labels: Vec<String>,
}

/// 封闭的类别词表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
  names: Box<[String]>,
}

impl Vocabulary {
  pub fn new<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      names: names.into_iter().map(Into::into).collect(),
    }
  }

  pub fn coco() -> Self {
    Self::new(COCO_CLASSES)
  }

  /// 从 TOML 文件读取 `labels = [...]`
  pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, VocabularyError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| VocabularyError::Io {
      path: display.clone(),
      source,
    })?;
    let file: LabelFile = toml::from_str(&text).map_err(|source| VocabularyError::Parse {
      path: display.clone(),
      source,
    })?;
    if file.labels.is_empty() {
      return Err(VocabularyError::Empty(display));
    }
    Ok(Self::new(file.labels))
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn name(&self, class_id: u32) -> Option<&str> {
    self.names.get(class_id as usize).map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.names.iter().map(String::as_str)
  }

  /// 忽略大小写查找
  pub fn find(&self, name: &str) -> Option<&str> {
    let name = fold_case(name.trim());
    self.iter().find(|candidate| fold_case(candidate) == name)
  }
}

impl Default for Vocabulary {
  fn default() -> Self {
    Self::coco()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn coco_vocabulary_lookup_ignores_case() {
    let vocabulary = Vocabulary::coco();
    assert_eq!(vocabulary.len(), 80);
    assert_eq!(vocabulary.name(2), Some("car"));
    assert_eq!(vocabulary.find(" Car "), Some("car"));
    assert_eq!(vocabulary.find("TV"), Some("tv"));
    assert_eq!(vocabulary.find("araba"), None);
    assert_eq!(vocabulary.name(80), None);
  }

  #[test]
  fn retain_keeps_order() {
    let item = |class_id| DetectItem {
      region: Region::Box([0.0, 0.0, 1.0, 1.0]),
      class_id,
      score: 0.9,
    };
    let result = DetectResult::from(vec![item(1), item(2), item(3), item(4)]);
    let kept = result.retain(|item| item.class_id % 2 == 0);
    let ids: Vec<u32> = kept.iter().map(|item| item.class_id).collect();
    assert_eq!(ids, vec![2, 4]);
  }

  #[test]
  fn vocabulary_from_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("labels.toml");
    std::fs::write(&path, "labels = [\"araba\", \"kedi\"]\n").unwrap();
    let vocabulary = Vocabulary::from_toml_file(&path).unwrap();
    assert_eq!(vocabulary.len(), 2);
    assert_eq!(vocabulary.name(1), Some("kedi"));

    std::fs::write(&path, "labels = []\n").unwrap();
    assert!(matches!(
      Vocabulary::from_toml_file(&path),
      Err(VocabularyError::Empty(_))
    ));
  }
}
