#![allow(dead_code)]

use std::sync::{
  Arc,
  atomic::{AtomicUsize, Ordering},
};

use image::{Rgb, RgbImage};
use thiserror::Error;

use gozcu::{
  input::{InputError, InputSource, InputSourceType, MemoryInput},
  frame::{Frame, SourceMetadata},
  model::{DetectItem, DetectResult, Mode, Model, Region, Vocabulary},
  pipeline::FilterPipeline,
  resolver::{ClassifierError, TextClassifier},
  task::LiveControls,
};

pub const CAR: u32 = 2;
pub const CAT: u32 = 15;

#[derive(Debug, Error)]
#[error("模型损坏")]
pub struct Broken;

/// 每帧都返回同一组检测结果
pub struct FixedModel {
  items: Vec<DetectItem>,
  vocabulary: Vocabulary,
  calls: Arc<AtomicUsize>,
}

impl FixedModel {
  pub fn new(items: Vec<DetectItem>) -> Self {
    Self {
      items,
      vocabulary: Vocabulary::coco(),
      calls: Arc::new(AtomicUsize::new(0)),
    }
  }

  pub fn calls(&self) -> Arc<AtomicUsize> {
    self.calls.clone()
  }
}

impl Model for FixedModel {
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = Broken;

  fn infer(&self, _input: &RgbImage) -> Result<DetectResult, Broken> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    Ok(DetectResult::from(self.items.clone()))
  }

  fn vocabulary(&self) -> &Vocabulary {
    &self.vocabulary
  }

  fn mode(&self) -> Mode {
    Mode::Detect
  }
}

/// 在指定的第 n 次调用（从 1 开始）时失败
pub struct FlakyModel {
  inner: FixedModel,
  failing_calls: Vec<usize>,
}

impl FlakyModel {
  pub fn new(items: Vec<DetectItem>, failing_calls: Vec<usize>) -> Self {
    Self {
      inner: FixedModel::new(items),
      failing_calls,
    }
  }
}

impl Model for FlakyModel {
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = Broken;

  fn infer(&self, input: &RgbImage) -> Result<DetectResult, Broken> {
    let call = self.inner.calls.load(Ordering::SeqCst) + 1;
    let result = self.inner.infer(input)?;
    if self.failing_calls.contains(&call) {
      return Err(Broken);
    }
    Ok(result)
  }

  fn vocabulary(&self) -> &Vocabulary {
    self.inner.vocabulary()
  }

  fn mode(&self) -> Mode {
    Mode::Detect
  }
}

pub fn flaky_car_pipeline(failing_calls: Vec<usize>) -> FilterPipeline<FlakyModel, StaticClassifier> {
  let model = FlakyModel::new(vec![boxed(CAR, [0.1, 0.1, 0.4, 0.6])], failing_calls);
  FilterPipeline::new(model, StaticClassifier(Some("car"))).unwrap()
}

/// 固定回复的分类器，`None` 表示超时
pub struct StaticClassifier(pub Option<&'static str>);

impl TextClassifier for StaticClassifier {
  type Error = ClassifierError;

  fn complete(&self, _prompt: &str) -> Result<String, Self::Error> {
    self
      .0
      .map(String::from)
      .ok_or_else(|| ClassifierError::Timeout("60s".to_string()))
  }
}

pub fn boxed(class_id: u32, bbox: [f32; 4]) -> DetectItem {
  DetectItem {
    region: Region::Box(bbox),
    class_id,
    score: 0.9,
  }
}

pub fn car_pipeline(reply: Option<&'static str>) -> FilterPipeline<FixedModel, StaticClassifier> {
  let model = FixedModel::new(vec![boxed(CAR, [0.1, 0.1, 0.4, 0.6])]);
  FilterPipeline::new(model, StaticClassifier(reply)).unwrap()
}

/// 左半红色、右半蓝色
pub fn red_blue_image() -> RgbImage {
  RgbImage::from_fn(100, 50, |x, _| {
    if x < 50 {
      Rgb([230, 20, 20])
    } else {
      Rgb([20, 20, 230])
    }
  })
}

pub fn gray_frames(count: usize) -> Vec<RgbImage> {
  (0..count)
    .map(|i| RgbImage::from_pixel(64, 48, Rgb([(i * 20) as u8, 100, 100])))
    .collect()
}

/// 读到指定帧时打开检测的输入源
pub struct ToggleInput {
  inner: MemoryInput,
  controls: Arc<LiveControls>,
  enable_at: u64,
  next_index: u64,
}

impl ToggleInput {
  pub fn new(frames: Vec<RgbImage>, controls: Arc<LiveControls>, enable_at: u64) -> Self {
    Self {
      inner: MemoryInput::new(frames, None).with_source_type(InputSourceType::Camera),
      controls,
      enable_at,
      next_index: 0,
    }
  }
}

impl Iterator for ToggleInput {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.next_index == self.enable_at {
      self.controls.set_enabled(true);
    }
    self.next_index += 1;
    self.inner.next()
  }
}

impl InputSource for ToggleInput {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Camera
  }

  fn metadata(&self) -> SourceMetadata {
    self.inner.metadata()
  }
}

/// 无限重复同一帧的摄像头
pub struct EndlessCamera {
  image: RgbImage,
  next_index: u64,
}

impl EndlessCamera {
  pub fn new(image: RgbImage) -> Self {
    Self {
      image,
      next_index: 0,
    }
  }
}

impl Iterator for EndlessCamera {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    let index = self.next_index;
    self.next_index += 1;
    std::thread::sleep(std::time::Duration::from_millis(1));
    Some(Ok(Frame::new(self.image.clone(), index, index)))
  }
}

impl InputSource for EndlessCamera {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Camera
  }

  fn metadata(&self) -> SourceMetadata {
    SourceMetadata {
      frame_count: None,
      fps: None,
      width: self.image.width(),
      height: self.image.height(),
    }
  }
}
