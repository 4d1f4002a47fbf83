// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/pipeline.rs - 检测过滤流水线
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

//! 查询 → 检测 → 类别过滤 → 颜色过滤 → 绘制。
//!
//! 查询中的颜色词只提取一次，去掉颜色词后的部分交给类别解析器。
//! 过滤保持模型输出的顺序。

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  color::{ColorLexicon, ColorValue},
  matcher::RegionColorMatcher,
  model::{DetectResult, Mode, Model, Vocabulary},
  output::draw::Painter,
  resolver::{ClassResolver, ResolvedClasses, TextClassifier},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("模型推理失败: {0}")]
  Inference(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("无法加载嵌入字体: {0}")]
  Font(#[from] ab_glyph::InvalidFont),
}

/// 预处理后的查询，一次运行内复用
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedQuery {
  pub query: String,
  pub color: ColorValue,
  pub class_term: String,
  pub classes: ResolvedClasses,
}

/// 单帧处理结果
#[derive(Debug, Clone)]
pub struct PipelineOutput {
  pub detections: DetectResult,
  pub annotated: RgbImage,
}

impl PipelineOutput {
  pub fn is_empty(&self) -> bool {
    self.detections.is_empty()
  }
}

pub struct FilterPipeline<M, C> {
  model: M,
  resolver: ClassResolver<C>,
  lexicon: ColorLexicon,
  matcher: RegionColorMatcher,
  painter: Painter,
}

impl<M, C> FilterPipeline<M, C>
where
  M: Model<Input = RgbImage, Output = DetectResult>,
  M::Error: std::error::Error + Send + Sync + 'static,
  C: TextClassifier,
{
  pub fn new(model: M, classifier: C) -> Result<Self, PipelineError> {
    Ok(Self {
      model,
      resolver: ClassResolver::new(classifier),
      lexicon: ColorLexicon::default(),
      matcher: RegionColorMatcher::default(),
      painter: Painter::new()?,
    })
  }

  pub fn with_matcher(mut self, matcher: RegionColorMatcher) -> Self {
    self.matcher = matcher;
    self
  }

  pub fn mode(&self) -> Mode {
    self.model.mode()
  }

  pub fn vocabulary(&self) -> &Vocabulary {
    self.model.vocabulary()
  }

  pub fn model(&self) -> &M {
    &self.model
  }

  fn split_query(&self, query: &str) -> (ColorValue, String) {
    match self.lexicon.extract(query) {
      Some(entry) => {
        let class_term = self.lexicon.strip_color_terms(query, entry.color);
        info!("查询颜色: {} -> {:?}, 类别描述: \"{}\"", entry.term, entry.color, class_term);
        (entry.color, class_term)
      }
      None => (ColorValue::Default, query.to_string()),
    }
  }

  /// 提取颜色并解析类别
  pub fn prepare(&self, query: &str) -> PreparedQuery {
    let (color, class_term) = self.split_query(query);
    let classes = self.resolver.resolve(&class_term, self.model.vocabulary());
    PreparedQuery {
      query: query.to_string(),
      color,
      class_term,
      classes,
    }
  }

  fn infer(&self, image: &RgbImage) -> Result<DetectResult, PipelineError> {
    let now = std::time::Instant::now();
    let raw = self
      .model
      .infer(image)
      .map_err(|e| PipelineError::Inference(Box::new(e)))?;
    debug!("推理完成，耗时: {:.2?}, 共 {} 个目标", now.elapsed(), raw.len());
    Ok(raw)
  }

  fn filter_and_render(
    &self,
    image: &RgbImage,
    raw: DetectResult,
    color: ColorValue,
    classes: &ResolvedClasses,
  ) -> PipelineOutput {
    let vocabulary = self.model.vocabulary();
    let detections = raw.retain(|item| {
      vocabulary
        .name(item.class_id)
        .map(|name| classes.contains(name))
        .unwrap_or(false)
    });
    debug!("类别过滤后剩余 {} 个目标", detections.len());

    let detections = if color.is_default() {
      detections
    } else {
      let kept = detections.retain(|item| self.matcher.matches_region(image, &item.region, color));
      debug!("颜色过滤后剩余 {} 个目标", kept.len());
      kept
    };

    let annotated = self.painter.render(image, &detections, vocabulary, color);
    PipelineOutput {
      detections,
      annotated,
    }
  }

  /// 处理单帧，依次完成颜色提取、推理、类别解析、过滤与绘制
  pub fn run(&self, image: &RgbImage, query: &str) -> Result<PipelineOutput, PipelineError> {
    let (color, class_term) = self.split_query(query);
    let raw = self.infer(image)?;
    let classes = self.resolver.resolve(&class_term, self.model.vocabulary());
    Ok(self.filter_and_render(image, raw, color, &classes))
  }

  /// 使用预处理过的查询处理单帧
  pub fn run_prepared(
    &self,
    image: &RgbImage,
    prepared: &PreparedQuery,
  ) -> Result<PipelineOutput, PipelineError> {
    let raw = self.infer(image)?;
    Ok(self.filter_and_render(image, raw, prepared.color, &prepared.classes))
  }

  /// 结果中每个目标的类别名
  pub fn object_names(&self, detections: &DetectResult) -> Vec<String> {
    let vocabulary = self.model.vocabulary();
    detections
      .iter()
      .map(|item| {
        vocabulary
          .name(item.class_id)
          .map(String::from)
          .unwrap_or_else(|| format!("#{}", item.class_id))
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use std::cell::{Cell, RefCell};

  use image::Rgb;

  use super::*;
  use crate::{
    model::{DetectItem, Region},
    resolver::ClassifierError,
  };

  #[derive(Debug, Error)]
  #[error("模型损坏")]
  struct Broken;

  struct FakeModel {
    items: Vec<DetectItem>,
    vocabulary: Vocabulary,
    fail: bool,
    calls: Cell<usize>,
  }

  impl FakeModel {
    fn new(items: Vec<DetectItem>) -> Self {
      Self {
        items,
        vocabulary: Vocabulary::coco(),
        fail: false,
        calls: Cell::new(0),
      }
    }
  }

  impl Model for FakeModel {
    type Input = RgbImage;
    type Output = DetectResult;
    type Error = Broken;

    fn infer(&self, _input: &RgbImage) -> Result<DetectResult, Broken> {
      self.calls.set(self.calls.get() + 1);
      if self.fail {
        return Err(Broken);
      }
      Ok(DetectResult::from(self.items.clone()))
    }

    fn vocabulary(&self) -> &Vocabulary {
      &self.vocabulary
    }

    fn mode(&self) -> Mode {
      Mode::Detect
    }
  }

  struct Reply {
    reply: Result<&'static str, ()>,
    terms: RefCell<Vec<String>>,
  }

  impl Reply {
    fn ok(reply: &'static str) -> Self {
      Self {
        reply: Ok(reply),
        terms: RefCell::new(Vec::new()),
      }
    }
  }

  impl TextClassifier for Reply {
    type Error = ClassifierError;

    fn complete(&self, prompt: &str) -> Result<String, Self::Error> {
      let term = prompt.split('"').nth(1).unwrap_or_default().to_string();
      self.terms.borrow_mut().push(term);
      self
        .reply
        .map(String::from)
        .map_err(|_| ClassifierError::Timeout("60s".into()))
    }
  }

  fn boxed(class_id: u32, bbox: [f32; 4]) -> DetectItem {
    DetectItem {
      region: Region::Box(bbox),
      class_id,
      score: 0.8,
    }
  }

  /// 左半红色、右半蓝色
  fn red_blue_image() -> RgbImage {
    RgbImage::from_fn(100, 50, |x, _| {
      if x < 50 {
        Rgb([230, 20, 20])
      } else {
        Rgb([20, 20, 230])
      }
    })
  }

  #[test]
  fn color_filter_keeps_matching_car() {
    let model = FakeModel::new(vec![
      boxed(2, [0.0, 0.0, 0.5, 1.0]),
      boxed(2, [0.5, 0.0, 1.0, 1.0]),
    ]);
    let pipeline = FilterPipeline::new(model, Reply::ok("car")).unwrap();
    let output = pipeline.run(&red_blue_image(), "kırmızı arabaları göster").unwrap();

    assert_eq!(output.detections.len(), 1);
    assert_eq!(output.detections.items[0].region, Region::Box([0.0, 0.0, 0.5, 1.0]));
    // 分类器只看到去掉颜色后的描述
    assert_eq!(pipeline.resolver.classifier().terms.borrow()[0], "arabaları göster");
  }

  #[test]
  fn no_color_skips_color_filter() {
    let model = FakeModel::new(vec![
      boxed(2, [0.0, 0.0, 0.5, 1.0]),
      boxed(15, [0.2, 0.2, 0.4, 0.4]),
      boxed(2, [0.5, 0.0, 1.0, 1.0]),
    ]);
    let pipeline = FilterPipeline::new(model, Reply::ok("car")).unwrap();
    let output = pipeline.run(&red_blue_image(), "arabaları göster").unwrap();
    assert_eq!(output.detections.len(), 2);
    assert_eq!(pipeline.object_names(&output.detections), vec!["car", "car"]);
  }

  #[test]
  fn filtering_preserves_model_order() {
    let items: Vec<DetectItem> = (0..6)
      .map(|i| {
        let x = 0.1 * i as f32;
        boxed(if i % 2 == 0 { 2 } else { 7 }, [x, 0.0, x + 0.1, 1.0])
      })
      .collect();
    let model = FakeModel::new(items.clone());
    let pipeline = FilterPipeline::new(model, Reply::ok("car, truck")).unwrap();
    let output = pipeline.run(&red_blue_image(), "araçlar").unwrap();
    assert_eq!(output.detections.items.to_vec(), items);
  }

  #[test]
  fn classifier_failure_gives_empty_result() {
    let model = FakeModel::new(vec![boxed(2, [0.0, 0.0, 1.0, 1.0])]);
    let classifier = Reply {
      reply: Err(()),
      terms: RefCell::new(Vec::new()),
    };
    let pipeline = FilterPipeline::new(model, classifier).unwrap();
    let image = red_blue_image();
    let output = pipeline.run(&image, "araba").unwrap();
    assert!(output.is_empty());
    assert_eq!(output.annotated, image);
  }

  #[test]
  fn inference_failure_is_an_error() {
    let mut model = FakeModel::new(Vec::new());
    model.fail = true;
    let pipeline = FilterPipeline::new(model, Reply::ok("car")).unwrap();
    assert!(matches!(
      pipeline.run(&red_blue_image(), "araba"),
      Err(PipelineError::Inference(_))
    ));
  }

  #[test]
  fn prepared_query_resolves_once() {
    let model = FakeModel::new(vec![boxed(2, [0.5, 0.0, 1.0, 1.0])]);
    let pipeline = FilterPipeline::new(model, Reply::ok("car")).unwrap();
    let prepared = pipeline.prepare("MAVİ arabalar");
    assert_eq!(prepared.color, ColorValue::Rgb([0, 0, 255]));
    assert_eq!(prepared.class_term, "arabalar");

    let image = red_blue_image();
    for _ in 0..3 {
      let output = pipeline.run_prepared(&image, &prepared).unwrap();
      assert_eq!(output.detections.len(), 1);
    }
    assert_eq!(pipeline.model().calls.get(), 3);
    assert_eq!(pipeline.resolver.classifier().terms.borrow().len(), 1);
  }
}
