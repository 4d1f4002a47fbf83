// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/model/yolo.rs - YOLOv8 ONNX 模型（tract 后端）
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

use image::{GrayImage, Luma, RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::{debug, error, info};
use tract_onnx::prelude::*;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{DetectItem, DetectResult, Mode, Model, Region, Vocabulary},
  utils::{query_map, query_param, url_path},
};

const YOLO_INPUT_SIZE: usize = 640;
const YOLO_MASK_DIM: usize = 32;
const YOLO_DEFAULT_CONF: f32 = 0.25;
const YOLO_DEFAULT_IOU: f32 = 0.45;
const YOLO_MASK_THRESH: f32 = 0.5;

type YoloPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

#[derive(Error, Debug)]
pub enum YoloError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("模型加载错误: {path}: {message}")]
  Load { path: String, message: String },
  #[error("推理错误: {0}")]
  Inference(String),
  #[error("模型输出形状不符合预期: {0}")]
  OutputShape(String),
}

pub struct YoloBuilder {
  model_path: String,
  mode: Mode,
  conf_threshold: f32,
  iou_threshold: f32,
  vocabulary: Vocabulary,
}

impl FromUrlWithScheme for YoloBuilder {
  const SCHEME: &'static str = "yolo";
}

impl FromUrl for YoloBuilder {
  type Error = YoloError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(YoloError::SchemeMismatch(url.scheme().to_string()));
    }

    let query = query_map(url);
    let mode = match query.get("mode").map(String::as_str) {
      Some("segment") => Mode::Segment,
      _ => Mode::Detect,
    };
    Ok(Self {
      model_path: url_path(url),
      mode,
      conf_threshold: query_param(&query, "conf").unwrap_or(YOLO_DEFAULT_CONF),
      iou_threshold: query_param(&query, "iou").unwrap_or(YOLO_DEFAULT_IOU),
      vocabulary: Vocabulary::coco(),
    })
  }
}

impl YoloBuilder {
  pub fn with_mode(mut self, mode: Mode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_vocabulary(mut self, vocabulary: Vocabulary) -> Self {
    self.vocabulary = vocabulary;
    self
  }

  pub fn with_conf_threshold(mut self, conf_threshold: f32) -> Self {
    self.conf_threshold = conf_threshold;
    self
  }

  pub fn with_iou_threshold(mut self, iou_threshold: f32) -> Self {
    self.iou_threshold = iou_threshold;
    self
  }

  pub fn model_path(&self) -> &str {
    &self.model_path
  }

  pub fn build(self) -> Result<YoloModel, YoloError> {
    info!("加载模型文件: {} ({})", self.model_path, self.mode);
    let load_error = |e: TractError| YoloError::Load {
      path: self.model_path.clone(),
      message: e.to_string(),
    };
    let plan = tract_onnx::onnx()
      .model_for_path(&self.model_path)
      .map_err(load_error)?
      .with_input_fact(
        0,
        InferenceFact::dt_shape(
          f32::datum_type(),
          tvec!(1, 3, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE),
        ),
      )
      .map_err(load_error)?
      .into_optimized()
      .map_err(load_error)?
      .into_runnable()
      .map_err(load_error)?;
    info!("模型加载完成");
    debug!(
      "置信度阈值 {:.2}, NMS 阈值 {:.2}, 类别数 {}",
      self.conf_threshold,
      self.iou_threshold,
      self.vocabulary.len()
    );

    Ok(YoloModel {
      plan,
      mode: self.mode,
      conf_threshold: self.conf_threshold,
      iou_threshold: self.iou_threshold,
      vocabulary: self.vocabulary,
    })
  }
}

pub struct YoloModel {
  plan: YoloPlan,
  mode: Mode,
  conf_threshold: f32,
  iou_threshold: f32,
  vocabulary: Vocabulary,
}

/// 解码后的候选框，坐标为模型输入像素
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
  bbox: [f32; 4],
  class_id: u32,
  score: f32,
  coeffs: Vec<f32>,
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);
  let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - inter;
  if union <= 0.0 { 0.0 } else { inter / union }
}

/// 按类别做非极大值抑制，结果按分数降序
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
  let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
  for candidate in candidates {
    let suppressed = kept.iter().any(|k| {
      k.class_id == candidate.class_id && iou(&k.bbox, &candidate.bbox) > iou_threshold
    });
    if !suppressed {
      kept.push(candidate);
    }
  }
  kept
}

/// 解码 `[4 + 类别数 + 掩码系数, 候选数]` 排列的输出
fn decode_candidates(
  data: &[f32],
  anchors: usize,
  num_classes: usize,
  mask_dim: usize,
  conf_threshold: f32,
) -> Vec<Candidate> {
  let at = |channel: usize, anchor: usize| data[channel * anchors + anchor];
  let mut candidates = Vec::new();
  for anchor in 0..anchors {
    let mut best = (0usize, f32::NEG_INFINITY);
    for class in 0..num_classes {
      let score = at(4 + class, anchor);
      if score > best.1 {
        best = (class, score);
      }
    }
    if best.1 < conf_threshold {
      continue;
    }

    let (cx, cy, w, h) = (at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor));
    let coeffs = (0..mask_dim)
      .map(|k| at(4 + num_classes + k, anchor))
      .collect();
    candidates.push(Candidate {
      bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
      class_id: best.0 as u32,
      score: best.1,
      coeffs,
    });
  }
  candidates
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

/// 用掩码系数组合原型，裁剪到边界框后放大到原图尺寸
fn build_mask(
  coeffs: &[f32],
  protos: &[f32],
  proto_h: usize,
  proto_w: usize,
  bbox: &[f32; 4],
  width: u32,
  height: u32,
) -> GrayImage {
  let plane = proto_h * proto_w;
  let x1 = bbox[0] * proto_w as f32;
  let y1 = bbox[1] * proto_h as f32;
  let x2 = bbox[2] * proto_w as f32;
  let y2 = bbox[3] * proto_h as f32;

  let small = GrayImage::from_fn(proto_w as u32, proto_h as u32, |x, y| {
    let (fx, fy) = (x as f32 + 0.5, y as f32 + 0.5);
    if fx < x1 || fx > x2 || fy < y1 || fy > y2 {
      return Luma([0]);
    }
    let offset = y as usize * proto_w + x as usize;
    let logit: f32 = coeffs
      .iter()
      .enumerate()
      .map(|(k, c)| c * protos[k * plane + offset])
      .sum();
    if sigmoid(logit) > YOLO_MASK_THRESH {
      Luma([255])
    } else {
      Luma([0])
    }
  });
  image::imageops::resize(&small, width, height, FilterType::Nearest)
}

fn normalize(bbox: &[f32; 4]) -> [f32; 4] {
  let size = YOLO_INPUT_SIZE as f32;
  bbox.map(|v| (v / size).clamp(0.0, 1.0))
}

impl YoloModel {
  fn prepare_input(image: &RgbImage) -> Tensor {
    let resized = image::imageops::resize(
      image,
      YOLO_INPUT_SIZE as u32,
      YOLO_INPUT_SIZE as u32,
      FilterType::Triangle,
    );
    tract_ndarray::Array4::from_shape_fn(
      (1, 3, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE),
      |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
    )
    .into_tensor()
  }

  fn mask_dim(&self) -> usize {
    match self.mode {
      Mode::Detect => 0,
      Mode::Segment => YOLO_MASK_DIM,
    }
  }
}

impl Model for YoloModel {
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = YoloError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let tensor = Self::prepare_input(input);
    let outputs = self
      .plan
      .run(tvec!(tensor.into()))
      .map_err(|e| YoloError::Inference(e.to_string()))?;

    let head = outputs
      .first()
      .ok_or_else(|| YoloError::OutputShape("模型没有输出".to_string()))?;
    let shape = head.shape().to_vec();
    if shape.len() != 3 || shape[0] != 1 {
      return Err(YoloError::OutputShape(format!("检测头形状 {:?}", shape)));
    }
    let (channels, anchors) = (shape[1], shape[2]);
    let mask_dim = self.mask_dim();
    let num_classes = self.vocabulary.len();
    if channels != 4 + num_classes + mask_dim {
      return Err(YoloError::OutputShape(format!(
        "检测头通道数 {}，期望 {} (类别 {}, 掩码系数 {})",
        channels,
        4 + num_classes + mask_dim,
        num_classes,
        mask_dim
      )));
    }
    let data = head
      .as_slice::<f32>()
      .map_err(|e| YoloError::Inference(e.to_string()))?;

    let candidates = decode_candidates(data, anchors, num_classes, mask_dim, self.conf_threshold);
    let candidates = nms(candidates, self.iou_threshold);
    debug!("检测到 {} 个目标", candidates.len());

    let items: Vec<DetectItem> = match self.mode {
      Mode::Detect => candidates
        .into_iter()
        .map(|c| DetectItem {
          region: Region::Box(normalize(&c.bbox)),
          class_id: c.class_id,
          score: c.score,
        })
        .collect(),
      Mode::Segment => {
        let protos = outputs
          .get(1)
          .ok_or_else(|| YoloError::OutputShape("分割模型缺少原型输出".to_string()))?;
        let proto_shape = protos.shape().to_vec();
        if proto_shape.len() != 4 || proto_shape[1] != YOLO_MASK_DIM {
          return Err(YoloError::OutputShape(format!("原型形状 {:?}", proto_shape)));
        }
        let (proto_h, proto_w) = (proto_shape[2], proto_shape[3]);
        let protos = protos
          .as_slice::<f32>()
          .map_err(|e| YoloError::Inference(e.to_string()))?;
        candidates
          .into_iter()
          .map(|c| {
            let bbox = normalize(&c.bbox);
            DetectItem {
              region: Region::Mask(build_mask(
                &c.coeffs,
                protos,
                proto_h,
                proto_w,
                &bbox,
                input.width(),
                input.height(),
              )),
              class_id: c.class_id,
              score: c.score,
            }
          })
          .collect()
      }
    };
    Ok(DetectResult::from(items))
  }

  fn vocabulary(&self) -> &Vocabulary {
    &self.vocabulary
  }

  fn mode(&self) -> Mode {
    self.mode
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn candidate(bbox: [f32; 4], class_id: u32, score: f32) -> Candidate {
    Candidate {
      bbox,
      class_id,
      score,
      coeffs: Vec::new(),
    }
  }

  #[test]
  fn nms_is_class_aware() {
    let kept = nms(
      vec![
        candidate([0.0, 0.0, 10.0, 10.0], 0, 0.8),
        candidate([1.0, 1.0, 10.0, 10.0], 0, 0.9),
        candidate([1.0, 1.0, 10.0, 10.0], 1, 0.7),
        candidate([50.0, 50.0, 60.0, 60.0], 0, 0.6),
      ],
      0.45,
    );
    let summary: Vec<(u32, f32)> = kept.iter().map(|c| (c.class_id, c.score)).collect();
    assert_eq!(summary, vec![(0, 0.9), (1, 0.7), (0, 0.6)]);
  }

  #[test]
  fn decode_picks_best_class_above_threshold() {
    // 2 个类别、3 个候选，通道优先排列
    let anchors = 3;
    #[rustfmt::skip]
    let data = vec![
      320.0, 100.0, 50.0,  // cx
      320.0, 100.0, 50.0,  // cy
      64.0,  20.0,  10.0,  // w
      32.0,  20.0,  10.0,  // h
      0.1,   0.7,   0.05,  // class 0
      0.9,   0.2,   0.1,   // class 1
    ];
    let decoded = decode_candidates(&data, anchors, 2, 0, 0.25);
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded[0].class_id, 1);
    assert_eq!(decoded[0].bbox, [288.0, 304.0, 352.0, 336.0]);
    assert_eq!(decoded[1].class_id, 0);
    assert_eq!(normalize(&decoded[0].bbox), [0.45, 0.475, 0.55, 0.525]);
  }

  #[test]
  fn mask_is_cropped_to_box_and_upsampled() {
    // 单个原型平面全为正，系数为 1
    let protos = vec![4.0; 4 * 4];
    let mask = build_mask(&[1.0], &protos, 4, 4, &[0.0, 0.0, 0.5, 0.5], 8, 8);
    assert_eq!(mask.dimensions(), (8, 8));
    assert_eq!(mask.get_pixel(1, 1)[0], 255);
    assert_eq!(mask.get_pixel(6, 6)[0], 0);
    let set = mask.pixels().filter(|p| p[0] > 0).count();
    assert_eq!(set, 16);
  }

  #[test]
  fn builder_reads_thresholds_from_url() {
    let url = Url::parse("yolo:///models/yolov8n-seg.onnx?conf=0.4&iou=0.5&mode=segment").unwrap();
    let builder = YoloBuilder::from_url(&url).unwrap();
    assert_eq!(builder.model_path(), "/models/yolov8n-seg.onnx");
    assert_eq!(builder.conf_threshold, 0.4);
    assert_eq!(builder.iou_threshold, 0.5);
    assert_eq!(builder.mode, Mode::Segment);

    let url = Url::parse("onnx:///models/yolov8n.onnx").unwrap();
    assert!(matches!(
      YoloBuilder::from_url(&url),
      Err(YoloError::SchemeMismatch(_))
    ));
  }
}
