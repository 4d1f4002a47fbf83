// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/matcher.rs - 区域颜色匹配
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

use image::{Rgb, RgbImage};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{color::ColorValue, model::Region};

/// 平均欧氏距离阈值（RGB 空间）
pub const DEFAULT_COLOR_THRESHOLD: f32 = 200.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegionError {
  #[error("边界框完全位于图像之外: {0:?}")]
  OutOfBounds([f32; 4]),
  #[error("边界框坐标无效: {0:?}")]
  InvalidBox([f32; 4]),
  #[error("掩码尺寸 {mask_width}x{mask_height} 与图像尺寸 {width}x{height} 不一致")]
  MaskSizeMismatch {
    mask_width: u32,
    mask_height: u32,
    width: u32,
    height: u32,
  },
}

/// 取出区域内的全部像素
///
/// 退化的边界框和空掩码返回空集合；部分越界的边界框按图像裁剪。
pub fn extract_region(image: &RgbImage, region: &Region) -> Result<Vec<Rgb<u8>>, RegionError> {
  let (width, height) = image.dimensions();
  match region {
    Region::Box(bbox) => {
      if bbox.iter().any(|v| !v.is_finite()) {
        return Err(RegionError::InvalidBox(*bbox));
      }
      let [x_min, y_min, x_max, y_max] = *bbox;
      if x_max <= x_min || y_max <= y_min {
        return Ok(Vec::new());
      }
      if x_max <= 0.0 || y_max <= 0.0 || x_min >= 1.0 || y_min >= 1.0 {
        return Err(RegionError::OutOfBounds(*bbox));
      }

      let (w, h) = (width as f32, height as f32);
      let x1 = (x_min * w).floor().clamp(0.0, w) as u32;
      let y1 = (y_min * h).floor().clamp(0.0, h) as u32;
      let x2 = (x_max * w).ceil().clamp(0.0, w) as u32;
      let y2 = (y_max * h).ceil().clamp(0.0, h) as u32;

      let mut pixels = Vec::with_capacity((x2.saturating_sub(x1) * y2.saturating_sub(y1)) as usize);
      for y in y1..y2 {
        for x in x1..x2 {
          pixels.push(*image.get_pixel(x, y));
        }
      }
      Ok(pixels)
    }
    Region::Mask(mask) => {
      if mask.dimensions() != image.dimensions() {
        return Err(RegionError::MaskSizeMismatch {
          mask_width: mask.width(),
          mask_height: mask.height(),
          width,
          height,
        });
      }
      Ok(
        mask
          .enumerate_pixels()
          .filter(|(_, _, value)| value[0] > 0)
          .map(|(x, y, _)| *image.get_pixel(x, y))
          .collect(),
      )
    }
  }
}

fn distance(pixel: &Rgb<u8>, target: [u8; 3]) -> f64 {
  pixel
    .0
    .iter()
    .zip(target)
    .map(|(&p, t)| {
      let d = p as f64 - t as f64;
      d * d
    })
    .sum::<f64>()
    .sqrt()
}

/// 区域颜色匹配器
#[derive(Debug, Clone, Copy)]
pub struct RegionColorMatcher {
  threshold: f32,
}

impl Default for RegionColorMatcher {
  fn default() -> Self {
    Self {
      threshold: DEFAULT_COLOR_THRESHOLD,
    }
  }
}

impl RegionColorMatcher {
  pub fn with_threshold(threshold: f32) -> Self {
    Self { threshold }
  }

  pub fn threshold(&self) -> f32 {
    self.threshold
  }

  /// 区域平均颜色距离小于阈值时匹配
  pub fn matches(&self, pixels: &[Rgb<u8>], target: ColorValue) -> bool {
    let Some(target) = target.rgb() else {
      return true;
    };
    if pixels.is_empty() {
      return false;
    }

    let total: f64 = pixels.iter().map(|pixel| distance(pixel, target)).sum();
    let mean = total / pixels.len() as f64;
    debug!("区域平均颜色距离: {:.2} (阈值 {:.2})", mean, self.threshold);
    mean < self.threshold as f64
  }

  /// 从图像中取出区域后匹配，取像素失败时视为匹配
  pub fn matches_region(&self, image: &RgbImage, region: &Region, target: ColorValue) -> bool {
    if target.is_default() {
      return true;
    }
    match extract_region(image, region) {
      Ok(pixels) => self.matches(&pixels, target),
      Err(e) => {
        warn!("提取区域像素失败，保留该检测: {}", e);
        true
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use image::{GrayImage, Luma};

  use super::*;

  const RED: ColorValue = ColorValue::Rgb([255, 0, 0]);

  #[test]
  fn uniform_target_region_matches_any_positive_threshold() {
    let pixels = vec![Rgb([255, 0, 0]); 16];
    for threshold in [0.001, 1.0, 200.0] {
      assert!(RegionColorMatcher::with_threshold(threshold).matches(&pixels, RED));
    }
  }

  #[test]
  fn distant_color_does_not_match() {
    // (155, 0, 0) 与红色距离恰为 100
    let pixels = vec![Rgb([155, 0, 0]); 9];
    assert!(!RegionColorMatcher::with_threshold(100.0).matches(&pixels, RED));
    assert!(RegionColorMatcher::with_threshold(100.5).matches(&pixels, RED));
    let blue = vec![Rgb([0, 0, 255]); 9];
    assert!(!RegionColorMatcher::default().matches(&blue, RED));
  }

  #[test]
  fn default_target_short_circuits() {
    let matcher = RegionColorMatcher::default();
    assert!(matcher.matches(&[], ColorValue::Default));
    let image = RgbImage::new(4, 4);
    assert!(matcher.matches_region(&image, &Region::Box([2.0, 2.0, 3.0, 3.0]), ColorValue::Default));
  }

  #[test]
  fn empty_regions_do_not_match() {
    let matcher = RegionColorMatcher::default();
    let image = RgbImage::from_pixel(8, 8, Rgb([255, 0, 0]));
    assert!(!matcher.matches_region(&image, &Region::Box([0.5, 0.5, 0.5, 0.9]), RED));
    let mask = GrayImage::new(8, 8);
    assert!(!matcher.matches_region(&image, &Region::Mask(mask), RED));
  }

  #[test]
  fn extraction_failure_fails_open() {
    let matcher = RegionColorMatcher::default();
    let image = RgbImage::from_pixel(8, 8, Rgb([0, 0, 255]));
    assert!(matcher.matches_region(&image, &Region::Box([1.2, 1.2, 1.5, 1.5]), RED));
    let mask = GrayImage::from_pixel(4, 4, Luma([255]));
    assert!(matcher.matches_region(&image, &Region::Mask(mask), RED));
  }

  #[test]
  fn partially_outside_box_is_clamped() {
    let image = RgbImage::from_pixel(10, 10, Rgb([255, 0, 0]));
    let pixels = extract_region(&image, &Region::Box([0.5, 0.5, 1.5, 1.5])).unwrap();
    assert_eq!(pixels.len(), 25);
  }

  #[test]
  fn mask_uses_only_set_pixels() {
    // 左半红色、右半蓝色，掩码只覆盖左半
    let mut image = RgbImage::from_pixel(10, 10, Rgb([0, 0, 255]));
    let mut mask = GrayImage::new(10, 10);
    for y in 0..10 {
      for x in 0..5 {
        image.put_pixel(x, y, Rgb([255, 0, 0]));
        mask.put_pixel(x, y, Luma([1]));
      }
    }
    let matcher = RegionColorMatcher::default();
    assert!(matcher.matches_region(&image, &Region::Mask(mask.clone()), RED));
    // 同一目标用边界框取像素时，整幅图平均距离约 180，换更严格的阈值就不再匹配
    let strict = RegionColorMatcher::with_threshold(100.0);
    assert!(strict.matches_region(&image, &Region::Mask(mask), RED));
    assert!(!strict.matches_region(&image, &Region::Box([0.0, 0.0, 1.0, 1.0]), RED));
  }
}
