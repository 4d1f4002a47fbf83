// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use ab_glyph::{FontArc, InvalidFont, PxScale};
use image::{GrayImage, Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};

use crate::{
  color::ColorValue,
  model::{DetectItem, DetectResult, Region, Vocabulary},
};

const LABEL_FONT_SIZE: f32 = 18.0;
const LABEL_PADDING: i32 = 2;
const BORDER_THICKNESS: u32 = 2;
const MASK_ALPHA: f32 = 0.4;
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// 像素坐标下的矩形 [x_min, y_min, x_max, y_max]，包含两端
type PixelRect = (u32, u32, u32, u32);

pub struct Painter {
  font: FontArc,
  scale: PxScale,
  mask_alpha: f32,
}

impl Painter {
  pub fn new() -> Result<Self, InvalidFont> {
    // DejaVu Sans 覆盖土耳其语字符
    let font_data = include_bytes!("../../assets/DejaVuSans.ttf");
    let font = FontArc::try_from_slice(font_data)?;
    Ok(Self {
      font,
      scale: PxScale::from(LABEL_FONT_SIZE),
      mask_alpha: MASK_ALPHA,
    })
  }

  /// 在图像副本上绘制全部检测结果
  pub fn render(
    &self,
    image: &RgbImage,
    result: &DetectResult,
    vocabulary: &Vocabulary,
    color: ColorValue,
  ) -> RgbImage {
    let mut canvas = image.clone();
    let color = color.render_rgb();
    for item in result.iter() {
      self.draw_item(&mut canvas, item, vocabulary, color);
    }
    canvas
  }

  fn draw_item(&self, canvas: &mut RgbImage, item: &DetectItem, vocabulary: &Vocabulary, color: Rgb<u8>) {
    let rect = match &item.region {
      Region::Box(bbox) => box_to_pixels(bbox, canvas.width(), canvas.height()),
      Region::Mask(mask) => {
        if mask.dimensions() != canvas.dimensions() {
          tracing::warn!(
            "掩码尺寸 {:?} 与图像尺寸 {:?} 不一致，跳过绘制",
            mask.dimensions(),
            canvas.dimensions()
          );
          return;
        }
        self.overlay_mask(canvas, mask, color);
        mask_bounds(mask)
      }
    };
    let Some(rect) = rect else {
      return;
    };

    self.draw_border(canvas, rect, color);
    let name = vocabulary
      .name(item.class_id)
      .map(String::from)
      .unwrap_or_else(|| format!("#{}", item.class_id));
    let label = format!("{} {:.2}", name, item.score);
    self.draw_label(canvas, rect, &label, color);
  }

  fn overlay_mask(&self, canvas: &mut RgbImage, mask: &GrayImage, color: Rgb<u8>) {
    let alpha = self.mask_alpha;
    for (x, y, value) in mask.enumerate_pixels() {
      if value[0] == 0 {
        continue;
      }
      let pixel = canvas.get_pixel_mut(x, y);
      for c in 0..3 {
        let blended = pixel[c] as f32 * (1.0 - alpha) + color[c] as f32 * alpha;
        pixel[c] = blended.round().clamp(0.0, 255.0) as u8;
      }
    }
  }

  fn draw_border(&self, canvas: &mut RgbImage, rect: PixelRect, color: Rgb<u8>) {
    let (x_min, y_min, x_max, y_max) = rect;
    for t in 0..BORDER_THICKNESS {
      let width = (x_max - x_min + 1).saturating_sub(2 * t);
      let height = (y_max - y_min + 1).saturating_sub(2 * t);
      if width == 0 || height == 0 {
        break;
      }
      let r = Rect::at((x_min + t) as i32, (y_min + t) as i32).of_size(width, height);
      draw_hollow_rect_mut(canvas, r, color);
    }
  }

  fn draw_label(&self, canvas: &mut RgbImage, rect: PixelRect, label: &str, color: Rgb<u8>) {
    let (text_width, text_height) = text_size(self.scale, &self.font, label);
    let box_width = text_width + 2 * LABEL_PADDING as u32;
    let box_height = text_height + 2 * LABEL_PADDING as u32;

    // 优先放在边框上方，空间不足时放进框内
    let x = rect.0 as i32;
    let y = if rect.1 as i32 >= box_height as i32 {
      rect.1 as i32 - box_height as i32
    } else {
      rect.1 as i32
    };

    let max_width = canvas.width().saturating_sub(x as u32);
    let box_width = box_width.min(max_width);
    if box_width == 0 || box_height == 0 {
      return;
    }
    draw_filled_rect_mut(canvas, Rect::at(x, y).of_size(box_width, box_height), color);
    draw_text_mut(
      canvas,
      LABEL_TEXT_COLOR,
      x + LABEL_PADDING,
      y + LABEL_PADDING,
      self.scale,
      &self.font,
      label,
    );
  }
}

/// 归一化边界框转换为像素矩形，完全落在图像外时为 `None`
fn box_to_pixels(bbox: &[f32; 4], width: u32, height: u32) -> Option<PixelRect> {
  if width == 0 || height == 0 || bbox.iter().any(|v| !v.is_finite()) {
    return None;
  }
  let (w, h) = (width as f32, height as f32);
  let x_min = (bbox[0] * w).floor().max(0.0);
  let y_min = (bbox[1] * h).floor().max(0.0);
  let x_max = ((bbox[2] * w).ceil() - 1.0).min(w - 1.0);
  let y_max = ((bbox[3] * h).ceil() - 1.0).min(h - 1.0);
  if x_min > x_max || y_min > y_max {
    return None;
  }
  Some((x_min as u32, y_min as u32, x_max as u32, y_max as u32))
}

/// 掩码中所有置位像素的外接矩形
pub fn mask_bounds(mask: &GrayImage) -> Option<PixelRect> {
  let mut bounds: Option<PixelRect> = None;
  for (x, y, value) in mask.enumerate_pixels() {
    if value[0] == 0 {
      continue;
    }
    bounds = Some(match bounds {
      None => (x, y, x, y),
      Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
    });
  }
  bounds
}
