// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/color.rs - 颜色词典
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

//! 查询语句中的颜色词提取。
//!
//! 全部颜色值按 RGB 通道顺序存储，与 [`image::RgbImage`] 一致，
//! 匹配与绘制使用同一套约定。

use image::Rgb;

/// 未指定颜色时的绘制颜色（绿色）
pub const DEFAULT_RENDER_COLOR: [u8; 3] = [0, 255, 0];

/// 规范颜色值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorValue {
  /// 查询中没有颜色约束
  #[default]
  Default,
  /// RGB 颜色
  Rgb([u8; 3]),
}

impl ColorValue {
  pub fn is_default(&self) -> bool {
    matches!(self, ColorValue::Default)
  }

  /// 匹配用的 RGB 值，`Default` 没有对应值
  pub fn rgb(&self) -> Option<[u8; 3]> {
    match self {
      ColorValue::Default => None,
      ColorValue::Rgb(rgb) => Some(*rgb),
    }
  }

  /// 绘制用的颜色
  pub fn render_rgb(&self) -> Rgb<u8> {
    Rgb(self.rgb().unwrap_or(DEFAULT_RENDER_COLOR))
  }
}

/// 词典条目：一个拼写对应一个颜色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorEntry {
  pub term: &'static str,
  pub color: ColorValue,
}

const fn entry(term: &'static str, rgb: [u8; 3]) -> ColorEntry {
  ColorEntry {
    term,
    color: ColorValue::Rgb(rgb),
  }
}

const RED: [u8; 3] = [255, 0, 0];
const BLUE: [u8; 3] = [0, 0, 255];
const GREEN: [u8; 3] = [0, 255, 0];
const YELLOW: [u8; 3] = [255, 255, 0];
const BLACK: [u8; 3] = [0, 0, 0];
const WHITE: [u8; 3] = [255, 255, 255];
const ORANGE: [u8; 3] = [255, 165, 0];
const PURPLE: [u8; 3] = [128, 0, 128];
const PINK: [u8; 3] = [255, 192, 203];
const BROWN: [u8; 3] = [139, 69, 19];
const GRAY: [u8; 3] = [128, 128, 128];
const NAVY: [u8; 3] = [0, 0, 128];

// 顺序即匹配优先级。较长的土耳其语词放在前面；
// 英语 "orange" 与 COCO 类别同名，不收录。
const LEXICON: &[ColorEntry] = &[
  entry("kahverengi", BROWN),
  entry("lacivert", NAVY),
  entry("turuncu", ORANGE),
  entry("kırmızı", RED),
  entry("kirmizi", RED),
  entry("mavi", BLUE),
  entry("yeşil", GREEN),
  entry("yesil", GREEN),
  entry("sarı", YELLOW),
  entry("sari", YELLOW),
  entry("siyah", BLACK),
  entry("beyaz", WHITE),
  entry("mor", PURPLE),
  entry("pembe", PINK),
  entry("gri", GRAY),
  entry("red", RED),
  entry("blue", BLUE),
  entry("green", GREEN),
  entry("yellow", YELLOW),
  entry("black", BLACK),
  entry("white", WHITE),
  entry("purple", PURPLE),
  entry("pink", PINK),
  entry("brown", BROWN),
  entry("gray", GRAY),
  entry("grey", GRAY),
];

/// 大小写折叠。土耳其语的 `İ` 单独处理，避免出现组合点。
pub fn fold_case(text: &str) -> String {
  let mut folded = String::with_capacity(text.len());
  for ch in text.chars() {
    match ch {
      'İ' => folded.push('i'),
      _ => folded.extend(ch.to_lowercase()),
    }
  }
  folded
}

/// 颜色词典
#[derive(Debug, Clone, Copy)]
pub struct ColorLexicon {
  entries: &'static [ColorEntry],
}

impl Default for ColorLexicon {
  fn default() -> Self {
    Self { entries: LEXICON }
  }
}

impl ColorLexicon {
  pub fn entries(&self) -> &'static [ColorEntry] {
    self.entries
  }

  /// 按词典顺序返回第一个出现在查询中的条目
  pub fn extract(&self, query: &str) -> Option<&'static ColorEntry> {
    let folded = fold_case(query);
    self
      .entries
      .iter()
      .find(|entry| folded.contains(entry.term))
  }

  pub fn extract_color(&self, query: &str) -> ColorValue {
    self
      .extract(query)
      .map(|entry| entry.color)
      .unwrap_or_default()
  }

  /// 颜色对应的首个拼写
  pub fn name_of(&self, color: ColorValue) -> Option<&'static str> {
    self
      .entries
      .iter()
      .find(|entry| entry.color == color)
      .map(|entry| entry.term)
  }

  /// 去掉查询中第一次出现的 `matched_term`，结果为小写并去除首尾空白
  pub fn strip_color_term(&self, query: &str, matched_term: &str) -> String {
    let folded = fold_case(query);
    let term = fold_case(matched_term);
    if term.is_empty() {
      return folded.trim().to_string();
    }
    folded.replacen(&term, "", 1).trim().to_string()
  }

  /// 去掉映射到 `color` 的所有拼写的所有出现
  pub fn strip_color_terms(&self, query: &str, color: ColorValue) -> String {
    let mut folded = fold_case(query);
    if color.is_default() {
      return folded.trim().to_string();
    }
    for entry in self.entries.iter().filter(|entry| entry.color == color) {
      folded = folded.replace(entry.term, "");
    }
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn extracts_turkish_and_english_colors() {
    let lexicon = ColorLexicon::default();
    assert_eq!(
      lexicon.extract_color("kırmızı arabaları göster"),
      ColorValue::Rgb(RED)
    );
    assert_eq!(lexicon.extract_color("show blue cars"), ColorValue::Rgb(BLUE));
    assert_eq!(
      lexicon.extract_color("YEŞİL sandalyeleri tespit et"),
      ColorValue::Rgb(GREEN)
    );
  }

  #[test]
  fn uppercase_turkish_folds_to_ascii_spelling() {
    let lexicon = ColorLexicon::default();
    // "KIRMIZI" 折叠为 "kirmizi"
    let entry = lexicon.extract("KIRMIZI kediler").unwrap();
    assert_eq!(entry.term, "kirmizi");
    assert_eq!(entry.color, ColorValue::Rgb(RED));
  }

  #[test]
  fn no_color_yields_default() {
    let lexicon = ColorLexicon::default();
    assert_eq!(lexicon.extract_color("arabaları göster"), ColorValue::Default);
    assert_eq!(lexicon.extract_color("kedileri bul"), ColorValue::Default);
    assert!(lexicon.extract_color("").is_default());
  }

  #[test]
  fn lexicon_order_decides_between_two_colors() {
    let lexicon = ColorLexicon::default();
    // mavi 在 beyaz 之前
    assert_eq!(
      lexicon.extract_color("beyaz ve mavi arabalar"),
      ColorValue::Rgb(BLUE)
    );
  }

  #[test]
  fn strip_removes_only_first_occurrence() {
    let lexicon = ColorLexicon::default();
    assert_eq!(
      lexicon.strip_color_term("Mavi arabaları göster", "mavi"),
      "arabaları göster"
    );
    assert_eq!(
      lexicon.strip_color_term("red red cars", "red"),
      "red cars"
    );
  }

  #[test]
  fn strip_all_spellings_of_color() {
    let lexicon = ColorLexicon::default();
    let stripped = lexicon.strip_color_terms("kırmızı ve kirmizi arabalar", ColorValue::Rgb(RED));
    assert_eq!(stripped, "ve arabalar");
    for entry in lexicon.entries().iter().filter(|e| e.color == ColorValue::Rgb(RED)) {
      assert!(!stripped.contains(entry.term));
    }
  }

  #[test]
  fn stripped_class_term_never_contains_matched_term() {
    let lexicon = ColorLexicon::default();
    for query in [
      "mavi arabaları göster",
      "show black dogs",
      "pembe pembe çiçekler",
      "GRİ kediler",
    ] {
      let entry = lexicon.extract(query).unwrap();
      let class_term = lexicon.strip_color_terms(query, entry.color);
      assert!(!class_term.contains(entry.term), "{query} -> {class_term}");
    }
  }

  #[test]
  fn render_color_falls_back_to_green() {
    assert_eq!(ColorValue::Default.render_rgb(), Rgb(DEFAULT_RENDER_COLOR));
    assert_eq!(ColorValue::Rgb(BLUE).render_rgb(), Rgb(BLUE));
    assert_eq!(
      ColorLexicon::default().name_of(ColorValue::Rgb(RED)),
      Some("kırmızı")
    );
  }
}
