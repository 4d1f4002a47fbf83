// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/resolver.rs - 自然语言类别解析
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

//! 把查询中的类别描述映射到模型词表。
//!
//! 语言模型的回复可能夹带说明文字、引号或多余的换行，
//! 这里的解析只接受逗号分隔的名称列表或与词表完全一致的单行，
//! 其余内容一律丢弃。

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{color::fold_case, model::Vocabulary};

#[cfg(feature = "ollama")]
mod ollama;
#[cfg(feature = "ollama")]
pub use self::ollama::{DEFAULT_OLLAMA_MODEL, OllamaClassifier};

#[derive(Error, Debug)]
pub enum ClassifierError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("请求超时: {0}")]
  Timeout(String),
  #[error("HTTP 请求失败: {0}")]
  Http(String),
  #[error("回复格式错误: {0}")]
  MalformedReply(String),
}

/// 文本补全服务
pub trait TextClassifier {
  type Error: std::error::Error + Send + Sync + 'static;

  fn complete(&self, prompt: &str) -> Result<String, Self::Error>;
}

impl<T: TextClassifier + ?Sized> TextClassifier for Box<T> {
  type Error = T::Error;

  fn complete(&self, prompt: &str) -> Result<String, Self::Error> {
    (**self).complete(prompt)
  }
}

const CLASSIFIER_ERROR_PREFIX: &str = "classifier error: ";

/// 解析出的类别集合
///
/// 分类器调用失败时只包含一条诊断字符串，它不会与任何词表条目相等。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedClasses {
  names: BTreeSet<String>,
  failed: bool,
}

impl ResolvedClasses {
  pub fn from_names<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    Self {
      names: names.into_iter().map(|name| fold_case(name.as_ref())).collect(),
      failed: false,
    }
  }

  pub fn failed(message: impl std::fmt::Display) -> Self {
    Self {
      names: BTreeSet::from([format!("{}{}", CLASSIFIER_ERROR_PREFIX, message)]),
      failed: true,
    }
  }

  pub fn is_failure(&self) -> bool {
    self.failed
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.names.iter().map(String::as_str)
  }

  /// 忽略大小写的成员判断
  pub fn contains(&self, name: &str) -> bool {
    !self.failed && self.names.contains(&fold_case(name))
  }

  pub fn into_names(self) -> BTreeSet<String> {
    self.names
  }
}

// 土耳其语 → 词表名称
const SYNONYMS: &[(&str, &str)] = &[
  ("insan, kişi, adam, kadın, çocuk, bebek", "person"),
  ("kedi, pisi", "cat"),
  ("köpek, it", "dog"),
  ("kuş", "bird"),
  ("at, beygir", "horse"),
  ("inek, sığır", "cow"),
  ("koyun, kuzu", "sheep"),
  ("fil", "elephant"),
  ("ayı", "bear"),
  ("zürafa", "giraffe"),
  (
    "hayvan, evcil hayvan",
    "cat, dog, bird, horse, cow, sheep, elephant, bear, zebra, giraffe",
  ),
  ("araba, otomobil", "car"),
  ("kamyon, tır", "truck"),
  ("otobüs", "bus"),
  ("motosiklet, motor", "motorcycle"),
  ("bisiklet", "bicycle"),
  ("uçak, tayyare", "airplane"),
  ("tren", "train"),
  ("tekne, gemi", "boat"),
  (
    "araç, taşıt, vasıta",
    "car, truck, bus, motorcycle, bicycle, airplane, train, boat",
  ),
  ("elma", "apple"),
  ("muz", "banana"),
  ("pasta, kek", "cake"),
  ("sandviç", "sandwich"),
  ("portakal", "orange"),
  ("brokoli", "broccoli"),
  ("havuç", "carrot"),
  ("sosisli", "hot dog"),
  ("sandalye", "chair"),
  ("koltuk, kanepe", "couch"),
  ("masa, yemek masası", "dining table"),
  ("televizyon, ekran", "tv"),
  ("dizüstü, bilgisayar", "laptop"),
  ("telefon, cep telefonu", "cell phone"),
  ("kitap", "book"),
  ("saat", "clock"),
  ("çanta", "handbag, backpack, suitcase"),
  ("şemsiye", "umbrella"),
  ("şişe", "bottle"),
  ("bardak, fincan", "cup"),
];

/// 构造分类提示词
pub fn build_prompt(class_term: &str, vocabulary: &Vocabulary) -> String {
  let mut prompt = String::new();
  prompt.push_str(&format!("Kullanıcı \"{}\" nesnesini arıyor.\n\n", class_term));
  prompt.push_str("Mevcut sınıflar: ");
  prompt.push_str(&vocabulary.iter().collect::<Vec<_>>().join(", "));
  prompt.push_str("\n\nBu sınıflardan hangileri aranan nesneyle eşleşiyor? ");
  prompt.push_str("Türkçe kelimeleri listedeki İngilizce sınıflarla eşleştir:\n");
  for (terms, classes) in SYNONYMS {
    prompt.push_str(&format!("- {} → {}\n", terms, classes));
  }
  prompt.push_str("\nSADECE listedeki eşleşen sınıf isimlerini virgülle ayırarak ver. ");
  prompt.push_str("Başka açıklama yapma.\nÖrnek: person, car, truck\n");
  prompt
}

const PROSE_MARKERS: &[&str] = &["additionally", "ayrıca", "note:", "not:"];
const QUOTES: &[char] = &['"', '\'', '“', '”', '‘', '’', '«', '`'];

fn is_prose(line: &str) -> bool {
  if line.starts_with(QUOTES) {
    return true;
  }
  let folded = fold_case(line);
  PROSE_MARKERS.iter().any(|marker| folded.starts_with(marker))
}

fn split_names<'a>(text: &'a str, separators: &'a [char]) -> impl Iterator<Item = String> + 'a {
  text
    .split(separators)
    .map(str::trim)
    .filter(|token| !token.is_empty())
    .map(fold_case)
}

/// 解析分类器回复
///
/// 对解析结果用 `, ` 重新拼接后再次解析，得到的集合不变。
pub fn parse_reply(reply: &str, vocabulary: &Vocabulary) -> BTreeSet<String> {
  let mut accepted = BTreeSet::new();
  for line in reply.lines().map(str::trim) {
    if line.is_empty() || is_prose(line) {
      continue;
    }
    if line.contains(',') {
      accepted.extend(split_names(line, &[',']));
    } else if vocabulary.find(line).is_some() {
      accepted.insert(fold_case(line));
    }
  }

  if accepted.is_empty() {
    accepted.extend(split_names(reply, &[',', '\n']));
  }
  accepted
}

/// 类别解析器
pub struct ClassResolver<C> {
  classifier: C,
}

impl<C: TextClassifier> ClassResolver<C> {
  pub fn new(classifier: C) -> Self {
    Self { classifier }
  }

  pub fn classifier(&self) -> &C {
    &self.classifier
  }

  pub fn resolve(&self, class_term: &str, vocabulary: &Vocabulary) -> ResolvedClasses {
    let prompt = build_prompt(class_term, vocabulary);
    debug!("分类提示词长度: {}", prompt.len());

    match self.classifier.complete(&prompt) {
      Ok(reply) => {
        info!("分类器回复: {}", reply.trim());
        let names = parse_reply(&reply, vocabulary);
        info!("解析出的类别: {:?}", names);
        ResolvedClasses {
          names,
          failed: false,
        }
      }
      Err(e) => {
        warn!("分类器调用失败，查询 \"{}\" 不会匹配任何类别: {}", class_term, e);
        ResolvedClasses::failed(e)
      }
    }
  }
}
