// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/utils.rs - URL 解析辅助函数
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

use std::{collections::HashMap, str::FromStr};

use url::Url;

/// 解码后的 URL 路径，`image:///tmp/a%20b.jpg` 得到 `/tmp/a b.jpg`
pub fn url_path(url: &Url) -> String {
  urlencoding::decode(url.path())
    .map(|path| path.into_owned())
    .unwrap_or_else(|_| url.path().to_string())
}

pub fn query_map(url: &Url) -> HashMap<String, String> {
  url
    .query_pairs()
    .map(|(k, v)| (String::from(k), String::from(v)))
    .collect()
}

/// 读取查询参数，缺失或无法解析时返回 `None`
pub fn query_param<T: FromStr>(query: &HashMap<String, String>, key: &str) -> Option<T> {
  query.get(key).and_then(|v| v.parse::<T>().ok())
}

/// 把命令行里的路径或 URL 统一成 URL；没有 scheme 的输入按 `default_scheme` 处理
pub fn parse_location(location: &str, default_scheme: &str) -> Result<Url, url::ParseError> {
  match Url::parse(location) {
    Ok(url) if url.scheme().len() > 1 => Ok(url),
    _ => {
      let path = std::path::absolute(location)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| location.to_string());
      Url::parse(&format!(
        "{}://{}",
        default_scheme,
        urlencoding::encode(&path).replace("%2F", "/")
      ))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn path_is_percent_decoded() {
    let url = Url::parse("image:///tmp/k%C4%B1rm%C4%B1z%C4%B1%20araba.jpg").unwrap();
    assert_eq!(url_path(&url), "/tmp/kırmızı araba.jpg");
  }

  #[test]
  fn query_params_parse_or_default() {
    let url = Url::parse("folder:///frames?fps=12.5&bad=x").unwrap();
    let query = query_map(&url);
    assert_eq!(query_param::<f64>(&query, "fps"), Some(12.5));
    assert_eq!(query_param::<u32>(&query, "bad"), None);
    assert_eq!(query_param::<u32>(&query, "missing"), None);
  }

  #[test]
  fn bare_paths_get_default_scheme() {
    let url = parse_location("/data/in.png", "image").unwrap();
    assert_eq!(url.scheme(), "image");
    assert_eq!(url_path(&url), "/data/in.png");

    let url = parse_location("folder:///data/frames?fps=5", "image").unwrap();
    assert_eq!(url.scheme(), "folder");
  }
}
