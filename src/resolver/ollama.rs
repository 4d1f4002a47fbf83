// 该文件是 Gözcü （瞭望者） 项目的一部分。
// src/resolver/ollama.rs - Ollama 文本分类器
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

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  resolver::{ClassifierError, TextClassifier},
  utils::{query_map, query_param},
};

pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.1:latest";
const DEFAULT_OLLAMA_HOST: &str = "127.0.0.1";
const DEFAULT_OLLAMA_PORT: u16 = 11434;
const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Serialize)]
struct ChatMessage<'a> {
  role: &'a str,
  content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
  model: &'a str,
  messages: [ChatMessage<'a>; 1],
  stream: bool,
}

#[derive(Deserialize)]
struct ChatReplyMessage {
  content: String,
}

#[derive(Deserialize)]
struct ChatReply {
  message: ChatReplyMessage,
}

/// 通过 Ollama `/api/chat` 接口完成分类
///
/// URL 形如 `ollama://127.0.0.1:11434/llama3.1:latest?timeout=60`，
/// 路径为模型名，省略时使用 [`DEFAULT_OLLAMA_MODEL`]。
pub struct OllamaClassifier {
  endpoint: String,
  model: String,
  agent: ureq::Agent,
}

impl OllamaClassifier {
  pub fn new(host: &str, port: u16, model: &str, timeout: Duration) -> Self {
    let agent = ureq::AgentBuilder::new().timeout(timeout).build();
    Self {
      endpoint: format!("http://{}:{}/api/chat", host, port),
      model: model.to_string(),
      agent,
    }
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  pub fn model(&self) -> &str {
    &self.model
  }
}

impl FromUrlWithScheme for OllamaClassifier {
  const SCHEME: &'static str = "ollama";
}

impl FromUrl for OllamaClassifier {
  type Error = ClassifierError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ClassifierError::SchemeMismatch(url.scheme().to_string()));
    }

    let query = query_map(url);
    let timeout = query_param::<u64>(&query, "timeout").unwrap_or(DEFAULT_TIMEOUT_SECS);
    let host = url
      .host_str()
      .filter(|host| !host.is_empty())
      .unwrap_or(DEFAULT_OLLAMA_HOST);
    let port = url.port().unwrap_or(DEFAULT_OLLAMA_PORT);
    let model = crate::utils::url_path(url);
    let model = model.trim_start_matches('/');
    let model = if model.is_empty() {
      DEFAULT_OLLAMA_MODEL
    } else {
      model
    };

    Ok(Self::new(host, port, model, Duration::from_secs(timeout)))
  }
}

impl TextClassifier for OllamaClassifier {
  type Error = ClassifierError;

  fn complete(&self, prompt: &str) -> Result<String, Self::Error> {
    let request = ChatRequest {
      model: &self.model,
      messages: [ChatMessage {
        role: "user",
        content: prompt,
      }],
      stream: false,
    };

    debug!("请求 Ollama: {} (模型 {})", self.endpoint, self.model);
    let response = self
      .agent
      .post(&self.endpoint)
      .send_json(&request)
      .map_err(|e| match e {
        ureq::Error::Status(code, _) => {
          ClassifierError::Http(format!("{} 返回状态码 {}", self.endpoint, code))
        }
        ureq::Error::Transport(transport) => {
          let message = transport.to_string();
          if message.to_lowercase().contains("timed out") {
            ClassifierError::Timeout(format!("{}: {}", self.endpoint, message))
          } else {
            ClassifierError::Http(format!("{}: {}", self.endpoint, message))
          }
        }
      })?;

    let reply: ChatReply = response
      .into_json()
      .map_err(|e| ClassifierError::MalformedReply(e.to_string()))?;
    Ok(reply.message.content)
  }
}
