use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, error};

/// REST 接口的错误响应体（PostgREST / 鉴权网关）
#[derive(Debug, Default, Deserialize)]
pub struct RestErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, alias = "msg", alias = "error_description")]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

impl RestErrorBody {
    fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(code) = &self.code {
            parts.push(format!("code={}", code));
        }
        if let Some(message) = &self.message {
            parts.push(message.clone());
        }
        if let Some(details) = &self.details {
            parts.push(format!("详情: {}", details));
        }
        if let Some(hint) = &self.hint {
            parts.push(format!("提示: {}", hint));
        }
        parts.join(", ")
    }
}

/// 创建带鉴权头的 HTTP 客户端（apikey + Bearer token 通过 default_headers 自动添加）
pub fn build_authed_client(api_key: &str, access_token: &str) -> Result<reqwest::Client> {
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};

    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("apikey"),
        HeaderValue::from_str(api_key).context("无效的 apikey")?,
    );
    let bearer = if access_token.is_empty() {
        api_key
    } else {
        access_token
    };
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", bearer)).context("无效的 access token")?,
    );

    reqwest::ClientBuilder::new()
        .default_headers(headers)
        .build()
        .context("创建 HTTP 客户端失败")
}

/// 通用 HTTP 响应处理：检查状态码并反序列化响应体
///
/// 非 2xx 时尝试解析 REST 错误体，失败则带上原始响应文本。
pub async fn handle_rest_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> Result<T> {
    let status = response.status();
    let body_bytes = response.bytes().await.context("读取响应 body 失败")?;
    let body_str = String::from_utf8_lossy(&body_bytes);
    debug!("[HTTP] {}响应 Body: {}", operation_name, body_str);

    if !status.is_success() {
        let detail = serde_json::from_slice::<RestErrorBody>(&body_bytes)
            .map(|body| body.summary())
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| body_str.to_string());
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, detail
        );
        return Err(anyhow::anyhow!("HTTP 错误 {}: {}", status, detail));
    }
    debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);

    serde_json::from_slice::<T>(&body_bytes).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}\n原始响应: {}",
            operation_name, e, body_str
        );
        anyhow::anyhow!("反序列化响应失败: {:?}", e)
    })
}

/// 只检查状态码，忽略响应体（PATCH 等不需要返回值的请求）
pub async fn ensure_rest_success(response: reqwest::Response, operation_name: &str) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);
        return Ok(());
    }
    let text = response.text().await.unwrap_or_default();
    error!(
        "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
        operation_name, status, text
    );
    Err(anyhow::anyhow!("HTTP 错误 {}: {}", status, text))
}
