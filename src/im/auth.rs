use crate::im::types::handle_rest_response;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: i64,
    pub user: AuthUser,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

fn token_url(api_base_url: &str) -> String {
    format!(
        "{}/auth/v1/token?grant_type=password",
        api_base_url.trim_end_matches('/')
    )
}

/// 邮箱密码登录，返回 access token 和用户 ID
pub async fn login_with_password(
    api_base_url: &str,
    api_key: &str,
    email: &str,
    password: &str,
) -> Result<LoginResponse> {
    let url = token_url(api_base_url);
    info!("🔐 正在登录...");
    debug!("   URL: {}", url);
    debug!("   邮箱: {}", email);

    let request = LoginRequest {
        email: email.to_string(),
        password: password.to_string(),
    };
    let response = reqwest::Client::new()
        .post(&url)
        .header("apikey", api_key)
        .header("Content-Type", "application/json")
        .json(&request)
        .send()
        .await
        .context("登录请求失败")?;

    let login: LoginResponse = handle_rest_response(response, "登录").await?;
    info!("✅ 登录成功 userID={}", login.user.id);
    Ok(login)
}
