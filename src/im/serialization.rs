use serde::Deserialize;
use uuid::Uuid;

/// 占位 ID 前缀（乐观插入的本地消息在服务端确认前使用）
pub const PLACEHOLDER_PREFIX: &str = "temp-";

/// 反序列化时把 null 视为默认值
///
/// 托管数据库的 REST 接口会把空列返回为 `null`（例如 `is_read`、`content`），
/// 这里统一回落到类型默认值，避免整行解析失败。
pub fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    let opt: Option<T> = Deserialize::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// 生成消息占位 ID
pub fn generate_placeholder_id() -> String {
    format!("{}{}", PLACEHOLDER_PREFIX, Uuid::new_v4())
}

/// 判断是否为本地占位 ID
pub fn is_placeholder_id(id: &str) -> bool {
    id.starts_with(PLACEHOLDER_PREFIX)
}

/// 生成服务端消息 ID（本地 SQLite 存储使用）
pub fn generate_server_id() -> String {
    Uuid::new_v4().to_string()
}
