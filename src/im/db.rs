//! SQLite 数据库工具：统一创建连接池并执行 sqlx 迁移
//!
//! 约定：本 crate 根目录下存在 `migrations/` 目录，存放所有迁移 SQL 文件。
//! 通过 `sqlx::migrate!()` 自动管理 schema 升级。

use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};

/// 是否为内存数据库（每条连接各自独立，只能使用单连接）
fn is_memory_url(db_url: &str) -> bool {
    db_url.contains(":memory:") || db_url.contains("mode=memory")
}

/// 创建 SQLite 连接池并执行所有未执行的迁移
pub async fn create_sqlite_pool_with_migration(db_url: &str) -> Result<Pool<Sqlite>> {
    let options = if is_memory_url(db_url) {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };
    let pool = options
        .connect(db_url)
        .await
        .with_context(|| format!("连接SQLite数据库失败: {}", db_url))?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .context("执行数据库迁移失败")?;

    Ok(pool)
}
