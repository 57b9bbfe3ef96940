//! 用户资料本地存储（SQLite）

use crate::im::profile::{Profile, ProfileLookup};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Pool, Row, Sqlite};

pub struct ProfileStore {
    pool: Pool<Sqlite>,
}

impl ProfileStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (id, nickname, avatar_url)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                nickname = excluded.nickname,
                avatar_url = excluded.avatar_url;
            "#,
        )
        .bind(&profile.id)
        .bind(&profile.nickname)
        .bind(&profile.avatar_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProfileLookup for ProfileStore {
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let row = sqlx::query("SELECT id, nickname, avatar_url FROM profiles WHERE id = ? LIMIT 1;")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Profile {
            id: r.get("id"),
            nickname: r.get::<Option<String>, _>("nickname").unwrap_or_default(),
            avatar_url: r.get("avatar_url"),
        }))
    }
}
