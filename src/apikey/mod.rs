use crate::database::Database;
use crate::hex::Hex;
use crate::user;

mod entities;

pub use entities::{hash_key, ApiKey, Id};

/// Issues a new API key for the user. Returns the stored row and, exactly
/// once, the cleartext key.
pub async fn create(db: &Database, user_id: user::Id) -> Result<(ApiKey, Hex), sqlx::Error> {
    let generated = entities::GeneratedKey::generate();
    let api_key = queries::insert(db, user_id, generated.key_hash).await?;
    Ok((api_key, generated.cleartext))
}

/// The most recently issued key's hash, which keys the callback HMAC.
pub async fn newest_key_hash(
    db: &Database,
    user_id: user::Id,
) -> Result<Option<Vec<u8>>, sqlx::Error> {
    queries::newest_key_hash(db, user_id).await
}

mod queries {
    use super::{ApiKey, Id};
    use crate::database::Database;
    use crate::user;
    use chrono::{DateTime, Utc};

    pub(super) async fn insert(
        db: &Database,
        user_id: user::Id,
        key_hash: Vec<u8>,
    ) -> Result<ApiKey, sqlx::Error> {
        Ok(sqlx::query_as::<_, ApiKeyRow>(
            "INSERT INTO api_keys (user_id, key_hash) VALUES ($1, $2) \
                RETURNING id, user_id, key_hash, created",
        )
        .bind(user_id.0)
        .bind(key_hash)
        .fetch_one(db)
        .await?
        .into_entity())
    }

    pub(super) async fn newest_key_hash(
        db: &Database,
        user_id: user::Id,
    ) -> Result<Option<Vec<u8>>, sqlx::Error> {
        Ok(sqlx::query_as::<_, KeyHashRow>(
            "SELECT key_hash FROM api_keys WHERE user_id = $1 ORDER BY created DESC, id DESC LIMIT 1",
        )
        .bind(user_id.0)
        .fetch_optional(db)
        .await?
        .map(|row| row.key_hash))
    }

    #[derive(sqlx::FromRow, Debug)]
    struct ApiKeyRow {
        id: i32,
        user_id: i32,
        key_hash: Vec<u8>,
        created: DateTime<Utc>,
    }

    impl ApiKeyRow {
        fn into_entity(self) -> ApiKey {
            ApiKey {
                id: Id(self.id),
                user_id: user::Id(self.user_id),
                key_hash: self.key_hash,
                created: self.created,
            }
        }
    }

    #[derive(sqlx::FromRow, Debug)]
    struct KeyHashRow {
        key_hash: Vec<u8>,
    }
}
