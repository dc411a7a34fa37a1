use crate::database::Database;
use thiserror::Error;

mod entities;

pub use entities::{Email, Id, User};

#[derive(Debug, Error)]
pub enum Error {
    #[error("user being created already exists")]
    AlreadyExists,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Registers a user. Password hashing is the caller's concern; the core only
/// stores the resulting digest.
pub async fn create(db: &Database, email: Email, hashed_password: Vec<u8>) -> Result<User, Error> {
    queries::insert(db, email, hashed_password).await
}

pub async fn get(db: &Database, id: Id) -> Result<Option<User>, sqlx::Error> {
    queries::get(db, id).await
}

mod queries {
    use super::{Email, Error, Id, User};
    use crate::btc;
    use crate::database::Database;
    use chrono::{DateTime, Utc};
    use const_format::formatcp;

    const COLUMNS: &str = "id, email, balance, created, updated, deleted";

    pub(super) async fn insert(
        db: &Database,
        email: Email,
        hashed_password: Vec<u8>,
    ) -> Result<User, Error> {
        let result = sqlx::query_as::<_, UserRow>(formatcp!(
            "INSERT INTO users (email, hashed_password) VALUES ($1, $2) RETURNING {}",
            COLUMNS
        ))
        .bind(email.0)
        .bind(hashed_password)
        .fetch_one(db)
        .await;
        match result {
            Ok(row) => Ok(row.into_entity()),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("23505") => {
                Err(Error::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(super) async fn get(db: &Database, id: Id) -> Result<Option<User>, sqlx::Error> {
        Ok(
            sqlx::query_as::<_, UserRow>(formatcp!("SELECT {} FROM users WHERE id = $1", COLUMNS))
                .bind(id.0)
                .fetch_optional(db)
                .await?
                .map(|row| row.into_entity()),
        )
    }

    #[derive(sqlx::FromRow, Debug)]
    struct UserRow {
        id: i32,
        email: String,
        balance: i64,
        created: DateTime<Utc>,
        updated: DateTime<Utc>,
        deleted: Option<DateTime<Utc>>,
    }

    impl UserRow {
        fn into_entity(self) -> User {
            User {
                id: Id(self.id),
                email: Email(self.email),
                balance: btc::Sats(self.balance),
                created: self.created,
                updated: self.updated,
                deleted: self.deleted,
            }
        }
    }
}
