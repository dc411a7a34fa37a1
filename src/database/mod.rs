use sqlx::postgres::PgPoolOptions;
use url::Url;

pub use migrations::run_migrations;

mod migrations;

pub type Database = sqlx::Pool<sqlx::Postgres>;
pub(crate) type Transaction = sqlx::Transaction<'static, sqlx::Postgres>;

pub async fn connect(url: &Url) -> Result<Database, sqlx::Error> {
    PgPoolOptions::new().connect(url.as_str()).await
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CountRow {
    pub count: i64,
}
