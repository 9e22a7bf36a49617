//! Database configuration module for the marketplace store.
//!
//! This module handles the `SQLite` connection and table creation using `SeaORM`.
//! Tables are generated from the entity definitions with
//! `Schema::create_table_from_entity`, so the store layout always matches the
//! Rust models. Creation is idempotent (`IF NOT EXISTS`) so the bootstrap binary
//! can run against an existing database file.

use crate::entities::{
    Conversation, Message, Notification, PointsTransaction, Review, User, Voucher,
    VoucherRedemption,
};
use crate::errors::Result;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, EntityTrait, Schema};
use tracing::{debug, info};

const DEFAULT_DATABASE_URL: &str = "sqlite://data/trueque_market.sqlite?mode=rwc";

/// Gets the database URL from environment variable or returns default `SQLite` path.
pub fn get_database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string())
}

/// Establishes a connection to the database named by `DATABASE_URL`.
///
/// Falls back to a default local `SQLite` file if no environment variable is set.
pub async fn create_connection() -> Result<DatabaseConnection> {
    let database_url = get_database_url();
    debug!("Connecting to database at {}", database_url);
    if let Some(parent) = sqlite_file_dir(&database_url) {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = ConnectOptions::new(database_url);
    options.sqlx_logging(false);
    Database::connect(options).await.map_err(Into::into)
}

/// Directory that must exist for a file-backed `SQLite` URL.
fn sqlite_file_dir(database_url: &str) -> Option<&std::path::Path> {
    let path = database_url.strip_prefix("sqlite://")?;
    let path = path.split('?').next()?;
    std::path::Path::new(path)
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
}

async fn create_table<E>(db: &DatabaseConnection, schema: &Schema, entity: E) -> Result<()>
where
    E: EntityTrait,
{
    let builder = db.get_database_backend();
    let mut statement = schema.create_table_from_entity(entity);
    statement.if_not_exists();
    db.execute(builder.build(&statement)).await?;
    Ok(())
}

/// Creates every collection of the store using `SeaORM`'s schema generation.
///
/// Parents are created before the tables that reference them.
pub async fn create_tables(db: &DatabaseConnection) -> Result<()> {
    let schema = Schema::new(db.get_database_backend());

    create_table(db, &schema, User).await?;
    create_table(db, &schema, Voucher).await?;
    create_table(db, &schema, PointsTransaction).await?;
    create_table(db, &schema, VoucherRedemption).await?;
    create_table(db, &schema, Conversation).await?;
    create_table(db, &schema, Message).await?;
    create_table(db, &schema, Notification).await?;
    create_table(db, &schema, Review).await?;

    info!("Database tables ensured.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{
        conversation::Model as ConversationModel, message::Model as MessageModel,
        points_transaction::Model as PointsTransactionModel, user::Model as UserModel,
        voucher_redemption::Model as RedemptionModel,
    };
    use crate::test_utils::setup_test_db;
    use sea_orm::QuerySelect;

    #[tokio::test]
    async fn test_create_tables() -> Result<()> {
        let db = setup_test_db().await?;

        // Test that tables exist by querying them
        let _: Vec<UserModel> = User::find().limit(1).all(&db).await?;
        let _: Vec<PointsTransactionModel> = PointsTransaction::find().limit(1).all(&db).await?;
        let _: Vec<RedemptionModel> = VoucherRedemption::find().limit(1).all(&db).await?;
        let _: Vec<ConversationModel> = Conversation::find().limit(1).all(&db).await?;
        let _: Vec<MessageModel> = Message::find().limit(1).all(&db).await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_create_tables_is_idempotent() -> Result<()> {
        let db = setup_test_db().await?;
        create_tables(&db).await?;
        let _: Vec<UserModel> = User::find().limit(1).all(&db).await?;
        Ok(())
    }

    #[test]
    fn test_sqlite_file_dir() {
        assert_eq!(
            sqlite_file_dir("sqlite://data/trueque_market.sqlite?mode=rwc"),
            Some(std::path::Path::new("data"))
        );
        assert_eq!(sqlite_file_dir("sqlite://market.sqlite"), None);
        assert_eq!(sqlite_file_dir("sqlite::memory:"), None);
    }
}
