//! Shared test utilities for the marketplace core.
//!
//! This module provides common helper functions for setting up test databases
//! and creating test entities with sensible defaults.

use crate::{
    config::catalog::VoucherConfig,
    core::{user, voucher},
    entities::{self, voucher::VoucherKind},
    errors::Result,
    realtime::ChangeFeed,
};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, ConnectOptions, DatabaseConnection, Set};
use tracing_subscriber::EnvFilter;

/// Routes tracing output to the test harness.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Creates an in-memory `SQLite` database with all tables initialized.
///
/// The pool is pinned to a single connection: every pooled connection to
/// `sqlite::memory:` would otherwise see its own empty database.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let db = sea_orm::Database::connect(options).await?;
    crate::config::database::create_tables(&db).await?;
    Ok(db)
}

/// Sets up a database together with a fresh change feed.
pub async fn setup_store() -> Result<(DatabaseConnection, ChangeFeed)> {
    init_test_tracing();
    Ok((setup_test_db().await?, ChangeFeed::new()))
}

/// Registers a test user with sensible defaults.
///
/// # Defaults
/// * `name`: `"User {id}"`
/// * `email`: `"{id}@example.com"`
/// * `city`: `"Santiago"`
pub async fn create_test_user(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    id: &str,
) -> Result<entities::user::Model> {
    user::register(
        db,
        feed,
        id,
        &user::Registration {
            name: format!("User {id}"),
            email: format!("{id}@example.com"),
            phone: "+56 9 1234 5678".to_string(),
            city: "Santiago".to_string(),
        },
        Utc::now(),
    )
    .await
}

/// Registers a test user and promotes it to admin.
pub async fn create_test_admin(
    db: &DatabaseConnection,
    feed: &ChangeFeed,
    id: &str,
) -> Result<entities::user::Model> {
    let admin = create_test_user(db, feed, id).await?;
    let mut active: entities::user::ActiveModel = admin.into();
    active.role = Set(entities::user::Role::Admin);
    active.update(db).await.map_err(Into::into)
}

/// Writes a catalog entry with custom price, stock and duration.
pub async fn create_test_voucher(
    db: &DatabaseConnection,
    id: &str,
    points_required: i64,
    stock: Option<i32>,
    duration_days: Option<i32>,
) -> Result<entities::voucher::Model> {
    let entry = VoucherConfig {
        id: id.to_string(),
        name: format!("Voucher {id}"),
        description: "Test voucher".to_string(),
        points_required,
        kind: VoucherKind::Benefit,
        active: true,
        stock,
        duration_days,
    };
    voucher::seed_catalog(db, std::slice::from_ref(&entry)).await?;
    voucher::find(db, id)
        .await?
        .ok_or_else(|| crate::errors::Error::not_found("voucher", id))
}
