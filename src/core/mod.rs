//! Core business logic, independent of any UI framework.
//!
//! Write paths take the database and the [`ChangeFeed`](crate::realtime::ChangeFeed)
//! and publish the topics they touched after committing.

/// Direct messages and unread counters
pub mod conversation;
/// Moderation and system notifications
pub mod notification;
/// Points ledger, trade rewards and bonuses
pub mod points;
/// User ratings
pub mod review;
/// Signed-in principal and dual-session detection
pub mod session;
/// Pending/confirmed staging for optimistic writes
pub mod staged;
/// Registration, profile and account management
pub mod user;
/// Voucher catalog and redemptions
pub mod voucher;
