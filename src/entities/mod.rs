//! Entity module - Contains all SeaORM entity definitions for the marketplace store.
//! Each entity maps one document collection of the backing store to a table.
//! Each entity has a Model struct for data and an Entity struct for operations.

pub mod conversation;
pub mod message;
pub mod notification;
pub mod points_transaction;
pub mod review;
pub mod user;
pub mod voucher;
pub mod voucher_redemption;

// Re-export specific types to avoid conflicts
pub use conversation::{
    Column as ConversationColumn, Entity as Conversation, Model as ConversationModel,
};
pub use message::{Column as MessageColumn, Entity as Message, Model as MessageModel};
pub use notification::{
    Column as NotificationColumn, Entity as Notification, Model as NotificationModel,
};
pub use points_transaction::{
    Column as PointsTransactionColumn, Entity as PointsTransaction,
    Model as PointsTransactionModel,
};
pub use review::{Column as ReviewColumn, Entity as Review, Model as ReviewModel};
pub use user::{Column as UserColumn, Entity as User, Model as UserModel};
pub use voucher::{Column as VoucherColumn, Entity as Voucher, Model as VoucherModel};
pub use voucher_redemption::{
    Column as VoucherRedemptionColumn, Entity as VoucherRedemption,
    Model as VoucherRedemptionModel,
};
