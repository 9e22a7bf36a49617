//! Session store - The signed-in principal of one client.
//!
//! Credentials are checked by the external authentication provider; a
//! [`Session`] starts from the user id it hands over. Signing in writes a fresh
//! token to the user record and starts a listener on that record. When the
//! stored token stops matching ours another device has signed in, and the
//! session moves to [`SessionState::DualDetected`] and emits one
//! [`DualSessionEvent`]. The only way out of that state is [`Session::sign_out`].

use crate::{
    core::user::{self, UserRecordQuery},
    entities::user::Model as UserModel,
    errors::{Error, Result},
    realtime::{ChangeFeed, Subscription, SubscriptionManager},
};
use sea_orm::DatabaseConnection;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Lifecycle of a client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Nobody signed in yet
    NoSession,
    /// Sign-in in progress
    Authenticating,
    /// Signed in and holding the current token
    Active {
        /// Signed-in user
        user_id: String,
        /// Token this client wrote
        token: String,
    },
    /// Another device took over the account; must sign out
    DualDetected {
        /// Signed-in user
        user_id: String,
        /// Token this client wrote
        token: String,
    },
    /// Signed out
    LoggedOut,
}

impl SessionState {
    /// User and token of an active or conflicted session.
    pub fn principal(&self) -> Option<(&str, &str)> {
        match self {
            Self::Active { user_id, token } | Self::DualDetected { user_id, token } => {
                Some((user_id, token))
            }
            _ => None,
        }
    }
}

/// Emitted once when another device signs in to the same account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualSessionEvent {
    /// Account in conflict
    pub user_id: String,
    /// Token held by this client
    pub local_token: String,
    /// Token now stored on the account
    pub remote_token: Option<String>,
}

struct Shared {
    database: DatabaseConnection,
    state: watch::Sender<SessionState>,
    current_user: watch::Sender<Option<UserModel>>,
    dual_events: broadcast::Sender<DualSessionEvent>,
}

/// The acting principal of one client plus its dual-session listener.
pub struct Session {
    shared: Arc<Shared>,
    feed: ChangeFeed,
    records: SubscriptionManager<UserRecordQuery>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Creates a signed-out session.
    pub fn new(database: DatabaseConnection, feed: ChangeFeed, retry_delay: Duration) -> Self {
        let (state, _) = watch::channel(SessionState::NoSession);
        let (current_user, _) = watch::channel(None);
        let (dual_events, _) = broadcast::channel(16);
        let records = SubscriptionManager::new(database.clone(), feed.clone(), retry_delay);
        Self {
            shared: Arc::new(Shared {
                database,
                state,
                current_user,
                dual_events,
            }),
            feed,
            records,
            listener: Mutex::new(None),
        }
    }

    /// Current state.
    pub fn current_state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Snapshot of the signed-in user.
    pub fn current_user(&self) -> Option<UserModel> {
        self.shared.current_user.borrow().clone()
    }

    /// Live signed-in user, `None` while signed out.
    pub fn current_user_stream(&self) -> watch::Receiver<Option<UserModel>> {
        self.shared.current_user.subscribe()
    }

    /// Dual-session notifications.
    pub fn dual_session_events(&self) -> broadcast::Receiver<DualSessionEvent> {
        self.shared.dual_events.subscribe()
    }

    /// Id of the signed-in user, if any.
    pub fn user_id(&self) -> Option<String> {
        self.shared
            .state
            .borrow()
            .principal()
            .map(|(user_id, _)| user_id.to_string())
    }

    /// Whether a session is active and not in conflict.
    pub fn is_authenticated(&self) -> bool {
        matches!(*self.shared.state.borrow(), SessionState::Active { .. })
    }

    /// Whether the signed-in user is an admin.
    pub fn is_admin(&self) -> bool {
        self.is_authenticated() && self.current_user().is_some_and(|u| u.is_admin())
    }

    /// Whether the signed-in user is an admin or owns the resource.
    pub fn is_admin_or_owner(&self, owner_id: &str) -> bool {
        self.is_authenticated()
            && self
                .current_user()
                .is_some_and(|u| u.is_admin() || u.id == owner_id)
    }

    /// The signed-in user, or `NoActiveSession`.
    pub fn require_user(&self) -> Result<UserModel> {
        if !self.is_authenticated() {
            return Err(Error::NoActiveSession);
        }
        self.current_user().ok_or(Error::NoActiveSession)
    }

    /// Starts a session for `user_id`, already authenticated by the provider.
    ///
    /// An existing session on this client is signed out first.
    #[instrument(skip(self))]
    pub async fn sign_in(&self, user_id: &str) -> Result<UserModel> {
        if self.current_state().principal().is_some() {
            self.sign_out().await?;
        }
        self.shared.state.send_replace(SessionState::Authenticating);

        let token = Uuid::new_v4().to_string();
        let record = match self.write_token(user_id, &token).await {
            Ok(record) => record,
            Err(e) => {
                self.shared.state.send_replace(SessionState::NoSession);
                return Err(e);
            }
        };

        self.shared.current_user.send_replace(Some(record.clone()));
        self.shared.state.send_replace(SessionState::Active {
            user_id: user_id.to_string(),
            token: token.clone(),
        });

        let subscription = self.records.subscribe(user_id);
        let task = tokio::spawn(watch_record(
            Arc::clone(&self.shared),
            subscription,
            user_id.to_string(),
            token,
        ));
        if let Some(previous) = self.lock_listener().replace(task) {
            previous.abort();
        }

        info!(user_id, "Signed in");
        Ok(record)
    }

    /// Ends the session and stops the listener.
    ///
    /// The server-side token is cleared only while it is still ours, so a
    /// device that lost a dual-session race leaves the winner signed in.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) -> Result<()> {
        let state = self.current_state();
        let Some((user_id, token)) = state.principal() else {
            debug!("sign out without a session");
            return Ok(());
        };

        if let Some(task) = self.lock_listener().take() {
            task.abort();
        }
        self.records.close(user_id);
        self.shared.current_user.send_replace(None);
        self.shared.state.send_replace(SessionState::LoggedOut);

        let cleared =
            user::clear_session_token(&self.shared.database, &self.feed, user_id, token).await?;
        info!(user_id, cleared, "Signed out");
        Ok(())
    }

    async fn write_token(&self, user_id: &str, token: &str) -> Result<UserModel> {
        user::set_session_token(&self.shared.database, &self.feed, user_id, token).await?;
        user::require_user(&self.shared.database, user_id).await
    }

    fn lock_listener(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.lock_listener().take() {
            task.abort();
        }
    }
}

async fn watch_record(
    shared: Arc<Shared>,
    mut subscription: Subscription<Option<UserModel>>,
    user_id: String,
    token: String,
) {
    let mut snapshot = subscription.first().await;
    loop {
        let record = match snapshot {
            Ok(record) => record,
            Err(e @ Error::SubscriptionFailed { .. }) => {
                warn!(user_id = %user_id, "session record unavailable: {}", e);
                snapshot = subscription.next().await;
                continue;
            }
            Err(e) => {
                debug!(user_id = %user_id, "session listener ended: {}", e);
                return;
            }
        };

        let diverged = record
            .as_ref()
            .is_some_and(|r| r.session_token.as_deref() != Some(token.as_str()));
        shared.current_user.send_replace(record);
        if diverged {
            confirm_dual_session(&shared, &user_id, &token).await;
        }

        snapshot = subscription.next().await;
    }
}

/// Re-reads the record before declaring a conflict; a replayed snapshot may predate our sign-in.
async fn confirm_dual_session(shared: &Shared, user_id: &str, token: &str) {
    let remote_token = match user::get_user(&shared.database, user_id).await {
        Ok(Some(record)) => record.session_token,
        Ok(None) => return,
        Err(e) => {
            warn!(user_id, "could not confirm session token: {}", e);
            return;
        }
    };
    if remote_token.as_deref() == Some(token) {
        return;
    }

    let transitioned = shared.state.send_if_modified(|state| match state {
        SessionState::Active {
            user_id: active_user,
            token: active_token,
        } if active_user == user_id && active_token == token => {
            *state = SessionState::DualDetected {
                user_id: active_user.clone(),
                token: active_token.clone(),
            };
            true
        }
        _ => false,
    });
    if transitioned {
        warn!(user_id, "Account signed in on another device");
        let _ = shared.dual_events.send(DualSessionEvent {
            user_id: user_id.to_string(),
            local_token: token.to_string(),
            remote_token,
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::test_utils::*;
    use tokio::time::timeout;

    fn session(db: &DatabaseConnection, feed: &ChangeFeed) -> Session {
        Session::new(db.clone(), feed.clone(), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_sign_in_and_out() -> Result<()> {
        let (db, feed) = setup_store().await?;
        create_test_user(&db, &feed, "ana").await?;
        let phone = session(&db, &feed);

        assert!(matches!(phone.require_user(), Err(Error::NoActiveSession)));
        let user = phone.sign_in("ana").await?;
        assert!(phone.is_authenticated());
        assert!(phone.is_admin_or_owner("ana"));
        assert!(!phone.is_admin_or_owner("beto"));
        assert!(!phone.is_admin());

        let (_, token) = match phone.current_state() {
            SessionState::Active { user_id, token } => (user_id, token),
            other => panic!("unexpected state {other:?}"),
        };
        let stored = user::require_user(&db, "ana").await?;
        assert_eq!(stored.session_token.as_deref(), Some(token.as_str()));
        assert_eq!(phone.current_user().unwrap().id, user.id);

        phone.sign_out().await?;
        assert_eq!(phone.current_state(), SessionState::LoggedOut);
        assert!(phone.current_user().is_none());
        assert!(user::require_user(&db, "ana").await?.session_token.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_user_cannot_sign_in() -> Result<()> {
        let (db, feed) = setup_store().await?;
        let phone = session(&db, &feed);

        assert!(phone.sign_in("ghost").await.is_err());
        assert_eq!(phone.current_state(), SessionState::NoSession);
        Ok(())
    }

    #[tokio::test]
    async fn test_second_device_triggers_dual_session_once() -> Result<()> {
        let (db, feed) = setup_store().await?;
        create_test_user(&db, &feed, "ana").await?;
        let phone = session(&db, &feed);
        let laptop = session(&db, &feed);

        phone.sign_in("ana").await?;
        let mut events = phone.dual_session_events();
        let mut state = phone.state();

        laptop.sign_in("ana").await?;
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .map_err(|_| Error::validation("timed out"))?
            .unwrap();
        assert_eq!(event.user_id, "ana");
        assert_ne!(event.remote_token.as_deref(), Some(event.local_token.as_str()));
        state
            .wait_for(|s| matches!(s, SessionState::DualDetected { .. }))
            .await
            .unwrap();
        assert!(!phone.is_authenticated());

        // Further writes to the record do not repeat the event.
        user::add_badge(&db, "ana", "verified").await?;
        feed.publish(crate::realtime::Topic::User("ana".to_string()));
        let again = timeout(Duration::from_millis(100), events.recv()).await;
        assert!(again.is_err());

        // The losing device signs out without clearing the winner's token.
        phone.sign_out().await?;
        assert!(laptop.is_authenticated());
        assert!(user::require_user(&db, "ana").await?.session_token.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_current_user_follows_profile_edits() -> Result<()> {
        let (db, feed) = setup_store().await?;
        create_test_user(&db, &feed, "ana").await?;
        let phone = session(&db, &feed);
        phone.sign_in("ana").await?;

        let mut stream = phone.current_user_stream();
        crate::core::points::credit(&db, &feed, "ana", 75, "Gift", None, chrono::Utc::now()).await?;
        timeout(
            Duration::from_secs(2),
            stream.wait_for(|u| u.as_ref().is_some_and(|u| u.points_balance == 75)),
        )
        .await
        .map_err(|_| Error::validation("timed out"))?
        .unwrap();
        assert_eq!(phone.current_user().unwrap().points_balance, 75);
        assert_eq!(phone.current_state().principal().unwrap().0, "ana");
        Ok(())
    }

    #[tokio::test]
    async fn test_sign_in_again_restarts_listener() -> Result<()> {
        let (db, feed) = setup_store().await?;
        create_test_user(&db, &feed, "ana").await?;
        create_test_user(&db, &feed, "beto").await?;
        let phone = session(&db, &feed);
        let mut events = phone.dual_session_events();

        phone.sign_in("ana").await?;
        phone.sign_in("beto").await?;
        assert_eq!(phone.user_id().as_deref(), Some("beto"));
        assert!(user::require_user(&db, "ana").await?.session_token.is_none());

        phone.sign_in("beto").await?;
        let spurious = timeout(Duration::from_millis(100), events.recv()).await;
        assert!(spurious.is_err());
        assert!(phone.is_authenticated());
        Ok(())
    }
}
