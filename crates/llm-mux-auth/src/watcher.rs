//! Watcher contract.
//!
//! The bootstrap/watcher layer (disk or remote store) emits these updates;
//! the manager applies them. The watcher owns auth lifecycle, the manager
//! owns auth state.

use crate::auth::Auth;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthUpdateAction {
    Add,
    Modify,
    Delete,
}

#[derive(Debug, Clone)]
pub struct AuthUpdate {
    pub action: AuthUpdateAction,
    pub id: String,
    /// Present for Add/Modify, absent for Delete.
    pub auth: Option<Auth>,
}

impl AuthUpdate {
    pub fn add(auth: Auth) -> Self {
        Self {
            action: AuthUpdateAction::Add,
            id: auth.id.clone(),
            auth: Some(auth),
        }
    }

    pub fn modify(auth: Auth) -> Self {
        Self {
            action: AuthUpdateAction::Modify,
            id: auth.id.clone(),
            auth: Some(auth),
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            action: AuthUpdateAction::Delete,
            id: id.into(),
            auth: None,
        }
    }
}
