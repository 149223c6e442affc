//! Cookie-backed sessions stored in `auth_sessions`

use chrono::{DateTime, Utc};
use qmanager_common::{Filter, Principal, Result, Store, Value, TABLE_SESSIONS, TABLE_USERS};
use tracing::debug;

fn now_epoch_secs() -> i64 {
    Utc::now().timestamp()
}

/// Session rows over a [`Store`]
pub struct Sessions<'a> {
    store: &'a dyn Store,
    ttl_secs: i64,
}

impl<'a> Sessions<'a> {
    pub fn new(store: &'a dyn Store, ttl_secs: i64) -> Self {
        Self { store, ttl_secs }
    }

    /// Open a session for `user_id` and return its token
    pub fn create(&self, user_id: i64) -> Result<String> {
        let token = hex::encode(rand::random::<[u8; 32]>());
        let now = now_epoch_secs();
        self.store.insert(
            TABLE_SESSIONS,
            &vec![
                ("token", Value::from(&token)),
                ("user_id", Value::from(user_id)),
                ("created_at", Value::from(now)),
                ("expires_at", Value::from(now + self.ttl_secs)),
            ],
        )?;
        debug!(user_id, "Session created");
        Ok(token)
    }

    /// Principal for a live session.
    ///
    /// Expired sessions are removed; sessions of inactive or deleted users
    /// resolve to `None`.
    pub fn resolve(&self, token: &str) -> Result<Option<Principal>> {
        if token.is_empty() {
            return Ok(None);
        }
        let Some(session) = self
            .store
            .find(TABLE_SESSIONS, &Filter::new().eq("token", token))?
        else {
            return Ok(None);
        };

        if session.int("expires_at").unwrap_or_default() <= now_epoch_secs() {
            self.destroy(token)?;
            debug!("Expired session removed");
            return Ok(None);
        }

        let user_id = session.int("user_id").unwrap_or_default();
        let user = self.store.find(
            TABLE_USERS,
            &Filter::new().eq("id", user_id).eq("is_active", true),
        )?;
        Ok(user.map(|row| Principal {
            id: user_id,
            username: row.text("username"),
            role: row.text("role"),
            login_at: session
                .int("created_at")
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                .unwrap_or_else(Utc::now),
        }))
    }

    pub fn destroy(&self, token: &str) -> Result<()> {
        if !token.is_empty() {
            self.store
                .delete(TABLE_SESSIONS, &Filter::new().eq("token", token))?;
        }
        Ok(())
    }

    /// Drop every expired session, returns the number removed
    pub fn purge_expired(&self) -> Result<usize> {
        self.store.delete(
            TABLE_SESSIONS,
            &Filter::new().lt("expires_at", now_epoch_secs()),
        )
    }
}

/// `Set-Cookie` value for a new session
pub fn session_cookie(name: &str, token: &str, ttl_secs: i64) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        name, token, ttl_secs
    )
}

/// `Set-Cookie` value that clears the session cookie
pub fn clear_cookie(name: &str) -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", name)
}

/// Extract cookie `name` from a `Cookie` header value
pub fn cookie_value<'h>(header: &'h str, name: &str) -> Option<&'h str> {
    header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then_some(v)
    })
}
