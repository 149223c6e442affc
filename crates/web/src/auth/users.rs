//! Console user accounts.
//!
//! Passwords are stored as bcrypt hashes. Every mutation writes an audit
//! line with an `action` field such as `create.success`.

use chrono::Utc;
use qmanager_common::{
    Error, Filter, Result, Role, Row, Store, Validator, Value, Values, TABLE_USERS,
};
use serde::Serialize;
use tracing::{info, warn};

const USERNAME_PATTERN: &str = r"^[a-zA-Z0-9_.-]{3,32}$";
const USERNAME_MESSAGE: &str =
    "Username must be 3-32 chars and contain only letters, numbers, dot, underscore, hyphen";
const PASSWORD_MIN: usize = 8;

/// Account data without the password hash
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub role: String,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
    pub last_login_at: Option<String>,
}

impl User {
    fn from_row(row: &Row) -> Self {
        Self {
            id: row.int("id").unwrap_or_default(),
            username: row.text("username"),
            email: row.text("email"),
            role: row.text("role"),
            is_active: row.int("is_active").unwrap_or_default() == 1,
            created_at: row.text("created_at"),
            updated_at: row.text("updated_at"),
            last_login_at: row.opt_text("last_login_at"),
        }
    }
}

/// Registration payload
#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password: &'a str,
    pub role: Role,
}

/// Fields `update_profile` may change; `None` keeps the current value
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub email: Option<String>,
    pub role: Option<String>,
    pub is_active: Option<bool>,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn hash_error(e: bcrypt::BcryptError) -> Error {
    Error::Internal(format!("password hashing failed: {}", e))
}

fn role_names() -> Vec<&'static str> {
    Role::ALL.iter().map(Role::as_str).collect()
}

fn active_admins() -> Filter {
    Filter::new()
        .eq("role", Role::Admin.as_str())
        .eq("is_active", true)
}

/// User account operations over a [`Store`]
pub struct Users<'a> {
    store: &'a dyn Store,
    cost: u32,
}

impl<'a> Users<'a> {
    pub fn new(store: &'a dyn Store, cost: u32) -> Self {
        Self { store, cost }
    }

    pub fn create(&self, new: &NewUser<'_>) -> Result<i64> {
        let values = self.prepare(new)?;
        let id = self.store.insert(TABLE_USERS, &values)?;
        info!(
            action = "create.success",
            user_id = id,
            username = new.username,
            role = %new.role,
            "User created"
        );
        Ok(id)
    }

    /// Create an admin account unless an active admin already exists. The
    /// check and the insert are one store operation, so concurrent
    /// bootstraps yield a single admin.
    pub fn create_first_admin(&self, new: &NewUser<'_>) -> Result<Option<i64>> {
        let new = NewUser {
            role: Role::Admin,
            ..new.clone()
        };
        let values = self.prepare(&new)?;
        match self.store.insert_unless(TABLE_USERS, &values, &active_admins())? {
            Some(id) => {
                info!(action = "bootstrap.success", user_id = id, username = new.username, "First administrator created");
                Ok(Some(id))
            }
            None => {
                warn!(action = "bootstrap.refused", username = new.username, "An administrator already exists");
                Ok(None)
            }
        }
    }

    /// Validate, reject duplicates and hash the password into an insertable row
    fn prepare(&self, new: &NewUser<'_>) -> Result<Values> {
        let mut v = Validator::from_pairs([
            ("username", new.username),
            ("email", new.email),
            ("password", new.password),
        ]);
        v.required_msg("username", "Username is required")
            .pattern("username", USERNAME_PATTERN, USERNAME_MESSAGE)
            .required_msg("email", "Email is required")
            .email("email")
            .required_msg("password", "Password is required")
            .min_length("password", PASSWORD_MIN);
        if let Err(e) = v.finish() {
            warn!(action = "create.validation_failed", errors = ?v.errors(), "User validation failed");
            return Err(e);
        }

        if self
            .store
            .exists(TABLE_USERS, &Filter::new().eq("username", new.username))?
        {
            warn!(action = "create.duplicate_username", username = new.username, "Duplicate username");
            return Err(Error::invalid("username: Username already exists"));
        }
        if self
            .store
            .exists(TABLE_USERS, &Filter::new().eq("email", new.email))?
        {
            warn!(action = "create.duplicate_email", email = new.email, "Duplicate email");
            return Err(Error::invalid("email: Email already exists"));
        }

        let hash = bcrypt::hash(new.password, self.cost).map_err(hash_error)?;
        let ts = now();
        Ok(vec![
            ("username", Value::from(new.username)),
            ("email", Value::from(new.email)),
            ("password_hash", Value::from(hash)),
            ("role", Value::from(new.role.as_str())),
            ("is_active", Value::from(true)),
            ("created_at", Value::from(&ts)),
            ("updated_at", Value::from(&ts)),
        ])
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<User>> {
        Ok(self
            .store
            .find(TABLE_USERS, &Filter::new().eq("id", id))?
            .map(|row| User::from_row(&row)))
    }

    pub fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .store
            .find(TABLE_USERS, &Filter::new().eq("username", username))?
            .map(|row| User::from_row(&row)))
    }

    /// Active user matching `username` and `password`
    pub fn verify_credentials(&self, username: &str, password: &str) -> Result<Option<User>> {
        let filter = Filter::new().eq("username", username).eq("is_active", true);
        let Some(row) = self.store.find(TABLE_USERS, &filter)? else {
            warn!(action = "auth.login_user_not_found", username, "Unknown user");
            return Ok(None);
        };

        let hash = row.text("password_hash");
        if !bcrypt::verify(password, &hash).unwrap_or(false) {
            warn!(action = "auth.login_invalid_password", username, "Invalid password");
            return Ok(None);
        }

        let user = User::from_row(&row);
        info!(action = "auth.login_verified", user_id = user.id, username, "Credentials verified");
        Ok(Some(user))
    }

    pub fn update_profile(&self, id: i64, update: &ProfileUpdate) -> Result<()> {
        let Some(current) = self.find_by_id(id)? else {
            warn!(action = "update_profile.not_found", user_id = id, "User not found");
            return Err(Error::not_found("user", id.to_string()));
        };

        let email = update.email.clone().unwrap_or_else(|| current.email.clone());
        let role = update.role.clone().unwrap_or_else(|| current.role.clone());
        let is_active = update.is_active.unwrap_or(current.is_active);

        let mut v = Validator::from_pairs([("email", email.as_str()), ("role", role.as_str())]);
        v.required_msg("email", "Email is required")
            .email("email")
            .one_of("role", &role_names());
        if let Err(e) = v.finish() {
            warn!(action = "update_profile.validation_failed", user_id = id, errors = ?v.errors(), "Profile validation failed");
            return Err(e);
        }

        if email != current.email
            && self
                .store
                .exists(TABLE_USERS, &Filter::new().eq("email", email.as_str()))?
        {
            warn!(action = "update_profile.duplicate_email", user_id = id, email = %email, "Duplicate email");
            return Err(Error::invalid("email: Email already exists"));
        }

        self.store.update(
            TABLE_USERS,
            &vec![
                ("email", Value::from(email)),
                ("role", Value::from(role)),
                ("is_active", Value::from(is_active)),
                ("updated_at", Value::from(now())),
            ],
            &Filter::new().eq("id", id),
        )?;
        info!(action = "update_profile.success", user_id = id, "Profile updated");
        Ok(())
    }

    pub fn change_password(&self, id: i64, old_password: &str, new_password: &str) -> Result<()> {
        let Some(row) = self.store.find(TABLE_USERS, &Filter::new().eq("id", id))? else {
            warn!(action = "change_password.not_found", user_id = id, "User not found");
            return Err(Error::not_found("user", id.to_string()));
        };

        if !bcrypt::verify(old_password, &row.text("password_hash")).unwrap_or(false) {
            warn!(action = "change_password.invalid_old_password", user_id = id, "Old password mismatch");
            return Err(Error::invalid("old_password: Current password is incorrect"));
        }

        let mut v = Validator::from_pairs([("password", new_password)]);
        v.required("password").min_length("password", PASSWORD_MIN);
        if let Err(e) = v.finish() {
            warn!(action = "change_password.validation_failed", user_id = id, errors = ?v.errors(), "Password validation failed");
            return Err(e);
        }

        let hash = bcrypt::hash(new_password, self.cost).map_err(hash_error)?;
        self.store.update(
            TABLE_USERS,
            &vec![
                ("password_hash", Value::from(hash)),
                ("updated_at", Value::from(now())),
            ],
            &Filter::new().eq("id", id),
        )?;
        info!(action = "change_password.success", user_id = id, "Password changed");
        Ok(())
    }

    pub fn touch_last_login(&self, id: i64) -> Result<()> {
        let ts = now();
        self.store.update(
            TABLE_USERS,
            &vec![
                ("last_login_at", Value::from(&ts)),
                ("updated_at", Value::from(&ts)),
            ],
            &Filter::new().eq("id", id),
        )?;
        Ok(())
    }

    pub fn count_users(&self) -> Result<i64> {
        self.store.count(TABLE_USERS, &Filter::all())
    }

    /// Whether at least one active admin exists
    pub fn has_any_admin(&self) -> Result<bool> {
        self.store.exists(TABLE_USERS, &active_admins())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmanager_common::Database;

    const COST: u32 = 4;

    fn alice<'a>(role: Role) -> NewUser<'a> {
        NewUser {
            username: "alice",
            email: "alice@example.org",
            password: "correct-horse",
            role,
        }
    }

    #[test]
    fn create_and_verify() {
        let db = Database::open_memory().unwrap();
        let users = Users::new(&db, COST);

        let id = users.create(&alice(Role::Operator)).unwrap();
        assert_eq!(users.count_users().unwrap(), 1);

        let user = users.verify_credentials("alice", "correct-horse").unwrap().unwrap();
        assert_eq!(user.id, id);
        assert_eq!(user.role, "operator");
        assert!(users.verify_credentials("alice", "wrong-pass").unwrap().is_none());
        assert!(users.verify_credentials("bob", "correct-horse").unwrap().is_none());

        users.touch_last_login(id).unwrap();
        assert!(users.find_by_username("alice").unwrap().unwrap().last_login_at.is_some());
    }

    #[test]
    fn create_rejects_bad_input_and_duplicates() {
        let db = Database::open_memory().unwrap();
        let users = Users::new(&db, COST);

        let err = users
            .create(&NewUser {
                username: "a!",
                email: "nope",
                password: "short",
                role: Role::Viewer,
            })
            .unwrap_err();
        match err {
            Error::Validation(errors) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected error: {other}"),
        }

        users.create(&alice(Role::Viewer)).unwrap();
        assert!(users.create(&alice(Role::Viewer)).is_err());
        assert_eq!(users.count_users().unwrap(), 1);
    }

    #[test]
    fn first_admin_is_created_once() {
        let db = Database::open_memory().unwrap();
        let users = Users::new(&db, COST);

        let id = users.create_first_admin(&alice(Role::Viewer)).unwrap().unwrap();
        assert_eq!(users.find_by_id(id).unwrap().unwrap().role, "admin");

        let bob = NewUser {
            username: "bob",
            email: "bob@example.org",
            password: "correct-horse",
            role: Role::Admin,
        };
        assert_eq!(users.create_first_admin(&bob).unwrap(), None);
        assert_eq!(users.count_users().unwrap(), 1);
    }

    #[test]
    fn concurrent_bootstraps_create_one_admin() {
        let db = Database::open_memory().unwrap();
        let names = ["alice", "bob", "carol", "dave"];

        let created: Vec<Option<i64>> = std::thread::scope(|scope| {
            let handles: Vec<_> = names
                .iter()
                .map(|name| {
                    let db = db.clone();
                    scope.spawn(move || {
                        let email = format!("{}@example.org", name);
                        Users::new(&db, COST)
                            .create_first_admin(&NewUser {
                                username: name,
                                email: &email,
                                password: "correct-horse",
                                role: Role::Admin,
                            })
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(created.iter().filter(|id| id.is_some()).count(), 1);
        let users = Users::new(&db, COST);
        assert_eq!(users.count_users().unwrap(), 1);
        assert!(users.has_any_admin().unwrap());
    }

    #[test]
    fn admin_detection_and_profile_update() {
        let db = Database::open_memory().unwrap();
        let users = Users::new(&db, COST);
        assert!(!users.has_any_admin().unwrap());

        let id = users.create(&alice(Role::Admin)).unwrap();
        assert!(users.has_any_admin().unwrap());

        users
            .update_profile(
                id,
                &ProfileUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!users.has_any_admin().unwrap());
        assert!(users.verify_credentials("alice", "correct-horse").unwrap().is_none());

        let bad_role = ProfileUpdate {
            role: Some("root".into()),
            ..Default::default()
        };
        assert!(users.update_profile(id, &bad_role).is_err());
    }

    #[test]
    fn change_password_checks_old_password() {
        let db = Database::open_memory().unwrap();
        let users = Users::new(&db, COST);
        let id = users.create(&alice(Role::Viewer)).unwrap();

        assert!(users.change_password(id, "wrong", "new-password").is_err());
        assert!(users.change_password(id, "correct-horse", "short").is_err());
        users.change_password(id, "correct-horse", "new-password").unwrap();
        assert!(users.verify_credentials("alice", "new-password").unwrap().is_some());
    }
}
