//! Authentication and authorization for the console
//!
//! - Local user accounts with bcrypt password hashes
//! - Cookie sessions stored in SQLite
//! - Priority based role checks

pub mod policy;
pub mod routes;
pub mod session;
pub mod users;

pub use policy::{require_auth, require_role, RolePolicy};
pub use session::Sessions;
pub use users::{NewUser, ProfileUpdate, User, Users};
