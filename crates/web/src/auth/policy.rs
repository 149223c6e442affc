//! Role policy: who may reach what.

use qmanager_common::{Principal, Role};
use tracing::warn;

pub struct RolePolicy;

impl RolePolicy {
    /// Whether a stored role name meets `required`.
    ///
    /// Unknown names carry priority 0 and never satisfy a real role.
    pub fn satisfies(actual: &str, required: Role) -> bool {
        Role::priority_of(actual) >= required.priority()
    }

    /// Roles accepted for `required`, lowest first: `operator or admin`
    pub fn accepted_roles(required: Role) -> String {
        let mut roles: Vec<&str> = Role::ALL
            .iter()
            .filter(|r| r.priority() >= required.priority())
            .map(Role::as_str)
            .collect();
        roles.reverse();
        roles.join(" or ")
    }
}

pub fn require_auth(principal: Option<&Principal>) -> bool {
    if principal.is_some() {
        return true;
    }
    warn!(action = "auth.require_auth.denied", "Anonymous request to protected resource");
    false
}

pub fn require_role(principal: Option<&Principal>, required: Role) -> bool {
    let Some(principal) = principal else {
        require_auth(None);
        return false;
    };
    if RolePolicy::satisfies(&principal.role, required) {
        return true;
    }
    warn!(
        action = "auth.require_role.denied",
        user_id = principal.id,
        role = %principal.role,
        required = %required,
        "Role requirement not met"
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn principal(role: &str) -> Principal {
        Principal {
            id: 1,
            username: "alice".into(),
            role: role.into(),
            login_at: Utc::now(),
        }
    }

    #[test]
    fn ordering() {
        assert!(RolePolicy::satisfies("admin", Role::Operator));
        assert!(RolePolicy::satisfies("operator", Role::Operator));
        assert!(!RolePolicy::satisfies("viewer", Role::Operator));
        assert!(RolePolicy::satisfies("viewer", Role::Viewer));
    }

    #[test]
    fn unknown_role_fails_closed() {
        assert!(!RolePolicy::satisfies("superuser", Role::Viewer));
        assert!(!RolePolicy::satisfies("", Role::Viewer));
        assert!(!require_role(Some(&principal("Admin")), Role::Viewer));
    }

    #[test]
    fn anonymous_is_denied() {
        assert!(!require_auth(None));
        assert!(!require_role(None, Role::Viewer));
        assert!(require_role(Some(&principal("operator")), Role::Operator));
    }

    #[test]
    fn accepted_role_text() {
        assert_eq!(RolePolicy::accepted_roles(Role::Operator), "operator or admin");
        assert_eq!(RolePolicy::accepted_roles(Role::Admin), "admin");
    }
}
