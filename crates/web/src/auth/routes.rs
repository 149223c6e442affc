//! Login, logout, registration and admin bootstrap pages.
//!
//! Handlers only request cookie changes through [`Request::set_session`];
//! the HTTP layer writes or clears the cookie.

use super::policy::require_auth;
use super::session::Sessions;
use super::users::{NewUser, Users};
use crate::render;
use crate::request::{Request, SessionAction};
use qmanager_common::{Error, Result, Role, Validator};
use tracing::info;

const BOOTSTRAP_DONE: &str = "<p>Bootstrap already complete: an administrator exists.</p>";

fn respond(result: Result<String>) -> String {
    result.unwrap_or_else(|e| render::render_error(&e))
}

fn users<'r>(request: &'r Request<'_>) -> Users<'r> {
    Users::new(request.ctx.store(), request.ctx.config.password_cost)
}

fn sessions<'r>(request: &'r Request<'_>) -> Sessions<'r> {
    Sessions::new(request.ctx.store(), request.ctx.config.session_ttl_secs)
}

fn confirm_password(request: &Request<'_>) -> Result<()> {
    if request.field("password") != request.field("password_confirm") {
        return Err(Error::invalid(
            "password_confirm: Password confirmation does not match",
        ));
    }
    Ok(())
}

/// Open a session for `user_id` and ask the HTTP layer to set the cookie
fn sign_in(request: &Request<'_>, user_id: i64) -> Result<()> {
    users(request).touch_last_login(user_id)?;
    let token = sessions(request).create(user_id)?;
    request.set_session(SessionAction::Login(token));
    Ok(())
}

fn account_fields(with_email: bool) -> String {
    let mut fields = render::input("Username", "username", "text", "");
    if with_email {
        fields.push_str(&render::input("Email", "email", "email", ""));
    }
    fields.push_str(&render::input("Password", "password", "password", ""));
    fields.push_str(&render::input(
        "Confirm password",
        "password_confirm",
        "password",
        "",
    ));
    fields
}

fn login_form(request: &Request<'_>) -> String {
    let fields = [
        render::input("Username", "username", "text", ""),
        render::input("Password", "password", "password", ""),
    ]
    .concat();
    format!(
        "<h3>Login</h3>{}",
        render::form(&request.link("auth/login"), &fields, "Login")
    )
}

pub fn login(request: &Request<'_>, _args: &[String]) -> String {
    respond(login_page(request))
}

fn login_page(request: &Request<'_>) -> Result<String> {
    if let Some(principal) = &request.principal {
        return Ok(format!(
            "<p>You are already logged in as <strong>{}</strong>.</p>{}",
            render::escape(&principal.username),
            render::link_button(&request.link("auth/logout"), "Logout")
        ));
    }
    if !request.is_post() {
        return Ok(login_form(request));
    }

    let mut v = Validator::new(request.form.clone());
    v.required_msg("username", "Username is required")
        .required_msg("password", "Password is required");
    v.finish()?;

    let username = request.field("username").trim();
    let Some(user) = users(request).verify_credentials(username, request.field("password"))?
    else {
        return Ok(format!(
            "{}{}",
            render::error_block("Invalid username or password"),
            login_form(request)
        ));
    };

    sign_in(request, user.id)?;
    info!(action = "auth.login.success", user_id = user.id, username = %user.username, "User logged in");
    Ok(render::success_block(
        "Logged in",
        &format!("<p>Welcome, {}.</p>", render::escape(&user.username)),
    ))
}

pub fn logout(request: &Request<'_>, _args: &[String]) -> String {
    let Some(principal) = &request.principal else {
        return "<p>You are not logged in.</p>".to_string();
    };
    request.set_session(SessionAction::Logout);
    info!(action = "auth.logout", user_id = principal.id, "User logged out");
    render::success_block(
        "Logged out",
        &format!(
            "<p>You have been logged out.</p><p>{}</p>",
            render::link_button(&request.link("auth/login"), "Login again")
        ),
    )
}

pub fn register(request: &Request<'_>, _args: &[String]) -> String {
    respond(register_page(request))
}

fn register_page(request: &Request<'_>) -> Result<String> {
    if request.principal.is_some() {
        return Ok("<p>You already have an account.</p>".to_string());
    }
    if !request.is_post() {
        return Ok(format!(
            "<h3>Register</h3>{}",
            render::form(&request.link("auth/register"), &account_fields(true), "Register")
        ));
    }

    confirm_password(request)?;
    let id = users(request).create(&NewUser {
        username: request.field("username").trim(),
        email: request.field("email").trim(),
        password: request.field("password"),
        role: Role::Viewer,
    })?;
    info!(action = "auth.register", user_id = id, "Account registered");
    Ok(render::success_block(
        "Account created",
        &format!(
            "<p>Your account has been created.</p><p>{}</p>",
            render::link_button(&request.link("auth/login"), "Login")
        ),
    ))
}

pub fn bootstrap_admin(request: &Request<'_>, _args: &[String]) -> String {
    respond(bootstrap_page(request))
}

fn bootstrap_page(request: &Request<'_>) -> Result<String> {
    if users(request).has_any_admin()? {
        return Ok(BOOTSTRAP_DONE.to_string());
    }
    if !request.is_post() {
        return Ok(format!(
            "<h3>Create the first administrator</h3>{}",
            render::form(
                &request.link("auth/bootstrap-admin"),
                &account_fields(true),
                "Create administrator"
            )
        ));
    }

    confirm_password(request)?;
    let created = users(request).create_first_admin(&NewUser {
        username: request.field("username").trim(),
        email: request.field("email").trim(),
        password: request.field("password"),
        role: Role::Admin,
    })?;
    let Some(id) = created else {
        return Ok(BOOTSTRAP_DONE.to_string());
    };
    sign_in(request, id)?;
    info!(action = "auth.bootstrap_admin", user_id = id, "Administrator created");
    Ok(render::success_block(
        "Administrator created",
        "<p>You are now logged in as administrator.</p>",
    ))
}

/// Account overview and password change for the logged in user
pub fn profile(request: &Request<'_>, _args: &[String]) -> String {
    if !require_auth(request.principal.as_ref()) {
        return render::access_denied("your profile", Role::Viewer, &request.link("auth/login"));
    }
    respond(profile_page(request))
}

fn profile_page(request: &Request<'_>) -> Result<String> {
    let Some(principal) = &request.principal else {
        return Err(Error::Internal("profile without principal".into()));
    };
    let accounts = users(request);

    let mut notice = String::new();
    if request.is_post() {
        confirm_password(request)?;
        accounts.change_password(
            principal.id,
            request.field("old_password"),
            request.field("password"),
        )?;
        notice = render::success_block("Password changed", "");
    }

    let user = accounts
        .find_by_id(principal.id)?
        .ok_or_else(|| Error::not_found("user", principal.id.to_string()))?;
    let fields = [
        render::input("Current password", "old_password", "password", ""),
        render::input("New password", "password", "password", ""),
        render::input("Confirm password", "password_confirm", "password", ""),
    ]
    .concat();

    Ok(format!(
        "{}<h3>{}</h3><ul><li>Email: {}</li><li>Role: {}</li><li>Logged in: {}</li>\
         <li>Last login: {}</li></ul><h4>Change password</h4>{}",
        notice,
        render::escape(&user.username),
        render::escape(&user.email),
        render::escape(&user.role),
        principal.login_at.format("%Y-%m-%d %H:%M UTC"),
        render::escape(user.last_login_at.as_deref().unwrap_or("never")),
        render::form(&request.link("auth"), &fields, "Change password")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{form, test_context};

    fn account(password: &str, confirm: &str) -> std::collections::BTreeMap<String, String> {
        form(&[
            ("username", "alice"),
            ("email", "alice@example.org"),
            ("password", password),
            ("password_confirm", confirm),
        ])
    }

    #[test]
    fn bootstrap_creates_admin_once_and_logs_in() {
        let (ctx, _dir, _exec) = test_context();

        let req = Request::post(&ctx, None, account("password123", "password123"));
        let html = bootstrap_admin(&req, &[]);
        assert!(html.contains("Administrator created"), "{}", html);
        assert!(matches!(req.take_session_action(), Some(SessionAction::Login(t)) if t.len() == 64));

        let req = Request::get(&ctx, None);
        assert!(bootstrap_admin(&req, &[]).contains("Bootstrap already complete"));
    }

    #[test]
    fn register_checks_confirmation_and_creates_viewer() {
        let (ctx, _dir, _exec) = test_context();

        let req = Request::post(&ctx, None, account("password123", "different"));
        assert!(register(&req, &[]).contains("Password confirmation does not match"));

        let req = Request::post(&ctx, None, account("password123", "password123"));
        assert!(register(&req, &[]).contains("Account created"));
        assert!(req.take_session_action().is_none());

        let user = Users::new(ctx.store(), 4)
            .find_by_username("alice")
            .unwrap()
            .unwrap();
        assert_eq!(user.role, "viewer");

        let req = Request::post(&ctx, None, account("password123", "password123"));
        assert!(register(&req, &[]).contains("username: Username already exists"));
    }

    #[test]
    fn login_and_logout() {
        let (ctx, _dir, _exec) = test_context();
        let req = Request::post(&ctx, None, account("password123", "password123"));
        register(&req, &[]);

        let bad = form(&[("username", "alice"), ("password", "wrong-pass")]);
        let req = Request::post(&ctx, None, bad);
        assert!(login(&req, &[]).contains("Invalid username or password"));
        assert!(req.take_session_action().is_none());

        let good = form(&[("username", "alice"), ("password", "password123")]);
        let req = Request::post(&ctx, None, good);
        assert!(login(&req, &[]).contains("Welcome, alice."));
        let Some(SessionAction::Login(token)) = req.take_session_action() else {
            panic!("no session issued");
        };

        let principal = Sessions::new(ctx.store(), 60).resolve(&token).unwrap().unwrap();
        let req = Request::get(&ctx, Some(principal.clone()));
        assert!(login(&req, &[]).contains("already logged in"));

        let req = Request::get(&ctx, Some(principal));
        assert!(logout(&req, &[]).contains("You have been logged out."));
        assert_eq!(req.take_session_action(), Some(SessionAction::Logout));
    }

    #[test]
    fn profile_requires_login() {
        let (ctx, _dir, _exec) = test_context();
        let req = Request::get(&ctx, None);
        assert!(profile(&req, &[]).contains("Access denied"));
    }
}
