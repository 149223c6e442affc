//! HTTP front end.
//!
//! `GET /?q=<path>` and `POST /?q=<path>` run the command router on a
//! blocking task and wrap the result in the page layout. `/health` answers
//! with a small JSON document.

use crate::auth::session::{clear_cookie, cookie_value, session_cookie, Sessions};
use crate::auth::users::Users;
use crate::context::AppContext;
use crate::render;
use crate::request::{Method, Request, SessionAction};
use crate::router::CommandRouter;
use crate::routes::build_router;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Form, Json, Router,
};
use qmanager_common::{Filter, Principal, Store, TABLE_SETTINGS};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared by every HTTP handler
#[derive(Clone)]
pub struct ServerState {
    ctx: Arc<AppContext>,
    router: Arc<CommandRouter>,
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    #[serde(default)]
    q: String,
}

/// Rendered page plus an optional `Set-Cookie` value
struct PageResponse {
    html: String,
    set_cookie: Option<String>,
}

impl IntoResponse for PageResponse {
    fn into_response(self) -> Response {
        match self.set_cookie {
            Some(cookie) => ([(header::SET_COOKIE, cookie)], Html(self.html)).into_response(),
            None => Html(self.html).into_response(),
        }
    }
}

/// Build the axum application
pub fn app(ctx: AppContext, router: CommandRouter) -> Router {
    let state = ServerState {
        ctx: Arc::new(ctx),
        router: Arc::new(router),
    };

    Router::new()
        .route("/", get(page_get_handler).post(page_post_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Register routes, bind the configured address and serve until shutdown
pub async fn serve(ctx: AppContext) -> anyhow::Result<()> {
    let router = build_router()?;
    let addr: SocketAddr = ctx.config.listen.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("qmanager console listening on http://{}", addr);
    axum::serve(listener, app(ctx, router)).await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "qmanager-web"
    }))
}

async fn page_get_handler(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Response {
    handle(state, &headers, Method::Get, query.q, BTreeMap::new()).await
}

async fn page_post_handler(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
    Form(form): Form<BTreeMap<String, String>>,
) -> Response {
    handle(state, &headers, Method::Post, query.q, form).await
}

async fn handle(
    state: ServerState,
    headers: &HeaderMap,
    method: Method,
    q: String,
    form: BTreeMap<String, String>,
) -> Response {
    let token = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| cookie_value(h, &state.ctx.config.cookie_name))
        .map(str::to_string);

    let task = tokio::task::spawn_blocking(move || {
        render_request(&state, method, &q, form, token.as_deref())
    });
    match task.await {
        Ok(page) => page.into_response(),
        Err(e) => {
            error!(error = %e, "Request task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(render::error_block("An internal error occurred")),
            )
                .into_response()
        }
    }
}

/// Run one console request synchronously: resolve the session, route, apply
/// any session change and render the full page
fn render_request(
    state: &ServerState,
    method: Method,
    q: &str,
    form: BTreeMap<String, String>,
    token: Option<&str>,
) -> PageResponse {
    let ctx = state.ctx.as_ref();
    let config = &ctx.config;
    let sessions = Sessions::new(ctx.store(), config.session_ttl_secs);

    let principal = token.and_then(|t| {
        sessions.resolve(t).unwrap_or_else(|e| {
            warn!(error = %e, "Session lookup failed");
            None
        })
    });
    let stale_cookie = token.is_some() && principal.is_none();

    let request = Request::new(ctx, method, principal, form);
    debug!(q, method = ?method, user_id = request.principal.as_ref().map(|p| p.id), "Console request");
    let content = state.router.run(&request, q);

    let (principal, set_cookie) = match request.take_session_action() {
        Some(SessionAction::Login(new_token)) => {
            let principal = sessions.resolve(&new_token).unwrap_or_else(|e| {
                warn!(error = %e, "New session lookup failed");
                None
            });
            let cookie = session_cookie(&config.cookie_name, &new_token, config.session_ttl_secs);
            (principal, Some(cookie))
        }
        Some(SessionAction::Logout) => {
            if let Some(t) = token {
                if let Err(e) = sessions.destroy(t) {
                    warn!(error = %e, "Session removal failed");
                }
            }
            (None, Some(clear_cookie(&config.cookie_name)))
        }
        None if stale_cookie => (None, Some(clear_cookie(&config.cookie_name))),
        None => (request.principal.clone(), None),
    };

    let menu = site_menu(ctx, principal.as_ref());
    let settings = site_settings(ctx.store());
    PageResponse {
        html: render::page(&settings, &menu, &content),
        set_cookie,
    }
}

/// Navigation entries for the current visitor
fn site_menu(ctx: &AppContext, principal: Option<&Principal>) -> String {
    let config = &ctx.config;
    let has_admin = Users::new(ctx.store(), config.password_cost)
        .has_any_admin()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Admin lookup failed");
            true
        });

    let mut items: Vec<(String, String)> = Vec::new();
    if !has_admin {
        items.push((config.link("auth/bootstrap-admin"), "Bootstrap Admin".into()));
    }
    match principal {
        Some(p) => {
            items.push((config.link("image/manage"), "Images".into()));
            items.push((config.link("machine/manage"), "Virtual Machines".into()));
            items.push((config.link("network/manage"), "Network Settings".into()));
            items.push((config.link("auth"), "Profile".into()));
            items.push((config.link("auth/logout"), format!("Logout ({})", p.username)));
        }
        None => {
            items.push((config.link("auth/login"), "Login".into()));
            items.push((config.link("auth/register"), "Register".into()));
        }
    }
    render::menu(&items)
}

/// `site-*` rows of the settings table
fn site_settings(store: &dyn Store) -> BTreeMap<String, String> {
    match store.select(
        TABLE_SETTINGS,
        &["name", "value"],
        &Filter::new().like("name", "site-%"),
        None,
    ) {
        Ok(rows) => rows
            .iter()
            .map(|row| (row.text("name"), row.text("value")))
            .collect(),
        Err(e) => {
            warn!(error = %e, "Cannot load site settings");
            BTreeMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_context;
    use qmanager_common::Value;

    #[test]
    fn menu_follows_state() {
        let (ctx, _dir, _exec) = test_context();
        let menu = site_menu(&ctx, None);
        assert!(menu.contains("Bootstrap Admin"));
        assert!(menu.contains("Login"));
        assert!(!menu.contains("Virtual Machines"));

        let principal = crate::testing::principal("operator");
        let menu = site_menu(&ctx, Some(&principal));
        assert!(menu.contains("Virtual Machines"));
        assert!(menu.contains("Logout (operator)"));
    }

    #[test]
    fn settings_are_filtered_by_prefix() {
        let (ctx, _dir, _exec) = test_context();
        for (name, value) in [("site-title", "Lab"), ("smtp-host", "mail")] {
            ctx.store()
                .insert(
                    TABLE_SETTINGS,
                    &vec![("name", Value::from(name)), ("value", Value::from(value))],
                )
                .unwrap();
        }
        let settings = site_settings(ctx.store());
        assert_eq!(settings.len(), 1);
        assert_eq!(settings["site-title"], "Lab");
    }
}
