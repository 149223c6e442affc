//! Per-request input passed down the router and dispatcher

use crate::context::AppContext;
use qmanager_common::Principal;
use std::cell::RefCell;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Cookie change requested by a handler, applied by the HTTP layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Login(String),
    Logout,
}

/// One console request.
///
/// The principal is resolved from the session cookie before routing and is
/// never looked up again further down.
pub struct Request<'a> {
    pub ctx: &'a AppContext,
    pub method: Method,
    pub principal: Option<Principal>,
    pub form: BTreeMap<String, String>,
    session: RefCell<Option<SessionAction>>,
}

impl<'a> Request<'a> {
    pub fn new(
        ctx: &'a AppContext,
        method: Method,
        principal: Option<Principal>,
        form: BTreeMap<String, String>,
    ) -> Self {
        Self {
            ctx,
            method,
            principal,
            form,
            session: RefCell::new(None),
        }
    }

    pub fn get(ctx: &'a AppContext, principal: Option<Principal>) -> Self {
        Self::new(ctx, Method::Get, principal, BTreeMap::new())
    }

    pub fn post(
        ctx: &'a AppContext,
        principal: Option<Principal>,
        form: BTreeMap<String, String>,
    ) -> Self {
        Self::new(ctx, Method::Post, principal, form)
    }

    pub fn is_post(&self) -> bool {
        self.method == Method::Post
    }

    /// Form field, empty when absent
    pub fn field(&self, name: &str) -> &str {
        self.form.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn link(&self, q: &str) -> String {
        self.ctx.config.link(q)
    }

    pub fn set_session(&self, action: SessionAction) {
        *self.session.borrow_mut() = Some(action);
    }

    pub fn take_session_action(&self) -> Option<SessionAction> {
        self.session.borrow_mut().take()
    }
}
