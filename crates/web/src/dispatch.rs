//! Role-gated verb dispatch for resource modules.
//!
//! Each module exposes a static allow-list of verbs. The first route argument
//! selects a verb from that table; anything unknown runs `list` with the
//! arguments untouched.

use crate::auth::policy::require_role;
use crate::render;
use crate::request::Request;
use qmanager_common::{Result, Role};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error, warn};

pub type VerbFn<M> = fn(&M, &Request<'_>, &[String]) -> Result<String>;

pub const DEFAULT_VERB: &str = "list";

/// A manageable resource: images, machines, network settings
pub trait ResourceModule: Sized + Send + Sync + 'static {
    /// Route key, e.g. `machine/manage`
    const ROUTE: &'static str;
    /// Human readable name used in denial messages
    const LABEL: &'static str;

    fn required_role(&self) -> Role {
        Role::Operator
    }

    fn verbs(&self) -> &'static [(&'static str, VerbFn<Self>)];

    /// `(verb, label)` entries of the module menu
    fn menu(&self) -> &'static [(&'static str, &'static str)];

    /// One-line status shown above the module content
    fn state(&self, request: &Request<'_>) -> String;
}

fn lookup<M: ResourceModule>(module: &M, verb: &str) -> Option<VerbFn<M>> {
    module
        .verbs()
        .iter()
        .find(|(name, _)| *name == verb)
        .map(|(_, f)| *f)
}

/// Pick the verb for `args`: `(name, function, remaining args)`
pub fn select_verb<'a, M: ResourceModule>(
    module: &M,
    args: &'a [String],
) -> Option<(&'static str, VerbFn<M>, &'a [String])> {
    if let Some(first) = args.first() {
        if let Some((name, f)) = module
            .verbs()
            .iter()
            .find(|(name, _)| *name == first.as_str())
        {
            return Some((*name, *f, &args[1..]));
        }
    }
    lookup(module, DEFAULT_VERB).map(|f| (DEFAULT_VERB, f, args))
}

/// Route handler body shared by every module
pub fn manage<M: ResourceModule>(module: &M, request: &Request<'_>, args: &[String]) -> String {
    let required = module.required_role();
    if !require_role(request.principal.as_ref(), required) {
        warn!(
            module = M::LABEL,
            user_id = request.principal.as_ref().map(|p| p.id),
            "Module access denied"
        );
        return render::access_denied(M::LABEL, required, &request.link("auth/login"));
    }

    let content = match select_verb(module, args) {
        None => {
            error!(module = M::LABEL, "Module has no list verb");
            render::error_block("Unknown command")
        }
        Some((name, verb, rest)) => {
            debug!(module = M::LABEL, verb = name, args = ?rest, "Dispatching verb");
            match catch_unwind(AssertUnwindSafe(|| verb(module, request, rest))) {
                Ok(Ok(html)) => html,
                Ok(Err(e)) => render::render_error(&e),
                Err(_) => {
                    error!(module = M::LABEL, verb = name, "Verb panicked");
                    render::error_block("An internal error occurred")
                }
            }
        }
    };

    let menu: Vec<(String, String)> = module
        .menu()
        .iter()
        .map(|(verb, label)| {
            (
                request.link(&format!("{}/{}", M::ROUTE, verb)),
                label.to_string(),
            )
        })
        .collect();

    render::manager_view(&module.state(request), &render::menu(&menu), &content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{principal, test_context};
    use qmanager_common::Error;

    struct Probe;

    fn list(_: &Probe, _: &Request<'_>, args: &[String]) -> Result<String> {
        Ok(format!("list[{}]", args.join(",")))
    }

    fn echo(_: &Probe, _: &Request<'_>, args: &[String]) -> Result<String> {
        Ok(format!("echo[{}]", args.join(",")))
    }

    fn fail(_: &Probe, _: &Request<'_>, _: &[String]) -> Result<String> {
        Err(Error::invalid("name: Field is required"))
    }

    fn boom(_: &Probe, _: &Request<'_>, _: &[String]) -> Result<String> {
        panic!("verb exploded")
    }

    const PROBE_VERBS: &[(&str, VerbFn<Probe>)] =
        &[("list", list), ("echo", echo), ("fail", fail), ("boom", boom)];

    impl ResourceModule for Probe {
        const ROUTE: &'static str = "probe/manage";
        const LABEL: &'static str = "Probes";

        fn verbs(&self) -> &'static [(&'static str, VerbFn<Self>)] {
            PROBE_VERBS
        }

        fn menu(&self) -> &'static [(&'static str, &'static str)] {
            &[("list", "List")]
        }

        fn state(&self, _: &Request<'_>) -> String {
            "probe ok".into()
        }
    }

    fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unknown_verb_falls_back_to_list_with_args() {
        let (ctx, _dir, _exec) = test_context();
        let req = Request::get(&ctx, Some(principal("operator")));
        let html = manage(&Probe, &req, &args(&["bogus", "x"]));
        assert!(html.contains("list[bogus,x]"));
        assert!(html.contains("probe ok"));

        let html = manage(&Probe, &req, &args(&["echo", "x"]));
        assert!(html.contains("echo[x]"));
    }

    #[test]
    fn role_gate_runs_first() {
        let (ctx, _dir, _exec) = test_context();
        for who in [None, Some(principal("viewer")), Some(principal("bogus"))] {
            let req = Request::get(&ctx, who);
            let html = manage(&Probe, &req, &args(&["echo"]));
            assert!(html.contains("Access denied"));
            assert!(!html.contains("echo["));
        }
    }

    #[test]
    fn errors_and_panics_are_rendered() {
        let (ctx, _dir, _exec) = test_context();
        let req = Request::get(&ctx, Some(principal("admin")));

        let html = manage(&Probe, &req, &args(&["fail"]));
        assert!(html.contains("name: Field is required"));

        let html = manage(&Probe, &req, &args(&["boom"]));
        assert!(html.contains("An internal error occurred"));
    }
}
