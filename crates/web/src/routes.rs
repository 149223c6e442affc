//! Console route table

use crate::auth::routes as auth;
use crate::dispatch::{manage, ResourceModule};
use crate::modules::{ImageModule, MachineModule, NetworkModule};
use crate::router::{CommandRouter, RouterBuilder};
use qmanager_common::Result;
use tracing::info;

/// Register every console route.
///
/// A duplicate key is a startup error.
pub fn build_router() -> Result<CommandRouter> {
    let mut builder = RouterBuilder::new();
    builder
        .register(ImageModule::ROUTE, |req, args| manage(&ImageModule, req, args))?
        .register(MachineModule::ROUTE, |req, args| {
            manage(&MachineModule, req, args)
        })?
        .register(NetworkModule::ROUTE, |req, args| {
            manage(&NetworkModule, req, args)
        })?
        .register("auth", auth::profile)?
        .register("auth/login", auth::login)?
        .register("auth/logout", auth::logout)?
        .register("auth/register", auth::register)?
        .register("auth/bootstrap-admin", auth::bootstrap_admin)?;

    let router = builder.build();
    info!(routes = ?router.routes(""), "Routes registered");
    Ok(router)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::DEFAULT_ROUTE;

    #[test]
    fn all_routes_registered() {
        let router = build_router().unwrap();
        for key in [
            DEFAULT_ROUTE,
            "image/manage",
            "machine/manage",
            "network/manage",
            "auth",
            "auth/login",
            "auth/logout",
            "auth/register",
            "auth/bootstrap-admin",
        ] {
            assert!(router.contains(key), "{}", key);
        }
        assert_eq!(router.routes("auth/").len(), 4);
        assert_eq!(router.resolve("auth/settings").key, "auth");
    }
}
