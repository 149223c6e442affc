//! qmanager web console
//!
//! Browser front end for managing QEMU disk images, virtual machines and
//! their networking on a single host.

pub mod auth;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod modules;
pub mod render;
pub mod request;
pub mod router;
pub mod routes;
pub mod server;

pub use config::ConsoleConfig;
pub use context::AppContext;
pub use request::{Method, Request, SessionAction};
pub use router::{CommandRouter, RouterBuilder};

#[cfg(test)]
pub(crate) mod testing {
    use crate::config::ConsoleConfig;
    use crate::context::AppContext;
    use chrono::Utc;
    use qmanager_common::process::RecordingExecutor;
    use qmanager_common::{
        random_mac, Database, Principal, ProcessInvoker, Store, Value, TABLE_INTERFACE, TABLE_VM,
    };
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// In-memory store, temporary images root and a recording executor
    pub fn test_context() -> (AppContext, TempDir, Arc<RecordingExecutor>) {
        test_context_with(Arc::new(Database::open_memory().unwrap()))
    }

    pub fn test_context_with(store: Arc<dyn Store>) -> (AppContext, TempDir, Arc<RecordingExecutor>) {
        let dir = TempDir::new().unwrap();
        let config = ConsoleConfig {
            images_dir: dir.path().to_path_buf(),
            password_cost: 4,
            ..Default::default()
        };
        let exec = RecordingExecutor::new();
        let ctx = AppContext::new(config, store, ProcessInvoker::new(exec.clone()));
        (ctx, dir, exec)
    }

    pub fn principal(role: &str) -> Principal {
        Principal {
            id: 1,
            username: role.to_string(),
            role: role.to_string(),
            login_at: Utc::now(),
        }
    }

    pub fn form(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| s.to_string()).collect()
    }

    /// Machine with 512 MB, one CPU and a default interface
    pub fn seed_machine(ctx: &AppContext, name: &str, hda: Option<&str>) {
        let store = ctx.store();
        store
            .insert(
                TABLE_VM,
                &vec![
                    ("name", Value::from(name)),
                    ("platform", Value::from("x86_64")),
                    ("hda", Value::from(hda)),
                    ("memory", Value::from(512i64)),
                    ("cpu", Value::from(1i64)),
                    ("boot", Value::from("c")),
                ],
            )
            .unwrap();
        store
            .insert(
                TABLE_INTERFACE,
                &vec![
                    ("machine_name", Value::from(name)),
                    ("mac", Value::from(random_mac())),
                ],
            )
            .unwrap();
    }
}
