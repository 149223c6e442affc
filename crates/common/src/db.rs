//! SQLite database for qmanager state persistence

use crate::store::{check_identifier, Filter, Pagination, Row, Store, Value, Values};
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref())?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS virtual_machine (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                platform TEXT NOT NULL,
                hda TEXT,
                cdrom TEXT,
                memory INTEGER NOT NULL,
                cpu INTEGER NOT NULL,
                boot TEXT NOT NULL DEFAULT 'c'
            );

            CREATE TABLE IF NOT EXISTS network_interface (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                machine_name TEXT NOT NULL UNIQUE,
                mac TEXT NOT NULL UNIQUE,
                model TEXT NOT NULL DEFAULT 'virtio-net-pci',
                ip TEXT,
                netmask TEXT,
                gateway TEXT,
                dns TEXT
            );

            CREATE TABLE IF NOT EXISTS port_forwarding (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                machine_name TEXT NOT NULL,
                protocol TEXT NOT NULL,
                host_port INTEGER NOT NULL,
                guest_port INTEGER NOT NULL,
                guest_ip TEXT,
                UNIQUE(machine_name, protocol, host_port)
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'viewer',
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_login_at TEXT DEFAULT NULL
            );

            CREATE TABLE IF NOT EXISTS auth_sessions (
                token TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                FOREIGN KEY(user_id) REFERENCES users(id)
            );
            CREATE INDEX IF NOT EXISTS idx_auth_sessions_expires ON auth_sessions(expires_at);

            CREATE TABLE IF NOT EXISTS settings (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

fn value_from_ref(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Text(f.to_string()),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Text(String::from_utf8_lossy(b).into_owned()),
    }
}

/// Render a WHERE clause with `?N` placeholders starting after `offset`
fn where_clause(filter: &Filter, offset: usize) -> Result<(String, Vec<&Value>)> {
    if filter.is_empty() {
        return Ok((String::new(), Vec::new()));
    }
    let mut parts = Vec::with_capacity(filter.conditions.len());
    let mut params = Vec::with_capacity(filter.conditions.len());
    for cond in &filter.conditions {
        check_identifier(&cond.column)?;
        if cond.value.is_null() {
            let null_op = match cond.op {
                crate::store::Op::NotEq => "IS NOT NULL",
                _ => "IS NULL",
            };
            parts.push(format!("{} {}", cond.column, null_op));
        } else {
            params.push(&cond.value);
            parts.push(format!(
                "{} {} ?{}",
                cond.column,
                cond.op.sql(),
                offset + params.len()
            ));
        }
    }
    Ok((format!(" WHERE {}", parts.join(" AND ")), params))
}

/// Map constraint rejections to [`Error::Constraint`] so callers can treat
/// them as a legitimate outcome.
fn map_write_error(table: &str, e: rusqlite::Error) -> Error {
    let err = Error::Database(e);
    if err.is_constraint() {
        Error::Constraint(format!("{}: {}", table, err))
    } else {
        err
    }
}

impl Store for Database {
    fn select(
        &self,
        table: &str,
        columns: &[&str],
        filter: &Filter,
        page: Option<Pagination>,
    ) -> Result<Vec<Row>> {
        check_identifier(table)?;
        for col in columns {
            if *col != "*" {
                check_identifier(col)?;
            }
        }
        let fields = if columns.is_empty() {
            "*".to_string()
        } else {
            columns.join(", ")
        };
        let (where_sql, params) = where_clause(filter, 0)?;
        let mut sql = format!("SELECT {} FROM {}{} ORDER BY rowid", fields, table, where_sql);
        if let Some(page) = page {
            sql.push_str(&format!(" LIMIT {} OFFSET {}", page.limit, page.offset));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let rows = stmt.query_map(params_from_iter(params), |row| {
            let mut map = BTreeMap::new();
            for (idx, name) in names.iter().enumerate() {
                map.insert(name.clone(), value_from_ref(row.get_ref(idx)?));
            }
            Ok(Row(map))
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    fn insert(&self, table: &str, values: &Values) -> Result<i64> {
        check_identifier(table)?;
        if values.is_empty() {
            return Err(Error::Internal(format!("empty insert into {}", table)));
        }
        let mut columns = Vec::with_capacity(values.len());
        let mut placeholders = Vec::with_capacity(values.len());
        for (idx, (col, _)) in values.iter().enumerate() {
            check_identifier(col)?;
            columns.push(*col);
            placeholders.push(format!("?{}", idx + 1));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        );

        let conn = self.conn.lock();
        conn.execute(&sql, params_from_iter(values.iter().map(|(_, v)| v)))
            .map_err(|e| map_write_error(table, e))?;
        let id = conn.last_insert_rowid();

        debug!("Inserted into {} with rowid {}", table, id);
        Ok(id)
    }

    fn insert_unless(&self, table: &str, values: &Values, guard: &Filter) -> Result<Option<i64>> {
        check_identifier(table)?;
        if values.is_empty() {
            return Err(Error::Internal(format!("empty insert into {}", table)));
        }
        let mut columns = Vec::with_capacity(values.len());
        let mut placeholders = Vec::with_capacity(values.len());
        for (idx, (col, _)) in values.iter().enumerate() {
            check_identifier(col)?;
            columns.push(*col);
            placeholders.push(format!("?{}", idx + 1));
        }
        let (where_sql, guard_params) = where_clause(guard, values.len())?;
        let sql = format!(
            "INSERT INTO {} ({}) SELECT {} WHERE NOT EXISTS (SELECT 1 FROM {}{})",
            table,
            columns.join(", "),
            placeholders.join(", "),
            table,
            where_sql
        );
        let params: Vec<&Value> = values
            .iter()
            .map(|(_, v)| v)
            .chain(guard_params)
            .collect();

        let conn = self.conn.lock();
        let rows = conn
            .execute(&sql, params_from_iter(params))
            .map_err(|e| map_write_error(table, e))?;
        if rows == 0 {
            debug!("Guarded insert into {} skipped", table);
            return Ok(None);
        }
        let id = conn.last_insert_rowid();
        debug!("Inserted into {} with rowid {}", table, id);
        Ok(Some(id))
    }

    fn update(&self, table: &str, values: &Values, filter: &Filter) -> Result<usize> {
        check_identifier(table)?;
        if values.is_empty() {
            return Ok(0);
        }
        let mut sets = Vec::with_capacity(values.len());
        for (idx, (col, _)) in values.iter().enumerate() {
            check_identifier(col)?;
            sets.push(format!("{} = ?{}", col, idx + 1));
        }
        let (where_sql, filter_params) = where_clause(filter, values.len())?;
        let sql = format!("UPDATE {} SET {}{}", table, sets.join(", "), where_sql);

        let params: Vec<&Value> = values
            .iter()
            .map(|(_, v)| v)
            .chain(filter_params)
            .collect();

        let conn = self.conn.lock();
        let rows = conn
            .execute(&sql, params_from_iter(params))
            .map_err(|e| map_write_error(table, e))?;

        debug!("Updated {} rows in {}", rows, table);
        Ok(rows)
    }

    fn delete(&self, table: &str, filter: &Filter) -> Result<usize> {
        check_identifier(table)?;
        if filter.is_empty() {
            return Err(Error::Internal(format!(
                "refusing unfiltered delete on {}",
                table
            )));
        }
        let (where_sql, params) = where_clause(filter, 0)?;
        let sql = format!("DELETE FROM {}{}", table, where_sql);

        let conn = self.conn.lock();
        let rows = conn
            .execute(&sql, params_from_iter(params))
            .map_err(|e| map_write_error(table, e))?;

        if rows > 0 {
            debug!("Deleted {} rows from {}", rows, table);
        }
        Ok(rows)
    }

    fn count(&self, table: &str, filter: &Filter) -> Result<i64> {
        check_identifier(table)?;
        let (where_sql, params) = where_clause(filter, 0)?;
        let sql = format!("SELECT COUNT(*) FROM {}{}", table, where_sql);

        let conn = self.conn.lock();
        let count: i64 = conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(name: &str) -> Values {
        vec![
            ("name", Value::from(name)),
            ("platform", Value::from("x86_64")),
            ("hda", Value::from("disk.img")),
            ("memory", Value::from(512i64)),
            ("cpu", Value::from(1i64)),
        ]
    }

    #[test]
    fn test_crud() {
        let db = Database::open_memory().unwrap();

        let id = db.insert("virtual_machine", &vm("vm1")).unwrap();
        assert!(id > 0);

        let row = db
            .find("virtual_machine", &Filter::new().eq("name", "vm1"))
            .unwrap()
            .unwrap();
        assert_eq!(row.text("platform"), "x86_64");
        assert_eq!(row.int("memory"), Some(512));
        assert_eq!(row.text("boot"), "c");

        let updated = db
            .update(
                "virtual_machine",
                &vec![("memory", Value::from(1024i64))],
                &Filter::new().eq("name", "vm1"),
            )
            .unwrap();
        assert_eq!(updated, 1);

        let rows = db
            .select("virtual_machine", &["name", "memory"], &Filter::all(), None)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].int("memory"), Some(1024));

        assert_eq!(
            db.delete("virtual_machine", &Filter::new().eq("name", "vm1"))
                .unwrap(),
            1
        );
        assert!(!db
            .exists("virtual_machine", &Filter::new().eq("name", "vm1"))
            .unwrap());
    }

    #[test]
    fn unique_violation_maps_to_constraint() {
        let db = Database::open_memory().unwrap();
        db.insert("virtual_machine", &vm("dup")).unwrap();
        let err = db.insert("virtual_machine", &vm("dup")).unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));
    }

    #[test]
    fn guarded_insert_stops_once_guard_matches() {
        let db = Database::open_memory().unwrap();
        let guard = Filter::new().eq("platform", "aarch64");
        let mut arm = vm("arm1");
        arm[1] = ("platform", Value::from("aarch64"));

        assert!(db.insert_unless("virtual_machine", &vm("x1"), &guard).unwrap().is_some());
        assert!(db.insert_unless("virtual_machine", &arm, &guard).unwrap().is_some());

        let mut second = vm("arm2");
        second[1] = ("platform", Value::from("aarch64"));
        assert_eq!(db.insert_unless("virtual_machine", &second, &guard).unwrap(), None);
        assert_eq!(db.count("virtual_machine", &Filter::all()).unwrap(), 2);
    }

    #[test]
    fn filter_values_are_bound_not_spliced() {
        let db = Database::open_memory().unwrap();
        db.insert("virtual_machine", &vm("vm1")).unwrap();
        let hostile = Filter::new().eq("name", "vm1' OR '1'='1");
        assert_eq!(db.count("virtual_machine", &hostile).unwrap(), 0);
    }

    #[test]
    fn not_equal_and_null_conditions() {
        let db = Database::open_memory().unwrap();
        db.insert(
            "network_interface",
            &vec![
                ("machine_name", Value::from("a")),
                ("mac", Value::from("52:54:00:00:00:01")),
                ("ip", Value::Null),
            ],
        )
        .unwrap();

        let same_mac_other_machine = Filter::new()
            .eq("mac", "52:54:00:00:00:01")
            .ne("machine_name", "a");
        assert!(!db.exists("network_interface", &same_mac_other_machine).unwrap());

        let dhcp = Filter::new().eq("ip", Value::Null);
        assert_eq!(db.count("network_interface", &dhcp).unwrap(), 1);
    }

    #[test]
    fn rejects_hostile_identifiers_and_blind_deletes() {
        let db = Database::open_memory().unwrap();
        assert!(db
            .select("users; DROP TABLE users", &["*"], &Filter::all(), None)
            .is_err());
        assert!(db.delete("virtual_machine", &Filter::all()).is_err());
    }

    #[test]
    fn pagination_limits_rows() {
        let db = Database::open_memory().unwrap();
        for n in 0..5 {
            db.insert("virtual_machine", &vm(&format!("vm{}", n))).unwrap();
        }
        let rows = db
            .select(
                "virtual_machine",
                &["name"],
                &Filter::all(),
                Some(Pagination::new(1, 2)),
            )
            .unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.text("name")).collect();
        assert_eq!(names, vec!["vm1", "vm2"]);
    }
}
