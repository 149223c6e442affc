//! Input validation for form and path arguments.
//!
//! A [`Validator`] wraps a `field → value` bag. Rules are chained and each
//! failure appends `"{field}: {message}"`; nothing short-circuits, so a single
//! pass reports every problem. A rule only looks at a field that is present
//! and non-empty, except [`Validator::required`].

use crate::store::{Filter, Store};
use crate::types::format_size;
use regex_lite::Regex;
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::warn;

const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const FILENAME_FORBIDDEN: [char; 9] = ['<', '>', ':', '"', '|', '?', '*', '\\', '/'];

/// Chainable validator over a string bag
#[derive(Debug, Clone, Default)]
pub struct Validator {
    data: BTreeMap<String, String>,
    errors: Vec<String>,
}

impl Validator {
    pub fn new(data: BTreeMap<String, String>) -> Self {
        Self {
            data,
            errors: Vec::new(),
        }
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    // ------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// First recorded error, empty when valid
    pub fn first_error(&self) -> &str {
        self.errors.first().map(String::as_str).unwrap_or("")
    }

    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    pub fn get<'a>(&'a self, field: &str, default: &'a str) -> &'a str {
        self.data.get(field).map(String::as_str).unwrap_or(default)
    }

    /// Convert into a [`crate::Error::Validation`] when any rule failed
    pub fn finish(&self) -> crate::Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(crate::Error::Validation(self.errors.clone()))
        }
    }

    fn add_error(&mut self, field: &str, message: &str) {
        self.errors.push(format!("{}: {}", field, message));
    }

    fn value(&self, field: &str) -> Option<String> {
        self.data.get(field).filter(|v| !v.is_empty()).cloned()
    }

    fn check(&mut self, field: &str, message: &str, ok: impl FnOnce(&str) -> bool) -> &mut Self {
        if let Some(value) = self.value(field) {
            if !ok(&value) {
                self.add_error(field, message);
            }
        }
        self
    }

    // ------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------

    pub fn required(&mut self, field: &str) -> &mut Self {
        self.required_msg(field, "Field is required")
    }

    pub fn required_msg(&mut self, field: &str, message: &str) -> &mut Self {
        let missing = self
            .data
            .get(field)
            .map(|v| v.trim().is_empty())
            .unwrap_or(true);
        if missing {
            self.add_error(field, message);
        }
        self
    }

    pub fn min_length(&mut self, field: &str, min: usize) -> &mut Self {
        let message = format!("Must be at least {} characters long", min);
        self.check(field, &message, |v| v.chars().count() >= min)
    }

    pub fn max_length(&mut self, field: &str, max: usize) -> &mut Self {
        let message = format!("Must be no more than {} characters long", max);
        self.check(field, &message, |v| v.chars().count() <= max)
    }

    /// Regex rule matched against the whole value. An invalid pattern fails
    /// the field.
    pub fn pattern(&mut self, field: &str, pattern: &str, message: &str) -> &mut Self {
        match Regex::new(&format!("^(?:{})$", pattern)) {
            Ok(re) => self.check(field, message, |v| re.is_match(v)),
            Err(e) => {
                warn!(field, pattern, error = %e, "Invalid validation pattern");
                let present = self.value(field).is_some();
                if present {
                    self.add_error(field, message);
                }
                self
            }
        }
    }

    pub fn numeric(&mut self, field: &str) -> &mut Self {
        self.check(field, "Must be a number", |v| {
            v.trim().parse::<f64>().map(f64::is_finite).unwrap_or(false)
        })
    }

    /// Non-zero integer
    pub fn integer(&mut self, field: &str) -> &mut Self {
        self.check(field, "Must be an integer", |v| {
            matches!(v.trim().parse::<i64>(), Ok(n) if n != 0)
        })
    }

    /// Inclusive integer range; a non-integer value counts as zero
    pub fn range(&mut self, field: &str, min: i64, max: i64) -> &mut Self {
        let message = format!("Must be between {} and {}", min, max);
        self.check(field, &message, |v| {
            let n = v.trim().parse::<i64>().unwrap_or(0);
            n >= min && n <= max
        })
    }

    pub fn email(&mut self, field: &str) -> &mut Self {
        self.check(field, "Invalid email format", is_email)
    }

    pub fn ip(&mut self, field: &str) -> &mut Self {
        self.check(field, "Invalid IP address", |v| v.parse::<IpAddr>().is_ok())
    }

    pub fn mac(&mut self, field: &str) -> &mut Self {
        self.check(field, "Invalid MAC address format", is_mac)
    }

    pub fn url(&mut self, field: &str) -> &mut Self {
        self.check(field, "Invalid URL format", |v| {
            url::Url::parse(v).map(|u| u.has_host()).unwrap_or(false)
        })
    }

    pub fn one_of(&mut self, field: &str, allowed: &[&str]) -> &mut Self {
        let message = format!("Must be one of: {}", allowed.join(", "));
        self.check(field, &message, |v| allowed.contains(&v))
    }

    pub fn filename(&mut self, field: &str) -> &mut Self {
        let Some(value) = self.value(field) else {
            return self;
        };
        if value.contains(&FILENAME_FORBIDDEN[..]) {
            self.add_error(field, "Invalid filename");
        } else if RESERVED_NAMES.contains(&value.to_ascii_uppercase().as_str()) {
            self.add_error(field, "Reserved filename");
        }
        self
    }

    /// Byte count must not exceed `max_bytes`
    pub fn file_size(&mut self, field: &str, max_bytes: u64) -> &mut Self {
        let message = format!("File size must not exceed {}", format_size(max_bytes));
        self.check(field, &message, |v| {
            v.trim().parse::<u64>().map(|n| n <= max_bytes).unwrap_or(true)
        })
    }

    pub fn safe_path(&mut self, field: &str) -> &mut Self {
        self.safe_path_msg(field, "Invalid file path")
    }

    /// Relative path without any traversal component
    pub fn safe_path_msg(&mut self, field: &str, message: &str) -> &mut Self {
        let Some(value) = self.value(field) else {
            return self;
        };
        if is_traversal(&value) {
            self.add_error(field, message);
        } else if is_absolute(&value) {
            self.add_error(field, "Relative paths only");
        }
        self
    }

    pub fn machine_name(&mut self, field: &str) -> &mut Self {
        self.check(
            field,
            "Invalid machine name. Use only letters, numbers, hyphens and underscores",
            is_machine_name,
        )
    }

    /// Value must not already exist in `table.column`.
    ///
    /// `exclude` adds `column != value` conditions so an edit does not collide
    /// with its own row.
    pub fn unique(
        &mut self,
        store: &dyn Store,
        field: &str,
        table: &str,
        column: &str,
        message: Option<&str>,
        exclude: &[(&str, &str)],
    ) -> &mut Self {
        let message = message.unwrap_or("Value already exists");
        let Some(value) = self.value(field) else {
            return self;
        };
        let mut filter = Filter::new().eq(column, value.as_str());
        for (col, val) in exclude {
            filter = filter.ne(col, *val);
        }
        match store.exists(table, &filter) {
            Ok(false) => {}
            Ok(true) => self.add_error(field, message),
            Err(e) => {
                warn!(field, table, error = %e, "Uniqueness check failed");
                self.add_error(field, message);
            }
        }
        self
    }

    /// Value must reference an existing `table.column` row
    pub fn exists(
        &mut self,
        store: &dyn Store,
        field: &str,
        table: &str,
        column: &str,
        message: Option<&str>,
    ) -> &mut Self {
        let message = message.unwrap_or("Value does not exist");
        let Some(value) = self.value(field) else {
            return self;
        };
        let filter = Filter::new().eq(column, value.as_str());
        match store.exists(table, &filter) {
            Ok(true) => {}
            Ok(false) => self.add_error(field, message),
            Err(e) => {
                warn!(field, table, error = %e, "Existence check failed");
                self.add_error(field, message);
            }
        }
        self
    }

    pub fn custom(
        &mut self,
        field: &str,
        message: &str,
        predicate: impl FnOnce(&str) -> bool,
    ) -> &mut Self {
        self.check(field, message, predicate)
    }
}

pub fn is_machine_name(v: &str) -> bool {
    !v.is_empty()
        && v
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub fn is_mac(v: &str) -> bool {
    let parts: Vec<&str> = v.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

fn is_email(v: &str) -> bool {
    let Some((local, domain)) = v.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !v.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .map(|(host, tld)| !host.is_empty() && !tld.is_empty() && !tld.ends_with('.'))
            .unwrap_or(false)
}

fn is_traversal(v: &str) -> bool {
    v == "."
        || v == ".."
        || v.starts_with("./")
        || v.starts_with(".\\")
        || v.starts_with("../")
        || v.starts_with("..\\")
        || v.contains("/../")
        || v.contains("\\..\\")
        || v.ends_with("/..")
        || v.ends_with("\\..")
}

fn is_absolute(v: &str) -> bool {
    if v.starts_with('/') {
        return true;
    }
    let mut chars = v.chars();
    matches!((chars.next(), chars.next()), (Some(c), Some(':')) if c.is_ascii_alphabetic())
}
