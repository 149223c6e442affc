//! HTML fragments and the page layout.
//!
//! All user supplied text passes through [`escape`] before it is written into
//! markup. Functions taking `*_html` arguments expect already-rendered markup.

use crate::auth::policy::RolePolicy;
use qmanager_common::{Error, Role};
use std::collections::BTreeMap;
use tracing::{error, warn};

const STYLE: &str = "body{font-family:sans-serif;margin:0 auto;max-width:960px;padding:0 1em}\
.navbar a{margin-right:1em}.error{color:#b00;background:#ffe6e6;border:1px solid #f00;padding:12px;margin-bottom:10px}\
.success{color:#060;background:#e6ffe6;border:1px solid #0a0;padding:12px;margin-bottom:10px}\
.state{color:#555;font-size:small}table{border-collapse:collapse;width:100%}td,th{border-bottom:1px solid #ddd;padding:4px;text-align:left}\
label{display:block;margin-top:8px}pre{background:#f4f4f4;padding:8px;overflow:auto}";

pub fn escape(s: &str) -> String {
    v_htmlescape::escape(s).to_string()
}

pub fn error_block(message: &str) -> String {
    format!("<div class='error'>Error: {}</div>", escape(message))
}

pub fn error_list(errors: &[String]) -> String {
    let items: String = errors
        .iter()
        .map(|e| format!("<li>{}</li>", escape(e)))
        .collect();
    format!("<div class='error'><h4>Please fix the following:</h4><ul>{}</ul></div>", items)
}

pub fn success_block(title: &str, body_html: &str) -> String {
    format!(
        "<div class='success'><h3>{}</h3>{}</div>",
        escape(title),
        body_html
    )
}

pub fn card(content_html: &str) -> String {
    format!("<div class='card'>{}</div>", content_html)
}

pub fn link_button(href: &str, label: &str) -> String {
    format!("<a href='{}' class='button'>{}</a>", escape(href), escape(label))
}

pub fn pre(lines: &[String]) -> String {
    format!("<pre>{}</pre>", escape(&lines.join("\n")))
}

/// Standard denial for a protected module; names only the label and role
pub fn access_denied(label: &str, required: Role, login_href: &str) -> String {
    format!(
        "<div class='error'><h3>Access denied</h3>\
         <p>You must be authenticated as {} to access {}.</p>\
         <p><a href='{}' class='button button-primary'>Login</a></p></div>",
        RolePolicy::accepted_roles(required),
        escape(label),
        escape(login_href)
    )
}

/// Render an operation error.
///
/// Input and lookup failures are shown as-is; internal faults are logged and
/// replaced with a generic message.
pub fn render_error(err: &Error) -> String {
    match err {
        Error::Validation(errors) => {
            warn!(errors = ?errors, "Validation failed");
            error_list(errors)
        }
        Error::AccessDenied { resource, required } => {
            warn!(resource = %resource, required = %required, "Access denied");
            error_block(&format!("Access denied to {}", resource))
        }
        Error::NotFound { kind, id } => error_block(&format!("{} does not exist: {}", kind, id)),
        Error::Process { command, message } => {
            error!(command = %command, message = %message, "External command failed");
            format!(
                "<div class='error'>Error: command failed<pre>{}</pre></div>",
                escape(message)
            )
        }
        Error::Constraint(detail) => {
            warn!(detail = %detail, "Constraint violation");
            error_block("Value already exists")
        }
        Error::PathEscape(path) => {
            warn!(path = %path, "Path outside the images root");
            error_block("Invalid file path")
        }
        other => {
            error!(error = %other, "Operation failed");
            error_block("An internal error occurred")
        }
    }
}

pub fn table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let head: String = headers
        .iter()
        .map(|h| format!("<th>{}</th>", escape(h)))
        .collect();
    let body: String = rows
        .iter()
        .map(|cells| {
            let tds: String = cells.iter().map(|c| format!("<td>{}</td>", c)).collect();
            format!("<tr>{}</tr>", tds)
        })
        .collect();
    format!(
        "<table><thead><tr>{}</tr></thead><tbody>{}</tbody></table>",
        head, body
    )
}

// ----------------------------------------------------------------------------
// Forms
// ----------------------------------------------------------------------------

pub fn form(action: &str, fields_html: &str, submit: &str) -> String {
    format!(
        "<form method='post' action='{}'>{}<input type='submit' value='{}' class='button button-primary'></form>",
        escape(action),
        fields_html,
        escape(submit)
    )
}

pub fn input(label: &str, name: &str, kind: &str, value: &str) -> String {
    format!(
        "<label for='{n}'>{}</label><input class='u-full-width' id='{n}' type='{}' name='{n}' value='{}'>",
        escape(label),
        escape(kind),
        escape(value),
        n = escape(name)
    )
}

pub fn select(label: &str, name: &str, options: &[(String, String)], selected: &str) -> String {
    let opts: String = options
        .iter()
        .map(|(value, text)| {
            let sel = if value == selected { " selected" } else { "" };
            format!(
                "<option value='{}'{}>{}</option>",
                escape(value),
                sel,
                escape(text)
            )
        })
        .collect();
    format!(
        "<label for='{n}'>{}</label><select class='u-full-width' id='{n}' name='{n}'>{}</select>",
        escape(label),
        opts,
        n = escape(name)
    )
}

// ----------------------------------------------------------------------------
// Layout
// ----------------------------------------------------------------------------

/// `(href, label)` pairs as a link list
pub fn menu(items: &[(String, String)]) -> String {
    items
        .iter()
        .map(|(href, label)| format!("<a href='{}'>{}</a>", escape(href), escape(label)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Shared wrapper for resource modules
pub fn manager_view(state: &str, menu_html: &str, content_html: &str) -> String {
    format!(
        "<div class='module'><div class='state'>{}</div><div class='module-menu'>{}</div>\
         <div class='module-content'>{}</div></div>",
        escape(state),
        menu_html,
        content_html
    )
}

/// Full HTML document. `settings` carries the `site-*` values.
pub fn page(settings: &BTreeMap<String, String>, menu_html: &str, content_html: &str) -> String {
    let title = settings
        .get("site-title")
        .map(String::as_str)
        .unwrap_or("qmanager");
    let footer = settings
        .get("site-footer")
        .map(String::as_str)
        .unwrap_or("");
    format!(
        "<!DOCTYPE html>\n<html lang='en'><head><meta charset='utf-8'><title>{title}</title>\
         <style>{STYLE}</style></head><body>\
         <div class='container'><div class='header row'><h1>{title}</h1></div>\
         <div class='navbar row'>{menu_html}</div></div>\
         <div class='container'><div class='main row'>{content_html}</div></div>\
         <div class='container'><div class='footer row'>{footer}</div></div>\
         </body></html>",
        title = escape(title),
        footer = escape(footer),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup() {
        let escaped = escape("<b>'x'</b>");
        assert!(escaped.starts_with("&lt;b&gt;"));
        assert!(!escaped.contains('<') && !escaped.contains('\''));
        assert!(error_block("<script>").contains("&lt;script&gt;"));
    }

    #[test]
    fn denial_names_label_and_roles() {
        let html = access_denied("Virtual Machines", Role::Operator, "/?q=auth/login");
        assert!(html.contains("You must be authenticated as operator or admin to access Virtual Machines."));
    }

    #[test]
    fn internal_errors_are_generic() {
        let html = render_error(&Error::Internal("secret detail".into()));
        assert!(html.contains("An internal error occurred"));
        assert!(!html.contains("secret detail"));

        let html = render_error(&Error::Validation(vec!["cpu: Must be an integer".into()]));
        assert!(html.contains("cpu: Must be an integer"));
    }

    #[test]
    fn page_uses_site_settings() {
        let mut settings = BTreeMap::new();
        settings.insert("site-title".to_string(), "Lab host".to_string());
        let html = page(&settings, "", "<p>hi</p>");
        assert!(html.contains("<title>Lab host</title>"));
        assert!(html.contains("<p>hi</p>"));
    }
}
