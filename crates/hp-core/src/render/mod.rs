//! Deterministic text generation for the config files the panel installs.
//!
//! Rendering is pure: the same model always produces byte-identical output,
//! with no timestamps and maps iterated in sorted order. Values that end up
//! inside a config file are rejected when they could break out of their
//! directive.

mod nginx;
mod php_fpm;
mod systemd;

use thiserror::Error;

pub use nginx::{render_vhost, Upstream, VhostModel};
pub use php_fpm::{disabled_functions, render_pool, PoolModel, DANGEROUS_FUNCTIONS, PHP_INI_KEYS};
pub use systemd::render_unit;

use crate::model::SystemUnit;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("{template} requires {field}")]
    MissingField {
        template: &'static str,
        field: &'static str,
    },
    #[error("Unsafe value for {field}: {value:?}")]
    UnsafeValue { field: String, value: String },
}

/// A renderable config file.
#[derive(Debug, Clone, Copy)]
pub enum Template<'a> {
    NginxVhost(&'a VhostModel),
    PhpFpmPool(&'a PoolModel),
    SystemdUnit(&'a SystemUnit),
}

pub fn render(template: Template<'_>) -> Result<String, RenderError> {
    match template {
        Template::NginxVhost(model) => render_vhost(model),
        Template::PhpFpmPool(model) => render_pool(model),
        Template::SystemdUnit(unit) => render_unit(unit),
    }
}

/// Reject values that would terminate or nest a directive.
pub(crate) fn directive_value<'a>(field: &str, value: &'a str) -> Result<&'a str, RenderError> {
    if value
        .chars()
        .any(|c| matches!(c, '\n' | '\r' | '\0' | ';' | '{' | '}' | '"' | '\''))
    {
        return Err(RenderError::UnsafeValue {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value)
}

/// Reject values that would start a new line in a line-oriented file.
pub(crate) fn single_line<'a>(field: &str, value: &'a str) -> Result<&'a str, RenderError> {
    if value.contains(['\n', '\r', '\0']) {
        return Err(RenderError::UnsafeValue {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value)
}
