//! Minimal prompt template renderer.
//!
//! Supports exactly the three features the continuation prompts need:
//! `{{VAR}}` substitution, `{{#if X}}...{{/if}}` conditionals, and
//! `{{#each X}}...{{/each}}` loops (with `{{this}}` bound per item).
//! Anything richer belongs in the external prompt tooling, not here.

use crate::{CrewlyError, Result};
use std::collections::HashMap;

/// A value bindable into a template.
#[derive(Debug, Clone)]
pub enum TemplateValue {
    Str(String),
    Bool(bool),
    List(Vec<String>),
}

impl TemplateValue {
    /// Truthiness for `{{#if}}`: true booleans, non-empty strings,
    /// non-empty lists.
    fn is_truthy(&self) -> bool {
        match self {
            TemplateValue::Bool(b) => *b,
            TemplateValue::Str(s) => !s.is_empty(),
            TemplateValue::List(items) => !items.is_empty(),
        }
    }

    fn render_scalar(&self) -> String {
        match self {
            TemplateValue::Str(s) => s.clone(),
            TemplateValue::Bool(b) => b.to_string(),
            TemplateValue::List(items) => items.join(", "),
        }
    }
}

impl From<&str> for TemplateValue {
    fn from(s: &str) -> Self {
        TemplateValue::Str(s.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(s: String) -> Self {
        TemplateValue::Str(s)
    }
}

impl From<bool> for TemplateValue {
    fn from(b: bool) -> Self {
        TemplateValue::Bool(b)
    }
}

impl From<Vec<String>> for TemplateValue {
    fn from(items: Vec<String>) -> Self {
        TemplateValue::List(items)
    }
}

/// Variable bindings for one render pass.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    vars: HashMap<String, TemplateValue>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<TemplateValue>) -> &mut Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    fn get(&self, name: &str) -> Option<&TemplateValue> {
        self.vars.get(name)
    }
}

/// Render `template` against `ctx`.
///
/// Unknown variables render as empty strings; malformed block syntax
/// (unclosed `#if`/`#each`) is a [`CrewlyError::Template`].
pub fn render(template: &str, ctx: &TemplateContext) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let close = after_open
            .find("}}")
            .ok_or_else(|| CrewlyError::Template("unclosed '{{' tag".to_string()))?;
        let tag = after_open[..close].trim();
        let after_tag = &after_open[close + 2..];

        if let Some(name) = tag.strip_prefix("#if ") {
            let name = name.trim();
            let (body, remainder) = split_block(after_tag, "if")?;
            let truthy = ctx.get(name).map(|v| v.is_truthy()).unwrap_or(false);
            if truthy {
                out.push_str(&render(body, ctx)?);
            }
            rest = remainder;
        } else if let Some(name) = tag.strip_prefix("#each ") {
            let name = name.trim();
            let (body, remainder) = split_block(after_tag, "each")?;
            if let Some(TemplateValue::List(items)) = ctx.get(name) {
                for item in items {
                    let mut item_ctx = ctx.clone();
                    item_ctx.set("this", item.clone());
                    out.push_str(&render(body, &item_ctx)?);
                }
            }
            rest = remainder;
        } else if tag.starts_with('/') {
            return Err(CrewlyError::Template(format!(
                "unexpected closing tag '{{{{{tag}}}}}'"
            )));
        } else {
            if let Some(value) = ctx.get(tag) {
                out.push_str(&value.render_scalar());
            }
            rest = after_tag;
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// Split `input` at the closing tag for `kind`, honoring nested blocks
/// of the same kind. Returns `(body, remainder-after-close)`.
fn split_block<'a>(input: &'a str, kind: &str) -> Result<(&'a str, &'a str)> {
    let open_tag = format!("{{{{#{kind} ");
    let close_tag = format!("{{{{/{kind}}}}}");
    let mut depth = 1usize;
    let mut search_from = 0usize;

    loop {
        let next_open = input[search_from..].find(&open_tag);
        let next_close = input[search_from..].find(&close_tag);

        match next_close {
            None => {
                return Err(CrewlyError::Template(format!(
                    "unclosed '{{{{#{kind}}}}}' block"
                )))
            }
            Some(close_off) => {
                if let Some(open_off) = next_open {
                    if open_off < close_off {
                        depth += 1;
                        search_from += open_off + open_tag.len();
                        continue;
                    }
                }
                depth -= 1;
                let close_abs = search_from + close_off;
                if depth == 0 {
                    let body = &input[..close_abs];
                    let remainder = &input[close_abs + close_tag.len()..];
                    return Ok((body, remainder));
                }
                search_from = close_abs + close_tag.len();
            }
        }
    }
}
