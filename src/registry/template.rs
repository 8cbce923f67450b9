//! `{{ name }}` placeholder substitution for module command templates.
//!
//! An unterminated `{{` or an empty `{{}}` is kept as literal text.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// A placeholder had no value.
    #[error("no value for placeholder '{name}'")]
    Missing { name: String },
}

enum Piece<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

fn pieces(template: &str) -> Vec<Piece<'_>> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            break;
        };
        let name = after_open[..close].trim();
        if name.is_empty() {
            out.push(Piece::Text(&rest[..open + 2 + close + 2]));
        } else {
            out.push(Piece::Text(&rest[..open]));
            out.push(Piece::Placeholder(name));
        }
        rest = &after_open[close + 2..];
    }
    out.push(Piece::Text(rest));
    out
}

/// Renders `template`, asking `lookup` for every placeholder.
pub fn render<F>(template: &str, lookup: F) -> Result<String, TemplateError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut rendered = String::with_capacity(template.len());
    for piece in pieces(template) {
        match piece {
            Piece::Text(text) => rendered.push_str(text),
            Piece::Placeholder(name) => match lookup(name) {
                Some(value) => rendered.push_str(&value),
                None => {
                    return Err(TemplateError::Missing {
                        name: name.to_string(),
                    })
                }
            },
        }
    }
    Ok(rendered)
}

/// Placeholder names in order of first appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for piece in pieces(template) {
        if let Piece::Placeholder(name) = piece {
            if !names.iter().any(|known| known == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}
