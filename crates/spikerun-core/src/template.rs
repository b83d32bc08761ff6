//! Script templating.
//!
//! Templates use `{name}` placeholders; `{{` and `}}` produce literal braces
//! (MATLAB cell arrays need them). Rendering is a pure function of the
//! template text and the bindings: every placeholder is checked for a
//! binding before anything is substituted, so a missing value never turns
//! into a silently blank field.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::TemplateError;

/// Placeholder name -> substituted text.
pub type Bindings = BTreeMap<String, String>;

enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

fn tokenize<'a>(name: &str, template: &'a str) -> Result<Vec<Segment<'a>>, TemplateError> {
    let mut segments = Vec::new();
    let bytes = template.as_bytes();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                segments.push(Segment::Literal(&template[start..i + 1]));
                i += 2;
                start = i;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                segments.push(Segment::Literal(&template[start..i + 1]));
                i += 2;
                start = i;
            }
            b'{' => {
                let close = template[i + 1..]
                    .find('}')
                    .map(|off| i + 1 + off)
                    .ok_or_else(|| TemplateError::Unterminated {
                        template: name.to_string(),
                        offset: i,
                    })?;
                segments.push(Segment::Literal(&template[start..i]));
                segments.push(Segment::Placeholder(&template[i + 1..close]));
                i = close + 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    segments.push(Segment::Literal(&template[start..]));
    Ok(segments)
}

/// Names of every placeholder used in `template`.
pub fn placeholders(name: &str, template: &str) -> Result<BTreeSet<String>, TemplateError> {
    Ok(tokenize(name, template)?
        .into_iter()
        .filter_map(|s| match s {
            Segment::Placeholder(p) => Some(p.to_string()),
            Segment::Literal(_) => None,
        })
        .collect())
}

/// Substitute `bindings` into `template`.
///
/// `name` only labels errors. Extra bindings are ignored; a placeholder
/// without a binding fails the whole render.
pub fn render(name: &str, template: &str, bindings: &Bindings) -> Result<String, TemplateError> {
    let segments = tokenize(name, template)?;

    if let Some(missing) = segments.iter().find_map(|s| match s {
        Segment::Placeholder(p) if !bindings.contains_key(*p) => Some(*p),
        _ => None,
    }) {
        return Err(TemplateError::MissingBinding {
            template: name.to_string(),
            placeholder: missing.to_string(),
        });
    }

    let mut out = String::with_capacity(template.len());
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Placeholder(p) => out.push_str(&bindings[p]),
        }
    }
    Ok(out)
}

/// Load a template by file name.
///
/// With an override directory the file must exist there; otherwise the
/// embedded copy is returned.
pub fn load_template(
    file_name: &str,
    embedded: &'static str,
    override_dir: Option<&Path>,
) -> Result<Cow<'static, str>, TemplateError> {
    match override_dir {
        None => Ok(Cow::Borrowed(embedded)),
        Some(dir) => {
            let path = dir.join(file_name);
            std::fs::read_to_string(&path)
                .map(Cow::Owned)
                .map_err(|source| TemplateError::Unreadable { path, source })
        }
    }
}
