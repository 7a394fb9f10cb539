//! Prompt template rendering.
//!
//! Templates use `{{.field}}` placeholders where `field` is a key in a
//! task's input mapping. Missing keys render as the empty string. Anything
//! that opens `{{` without forming a valid dotted-field placeholder is a
//! template error, reported at batch creation by [`validate`] and at
//! execution time by [`render`].

use crate::{Result, VesselError};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\.([A-Za-z0-9_]+)\}\}").expect("placeholder regex"))
}

/// Checks that every `{{` in the template opens a well-formed
/// `{{.field}}` placeholder.
pub fn validate(template: &str) -> Result<()> {
    let spans: Vec<(usize, usize)> = placeholder_re()
        .find_iter(template)
        .map(|m| (m.start(), m.end()))
        .collect();

    let mut search = 0;
    while let Some(pos) = template[search..].find("{{") {
        let open = search + pos;
        match spans.iter().find(|(start, _)| *start == open) {
            Some((_, end)) => search = *end,
            None => {
                let tail: String = template[open..].chars().take(20).collect();
                return Err(VesselError::Template(format!(
                    "malformed placeholder at byte {open}: {tail:?}"
                )));
            }
        }
    }
    Ok(())
}

/// Renders the template against an input mapping. Missing keys substitute
/// the empty string; malformed placeholders are errors.
pub fn render(template: &str, input: &HashMap<String, String>) -> Result<String> {
    validate(template)?;
    let rendered = placeholder_re().replace_all(template, |caps: &regex::Captures<'_>| {
        input.get(&caps[1]).cloned().unwrap_or_default()
    });
    Ok(rendered.into_owned())
}
