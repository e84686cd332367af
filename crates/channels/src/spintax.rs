//! Spintax rendering — turns `{Oi|Olá|E aí}, {nome}!` into one random variant
//! per call so outbound messages are not byte-identical.
//!
//! Rendering happens in two passes:
//! 1. `{name}` placeholders are replaced (case-insensitively) with contact
//!    variables, verbatim.
//! 2. The innermost `{a|b|c}` group is resolved repeatedly until no group is
//!    left, so nested groups resolve inside-out.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Outcome of [`SpintaxEngine::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateValidation {
    pub valid: bool,
    pub error: Option<String>,
}

impl TemplateValidation {
    fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    fn invalid(error: String) -> Self {
        Self {
            valid: false,
            error: Some(error),
        }
    }
}

pub struct SpintaxEngine {
    rng: Mutex<StdRng>,
}

impl SpintaxEngine {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Engine with a fixed seed, for reproducible output.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Render one random variant of `template`.
    pub fn render(&self, template: &str, variables: &HashMap<String, String>) -> String {
        if template.is_empty() {
            return String::new();
        }
        let substituted = if variables.is_empty() {
            template.to_string()
        } else {
            substitute_variables(template, variables)
        };
        self.resolve_groups(substituted)
    }

    fn resolve_groups(&self, mut text: String) -> String {
        let mut rng = self.rng.lock();
        while let Some((start, end)) = innermost_group(&text) {
            let options: Vec<&str> = text[start + 1..end].split('|').collect();
            let chosen = options
                .choose(&mut *rng)
                .map(|option| option.trim())
                .unwrap_or_default()
                .to_string();
            text.replace_range(start..=end, &chosen);
        }
        text
    }

    /// Collect up to `count` distinct renders, giving up after `10 × count`
    /// attempts. Returns fewer when the template has fewer variants.
    pub fn generate_variations(
        &self,
        template: &str,
        count: usize,
        variables: &HashMap<String, String>,
    ) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut variations = Vec::with_capacity(count);
        let max_attempts = count.saturating_mul(10);
        let mut attempts = 0;

        while variations.len() < count && attempts < max_attempts {
            let variant = self.render(template, variables);
            if seen.insert(variant.clone()) {
                variations.push(variant);
            }
            attempts += 1;
        }
        variations
    }

    /// Check brace balance and reject empty `{}` groups.
    pub fn validate(template: &str) -> TemplateValidation {
        let open = template.matches('{').count();
        let close = template.matches('}').count();
        if open != close {
            return TemplateValidation::invalid(format!(
                "unbalanced braces: {open} opening, {close} closing"
            ));
        }
        if has_empty_group(template) {
            return TemplateValidation::invalid("empty group found".to_string());
        }
        TemplateValidation::ok()
    }
}

impl Default for SpintaxEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace `{key}` with its value when `key` matches a variable name,
/// ignoring case. Unknown placeholders are left alone.
fn substitute_variables(template: &str, variables: &HashMap<String, String>) -> String {
    let lookup: HashMap<String, &str> = variables
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.as_str()))
        .collect();

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find(['{', '}']);
        match close {
            Some(idx) if after.as_bytes()[idx] == b'}' => {
                let name = &after[..idx];
                if let Some(value) = lookup.get(&name.to_lowercase()) {
                    out.push_str(value);
                    rest = &after[idx + 1..];
                    continue;
                }
                out.push('{');
                rest = after;
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Byte range (`{` index, `}` index) of the leftmost group with no braces
/// inside it.
fn innermost_group(text: &str) -> Option<(usize, usize)> {
    let mut open = None;
    for (idx, byte) in text.bytes().enumerate() {
        match byte {
            b'{' => open = Some(idx),
            b'}' => match open {
                Some(start) if idx > start + 1 => return Some((start, idx)),
                _ => open = None,
            },
            _ => {}
        }
    }
    None
}

fn has_empty_group(text: &str) -> bool {
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let inner_len = after.len() - after.trim_start().len();
        if after[inner_len..].starts_with('}') {
            return true;
        }
        rest = after;
    }
    false
}
