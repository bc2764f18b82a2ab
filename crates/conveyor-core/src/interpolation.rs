use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;

static VARIABLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .unwrap_or_else(|e| panic!("invalid variable pattern: {e}"))
});

/// Variables visible to a job, in resolution order.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Resolved variables, later layers already applied.
    pub variables: HashMap<String, String>,
    /// Values to hide in captured logs.
    pub masked: Vec<String>,
}

impl InterpolationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variables(variables: HashMap<String, String>) -> Self {
        Self {
            variables,
            masked: Vec::new(),
        }
    }

    /// Layer `vars` on top of the current variables.
    pub fn layer(&mut self, vars: &HashMap<String, String>) {
        for (key, value) in vars {
            self.variables.insert(key.clone(), value.clone());
        }
    }

    /// Expand `$VAR` and `${VAR}` references.
    ///
    /// Unknown variables expand to the empty string. `$$` is an escaped `$`.
    pub fn interpolate(&self, input: &str) -> String {
        if !input.contains('$') {
            return input.to_string();
        }

        // Protect escaped dollars before expansion.
        let escaped = input.replace("$$", "\u{0}");
        let expanded = VARIABLE_RE.replace_all(&escaped, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map_or("", |m| m.as_str());
            self.variables.get(name).cloned().unwrap_or_default()
        });
        expanded.replace('\u{0}', "$")
    }

    /// Interpolate every value of a map against this context.
    pub fn interpolate_map(&self, vars: &HashMap<String, String>) -> HashMap<String, String> {
        vars.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Replace masked values in `input` with `[MASKED]`.
    pub fn mask(&self, input: &str) -> String {
        let mut output = input.to_string();
        for value in &self.masked {
            if value.len() >= 4 {
                output = output.replace(value, "[MASKED]");
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> InterpolationContext {
        let mut vars = HashMap::new();
        vars.insert("CI_COMMIT_REF_SLUG".to_string(), "feature-x".to_string());
        vars.insert("TARGET_ENV".to_string(), "dev".to_string());
        InterpolationContext::with_variables(vars)
    }

    #[test]
    fn test_both_forms() {
        let ctx = ctx();
        assert_eq!(ctx.interpolate("$TARGET_ENV/$CI_COMMIT_REF_SLUG"), "dev/feature-x");
        assert_eq!(ctx.interpolate("${TARGET_ENV}-app"), "dev-app");
    }

    #[test]
    fn test_unknown_and_escaped() {
        let ctx = ctx();
        assert_eq!(ctx.interpolate("a${MISSING}b"), "ab");
        assert_eq!(ctx.interpolate("cost: $$5"), "cost: $5");
        assert_eq!(ctx.interpolate("no vars"), "no vars");
    }

    #[test]
    fn test_mask() {
        let mut ctx = ctx();
        ctx.masked.push("s3cr3t-token".to_string());
        assert_eq!(ctx.mask("auth s3cr3t-token ok"), "auth [MASKED] ok");
    }
}
