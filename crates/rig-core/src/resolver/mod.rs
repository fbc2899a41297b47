//! `${NAME}` / `${env:NAME}` token substitution for command templates (§4.3).
//!
//! Resolution order for both token forms is "map entry, then process
//! environment, then leave literal". The distinction between the two
//! forms is trust, not lookup order: a value that came from the
//! user-controlled variable map is shell-sanitised before substitution;
//! a value sourced from the process environment is trusted verbatim.
//! Sanitisation here is a mitigation, not a sandbox — the deploy adapter
//! ultimately runs commands via a shell.

use std::collections::BTreeMap;

/// Characters stripped outright from map-sourced values before
/// substitution, plus the LF -> space rule, per §4.3.
const STRIPPED_CHARS: &[char] = &['`', '$', '!', '&', '|', ';', '\r'];

/// Substitutes `${NAME}` and `${env:NAME}` tokens in `template` using
/// `vars` and the process environment.
pub struct VariableResolver;

impl VariableResolver {
    /// Resolve every token in `template`.
    ///
    /// - `${env:X}`: `vars` entry, else `std::env::var("X")`, else left
    ///   as the literal `${env:X}` text.
    /// - `${X}`: same lookup order. A value found in `vars` is
    ///   sanitised (see [`sanitize`]); a value found only in the process
    ///   environment is passed through untouched.
    pub fn resolve(template: &str, vars: &BTreeMap<String, String>) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find('}') else {
                // Unterminated token: emit the rest verbatim and stop.
                out.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let token_body = &after_open[..end];
            out.push_str(&Self::resolve_token(token_body, vars));
            rest = &after_open[end + 1..];
        }
        out.push_str(rest);
        out
    }

    fn resolve_token(body: &str, vars: &BTreeMap<String, String>) -> String {
        if let Some(name) = body.strip_prefix("env:") {
            if let Some(v) = vars.get(name) {
                return v.clone();
            }
            if let Ok(v) = std::env::var(name) {
                return v;
            }
            format!("${{env:{name}}}")
        } else {
            if let Some(v) = vars.get(body) {
                return sanitize(v);
            }
            if let Ok(v) = std::env::var(body) {
                return v;
            }
            format!("${{{body}}}")
        }
    }

    /// The deduplicated list of tokens (e.g. `${FOO}`, `${env:BAR}`) that
    /// would remain literal if `template` were resolved with `vars` right
    /// now, in first-seen order.
    pub fn unresolved_vars(template: &str, vars: &BTreeMap<String, String>) -> Vec<String> {
        let mut out = Vec::new();
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find('}') else {
                break;
            };
            let body = &after_open[..end];
            let name = body.strip_prefix("env:").unwrap_or(body);
            let resolved = vars.contains_key(name) || std::env::var(name).is_ok();
            if !resolved {
                let token = format!("${{{body}}}");
                if !out.contains(&token) {
                    out.push(token);
                }
            }
            rest = &after_open[end + 1..];
        }
        out
    }
}

/// Strip shell metacharacters from a user-controlled value (§4.3).
///
/// Removes backtick, `$`, `!`, `&`, `|`, `;`, and CR outright; replaces
/// LF with a single space. Not a shell parser — just the fixed
/// allow-list-adjacent filter the spec calls for.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|c| !STRIPPED_CHARS.contains(c))
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn resolves_plain_token_from_map() {
        let v = vars(&[("BRANCH_NAME", "rig/issue-1")]);
        assert_eq!(
            VariableResolver::resolve("deploy ${BRANCH_NAME}", &v),
            "deploy rig/issue-1"
        );
    }

    #[test]
    fn resolves_env_token_preferring_map_over_environment() {
        unsafe { std::env::set_var("RIG_TEST_ENV_TOKEN", "from-env") };
        let v = vars(&[("RIG_TEST_ENV_TOKEN", "from-map")]);
        assert_eq!(
            VariableResolver::resolve("${env:RIG_TEST_ENV_TOKEN}", &v),
            "from-map"
        );
        unsafe { std::env::remove_var("RIG_TEST_ENV_TOKEN") };
    }

    #[test]
    fn env_token_falls_back_to_process_environment() {
        unsafe { std::env::set_var("RIG_TEST_ENV_FALLBACK", "from-process-env") };
        let v: BTreeMap<String, String> = BTreeMap::new();
        assert_eq!(
            VariableResolver::resolve("${env:RIG_TEST_ENV_FALLBACK}", &v),
            "from-process-env"
        );
        unsafe { std::env::remove_var("RIG_TEST_ENV_FALLBACK") };
    }

    #[test]
    fn unresolved_token_left_literal() {
        let v: BTreeMap<String, String> = BTreeMap::new();
        assert_eq!(
            VariableResolver::resolve("${TOTALLY_UNKNOWN_VAR}", &v),
            "${TOTALLY_UNKNOWN_VAR}"
        );
    }

    #[test]
    fn map_sourced_value_is_sanitized() {
        let v = vars(&[("TITLE", "fix `rm -rf /`; $(evil) & bad|thing\nmore")]);
        let resolved = VariableResolver::resolve("${TITLE}", &v);
        assert!(!resolved.contains('`'));
        assert!(!resolved.contains('$'));
        assert!(!resolved.contains(';'));
        assert!(!resolved.contains('&'));
        assert!(!resolved.contains('|'));
        assert!(!resolved.contains('\n'));
        assert!(resolved.contains(' '), "LF should become a space");
    }

    #[test]
    fn env_sourced_value_passes_through_verbatim() {
        unsafe { std::env::set_var("RIG_TEST_UNSAFE_ENV", "has`backtick") };
        let v: BTreeMap<String, String> = BTreeMap::new();
        let resolved = VariableResolver::resolve("${env:RIG_TEST_UNSAFE_ENV}", &v);
        assert_eq!(resolved, "has`backtick");
        unsafe { std::env::remove_var("RIG_TEST_UNSAFE_ENV") };
    }

    #[test]
    fn unresolved_vars_lists_deduplicated_tokens() {
        let v: BTreeMap<String, String> = BTreeMap::new();
        let unresolved =
            VariableResolver::unresolved_vars("${A} and ${B} and ${A} again", &v);
        assert_eq!(unresolved, vec!["${A}".to_string(), "${B}".to_string()]);
    }

    #[test]
    fn resolve_is_idempotent_when_no_new_tokens_introduced() {
        let v = vars(&[("BRANCH_NAME", "rig/issue-1")]);
        let once = VariableResolver::resolve("${BRANCH_NAME}", &v);
        let twice = VariableResolver::resolve(&once, &v);
        assert_eq!(once, twice);
    }
}
