//! Name-pattern rendering, extraction, and slug derivation.
//!
//! Resource names are derived from templates containing a `{base_name}`
//! placeholder. Rendering substitutes the placeholder; extraction recovers
//! the base name from an observed resource name, which is how entities are
//! discovered from downstream state.

use std::sync::LazyLock;

use regex::Regex;

/// Placeholder every templated pattern contains exactly once.
pub const PLACEHOLDER: &str = "{base_name}";

/// Fallback for inputs whose slug collapses to nothing.
const EMPTY_SLUG_FALLBACK: &str = "default-channel-name";

/// Channel slugs are capped by the chat platform.
const MAX_SLUG_LEN: usize = 64;

static WS_OR_UNDERSCORE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\s_]+").unwrap());
static NON_SLUG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9-]+").unwrap());
static HYPHEN_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-+").unwrap());

/// Substitute `{base_name}` into a pattern. A pattern without the
/// placeholder is a fixed name and renders to itself.
pub fn render(pattern: &str, base_name: &str) -> String {
    pattern.replace(PLACEHOLDER, base_name)
}

/// Recover the base name from an observed resource name.
///
/// The pattern is split at the placeholder into a prefix and suffix; the
/// observed name must carry both, with enough room between them. The
/// extracted base name may be empty, which is a valid match. Returns `None`
/// when the name does not match or the pattern has no placeholder.
pub fn extract(actual_name: &str, pattern: &str) -> Option<String> {
    let (prefix, suffix) = pattern.split_once(PLACEHOLDER)?;
    if !actual_name.starts_with(prefix) || !actual_name.ends_with(suffix) {
        return None;
    }
    if actual_name.len() < prefix.len() + suffix.len() {
        return None;
    }
    Some(actual_name[prefix.len()..actual_name.len() - suffix.len()].to_string())
}

/// Derive the URL-safe slug the chat platform uses for a channel name.
///
/// Lowercases, converts whitespace/underscore runs and any remaining
/// non-alphanumerics to hyphens, collapses repeats, trims, and truncates to
/// the platform limit.
pub fn slugify(text: &str) -> String {
    let lowered = text.to_lowercase();
    let hyphenated = WS_OR_UNDERSCORE.replace_all(&lowered, "-");
    let cleaned = NON_SLUG.replace_all(&hyphenated, "-");
    let collapsed = HYPHEN_RUN.replace_all(&cleaned, "-");
    let mut slug: String = collapsed.trim_matches('-').to_string();

    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        slug = slug.trim_matches('-').to_string();
    }

    if slug.is_empty() {
        return EMPTY_SLUG_FALLBACK.to_string();
    }
    slug
}

/// Whether a channel-name pattern survives slugification unchanged (modulo
/// case), meaning the channel slug itself can be matched against it.
pub fn pattern_is_slug_safe(pattern: &str) -> bool {
    let probe = render(pattern, "probe-slug");
    slugify(&probe) == probe.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_placeholder() {
        assert_eq!(render("Project {base_name}", "Orion"), "Project Orion");
        assert_eq!(render("fixed-name", "Orion"), "fixed-name");
    }

    #[test]
    fn extract_round_trips_render() {
        for pattern in ["{base_name}", "proj_{base_name}", "{base_name} Admin", "a{base_name}b"] {
            for base in ["Orion", "x", "", "Deep Space 9"] {
                let rendered = render(pattern, base);
                assert_eq!(
                    extract(&rendered, pattern).as_deref(),
                    Some(base),
                    "pattern {pattern:?} base {base:?}"
                );
            }
        }
    }

    #[test]
    fn extract_accepts_empty_base_name() {
        assert_eq!(extract("proj_", "proj_{base_name}").as_deref(), Some(""));
    }

    #[test]
    fn extract_rejects_mismatched_names() {
        assert_eq!(extract("other_Orion", "proj_{base_name}"), None);
        assert_eq!(extract("proj", "proj_{base_name}"), None);
        assert_eq!(extract("pr", "proj_{base_name}_admin"), None);
    }

    #[test]
    fn extract_rejects_pattern_without_placeholder() {
        assert_eq!(extract("anything", "anything"), None);
    }

    #[test]
    fn extract_handles_overlapping_prefix_suffix() {
        // "prefix_admin" against "prefix_{base_name}_admin": too short to
        // carry both delimiters around a base name.
        assert_eq!(extract("prefix_admin", "prefix_{base_name}_admin"), None);
        assert_eq!(
            extract("prefix__admin", "prefix_{base_name}_admin").as_deref(),
            Some("")
        );
    }

    #[test]
    fn slugify_normalizes_names() {
        assert_eq!(slugify("Project Orion"), "project-orion");
        assert_eq!(slugify("Deep__Space   9"), "deep-space-9");
        assert_eq!(slugify("Café & Crème"), "caf-cr-me");
        assert_eq!(slugify("--already--slugged--"), "already-slugged");
    }

    #[test]
    fn slugify_truncates_to_platform_limit() {
        let long = "x".repeat(100);
        assert_eq!(slugify(&long).len(), 64);
    }

    #[test]
    fn slugify_falls_back_when_nothing_survives(){
        assert_eq!(slugify("!!!"), "default-channel-name");
        assert_eq!(slugify(""), "default-channel-name");
    }

    #[test]
    fn slug_safety_check_distinguishes_pattern_shapes() {
        assert!(pattern_is_slug_safe("proj-{base_name}"));
        assert!(pattern_is_slug_safe("{base_name}"));
        assert!(!pattern_is_slug_safe("Project {base_name}"));
        assert!(!pattern_is_slug_safe("proj_{base_name}"));
    }
}
