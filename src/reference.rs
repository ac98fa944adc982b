//! Matching installed mods against partially specified references.
//!
//! A reference may carry any subset of identifying fields (id, archive hash,
//! repository ids, logical name, file name expression, tag) plus qualifiers
//! (version range, game, installer choices, patches). Absent fields are not
//! checked, and a reference with no identifying field never matches anything.

use crate::library::{ModEntry, ModReference};
use regex::Regex;
use semver::{Version, VersionReq};
use std::sync::OnceLock;

const PREFER_SUFFIX: &str = "+prefer";

const ARCHIVE_EXTENSIONS: &[&str] = &[
    "zip", "7z", "rar", "tar", "gz", "tgz", "bz2", "xz", "fomod", "omod",
];

pub fn matches(mod_entry: &ModEntry, reference: &ModReference) -> bool {
    if !reference.has_identifier() {
        return false;
    }

    if let Some(id) = &reference.id {
        if *id != mod_entry.id {
            return false;
        }
        if reference.is_id_only() {
            return true;
        }
    }

    let attrs = &mod_entry.attributes;

    if let Some(md5) = &reference.file_md5 {
        return attrs.file_md5.as_deref() == Some(md5.as_str());
    }

    if let Some(repo) = &reference.repo {
        if attrs.repository.as_deref() != Some(repo.repository.as_str())
            || attrs.repo_mod_id.as_deref() != Some(repo.mod_id.as_str())
        {
            return false;
        }
        if let Some(file_id) = &repo.file_id {
            let fuzzy = reference
                .version_match
                .as_deref()
                .map(is_fuzzy_version)
                .unwrap_or(false);
            if attrs.repo_file_id.as_deref() != Some(file_id.as_str()) && !fuzzy {
                return false;
            }
        }
    }

    if let Some(logical) = &reference.logical_file_name {
        let known = attrs.logical_file_name.as_deref() == Some(logical.as_str())
            || attrs.additional_logical_file_names.iter().any(|name| name == logical)
            || attrs.custom_file_name.as_deref() == Some(logical.as_str());
        if !known {
            return false;
        }
    }

    if let Some(expression) = &reference.file_expression {
        let name = match attrs.file_name.as_deref() {
            Some(file_name) => sanitize_expression(file_name),
            None => mod_entry.display_name(),
        };
        if name != *expression && !glob_matches(expression, &name) {
            return false;
        }
    }

    if let Some(version_match) = &reference.version_match {
        let version = attrs.version.as_deref().unwrap_or("");
        if version_match != "*" && !version.is_empty() && !version_satisfies(version, version_match)
        {
            return false;
        }
    }

    if let Some(game_id) = &reference.game_id {
        if !attrs.game_ids.iter().any(|id| id == game_id) {
            return false;
        }
    }

    if let Some(tag) = &reference.tag {
        if attrs.reference_tag.as_deref() == Some(tag.as_str()) {
            return true;
        }
        if !reference.has_identifier_besides_tag() {
            return false;
        }
    }

    if let Some(choices) = &reference.installer_choices {
        if attrs.installer_choices.as_ref() != Some(choices) {
            return false;
        }
    }

    if let Some(patches) = &reference.patches {
        if attrs.patches.as_ref() != Some(patches) {
            return false;
        }
    }

    true
}

/// Variant of [`matches`] for lookups where either side may be missing.
pub fn matches_optional(mod_entry: Option<&ModEntry>, reference: Option<&ModReference>) -> bool {
    match (mod_entry, reference) {
        (Some(mod_entry), Some(reference)) => matches(mod_entry, reference),
        _ => false,
    }
}

pub fn find_matching_mods<'a>(mods: &'a [ModEntry], reference: &ModReference) -> Vec<&'a ModEntry> {
    mods.iter().filter(|m| matches(m, reference)).collect()
}

/// Picks one mod for a reference. A `+prefer` version picks the mod carrying
/// exactly that version when installed; otherwise the newest match wins.
pub fn find_best_match<'a>(mods: &'a [ModEntry], reference: &ModReference) -> Option<&'a ModEntry> {
    let candidates = find_matching_mods(mods, reference);
    let preferred = reference
        .version_match
        .as_deref()
        .and_then(|v| v.strip_suffix(PREFER_SUFFIX));
    if let Some(preferred) = preferred {
        if let Some(exact) = candidates
            .iter()
            .find(|m| m.attributes.version.as_deref() == Some(preferred))
        {
            return Some(exact);
        }
    }

    candidates
        .into_iter()
        .max_by(|a, b| parsed_version(a).cmp(&parsed_version(b)))
}

fn parsed_version(mod_entry: &ModEntry) -> Option<Version> {
    mod_entry
        .attributes
        .version
        .as_deref()
        .and_then(coerce_to_semver)
        .and_then(|v| Version::parse(&v).ok())
}

pub fn is_fuzzy_version(version: &str) -> bool {
    let version = version.trim();
    if version.is_empty() {
        return false;
    }
    if version == "*" || version.ends_with(PREFER_SUFFIX) {
        return true;
    }
    if x_range_regex().map(|re| re.is_match(version)).unwrap_or(false) {
        return true;
    }
    if Version::parse(strip_v(version)).is_ok() {
        return false;
    }
    parse_range(version).is_some()
}

pub fn sanitize_expression(file_name: &str) -> String {
    let mut stem = file_name;
    while let Some((head, ext)) = stem.rsplit_once('.') {
        if head.is_empty() || !ARCHIVE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            break;
        }
        stem = head;
    }

    let Some(re) = duplicate_marker_regex() else {
        return stem.to_string();
    };
    let stripped = re.dot_counter.replace(stem, "");
    re.paren_counter.replace(&stripped, "").into_owned()
}

/// Normalizes loose version strings into semantic-version form.
pub fn coerce_to_semver(version: &str) -> Option<String> {
    let patterns = semver_patterns()?;
    let version = version.trim();

    if let Some(caps) = patterns.triplet.captures(version) {
        let mut result = format!("{}.{}.{}", &caps[1], &caps[2], &caps[3]);
        if let Some(pre) = caps.get(4) {
            result.push('-');
            result.push_str(pre.as_str());
        }
        return Some(result);
    }

    if let Some(caps) = patterns.partial.captures(version) {
        let major: u64 = caps[1].parse().ok()?;
        let minor: u64 = match caps.get(2) {
            Some(minor) => minor.as_str().parse().ok()?,
            None => 0,
        };
        return Some(format!("{major}.{minor}.0"));
    }

    let caps = patterns.numeric_run.captures(version)?;
    let field = |idx: usize| -> Option<u64> {
        match caps.get(idx) {
            Some(value) => value.as_str().parse().ok(),
            None => Some(0),
        }
    };
    Some(format!("{}.{}.{}", field(1)?, field(2)?, field(3)?))
}

fn version_satisfies(version: &str, version_match: &str) -> bool {
    // The preference only matters when picking among candidates.
    let version_match = version_match
        .strip_suffix(PREFER_SUFFIX)
        .unwrap_or(version_match);
    if version == version_match {
        return true;
    }

    let Some(parsed) = coerce_to_semver(version).and_then(|v| Version::parse(&v).ok()) else {
        return false;
    };
    match parse_range(version_match) {
        Some(alternatives) => alternatives.iter().any(|req| req.matches(&parsed)),
        None => false,
    }
}

/// Translates an npm-style range (`||` alternatives, whitespace-joined
/// comparators, hyphen ranges, bare exact versions) into requirement sets.
fn parse_range(expression: &str) -> Option<Vec<VersionReq>> {
    let mut alternatives = Vec::new();
    for alternative in expression.split("||") {
        let alternative = alternative.trim();
        if alternative.is_empty() {
            alternatives.push(VersionReq::STAR);
            continue;
        }

        let comparators = match alternative.split_once(" - ") {
            Some((low, high)) => vec![
                format!(">={}", strip_v(low.trim())),
                format!("<={}", strip_v(high.trim())),
            ],
            None => range_comparators(alternative),
        };
        if comparators.is_empty() {
            return None;
        }
        let req = VersionReq::parse(&comparators.join(", ")).ok()?;
        alternatives.push(req);
    }
    Some(alternatives)
}

fn range_comparators(alternative: &str) -> Vec<String> {
    let mut comparators = Vec::new();
    let mut pending_op = String::new();
    for token in alternative.split_whitespace() {
        if token.chars().all(|ch| matches!(ch, '<' | '>' | '=' | '~' | '^')) {
            pending_op.push_str(token);
            continue;
        }
        let token = format!("{}{}", std::mem::take(&mut pending_op), token);
        let op_len = token
            .chars()
            .take_while(|ch| matches!(ch, '<' | '>' | '=' | '~' | '^'))
            .count();
        let (op, rest) = token.split_at(op_len);
        let rest = strip_v(rest);
        let is_wildcard = rest
            .split('.')
            .any(|part| matches!(part, "x" | "X" | "*"));
        let comparator = if !op.is_empty() {
            format!("{op}{rest}")
        } else if is_wildcard {
            rest.to_string()
        } else {
            format!("={rest}")
        };
        comparators.push(comparator);
    }
    comparators
}

fn strip_v(version: &str) -> &str {
    version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version)
}

fn glob_matches(expression: &str, name: &str) -> bool {
    glob::Pattern::new(expression)
        .map(|pattern| pattern.matches(name))
        .unwrap_or(false)
}

fn x_range_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(^|\.)[xX*](\.|$)").ok()).as_ref()
}

struct DuplicateMarkers {
    dot_counter: Regex,
    paren_counter: Regex,
}

fn duplicate_marker_regex() -> Option<&'static DuplicateMarkers> {
    static RE: OnceLock<Option<DuplicateMarkers>> = OnceLock::new();
    RE.get_or_init(|| {
        Some(DuplicateMarkers {
            dot_counter: Regex::new(r"\.\d+$").ok()?,
            paren_counter: Regex::new(r" \(\d+\)$").ok()?,
        })
    })
    .as_ref()
}

struct SemverPatterns {
    triplet: Regex,
    partial: Regex,
    numeric_run: Regex,
}

fn semver_patterns() -> Option<&'static SemverPatterns> {
    static RE: OnceLock<Option<SemverPatterns>> = OnceLock::new();
    RE.get_or_init(|| {
        Some(SemverPatterns {
            triplet: Regex::new(r"^[vV]?(\d+)\.(\d+)\.(\d+)(?:[-.+](.+))?$").ok()?,
            partial: Regex::new(r"^[vV]?(\d+)(?:\.(\d+))?$").ok()?,
            numeric_run: Regex::new(r"(\d+)(?:\.(\d+))?(?:\.(\d+))?").ok()?,
        })
    })
    .as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::RepoReference;
    use serde_json::json;

    fn sample_mod() -> ModEntry {
        let mut entry = ModEntry::new("skyui-1234");
        let attrs = &mut entry.attributes;
        attrs.name = Some("SkyUI".to_string());
        attrs.file_md5 = Some("d41d8cd98f00b204e9800998ecf8427e".to_string());
        attrs.file_name = Some("SkyUI_5_2-3863-5-2 (2).7z".to_string());
        attrs.logical_file_name = Some("SkyUI".to_string());
        attrs.additional_logical_file_names = vec!["SkyUI SE".to_string()];
        attrs.version = Some("5.2.0".to_string());
        attrs.repository = Some("nexus".to_string());
        attrs.repo_mod_id = Some("3863".to_string());
        attrs.repo_file_id = Some("1000".to_string());
        attrs.game_ids = vec!["skyrimse".to_string()];
        attrs.reference_tag = Some("tag-abc".to_string());
        entry
    }

    #[test]
    fn empty_reference_never_matches() {
        assert!(!matches(&sample_mod(), &ModReference::default()));
        assert!(!matches(&ModEntry::new("x"), &ModReference::default()));
    }

    #[test]
    fn absent_sides_never_match() {
        let reference = ModReference::by_id("skyui-1234");
        assert!(!matches_optional(None, Some(&reference)));
        assert!(!matches_optional(Some(&sample_mod()), None));
        assert!(matches_optional(Some(&sample_mod()), Some(&reference)));
    }

    #[test]
    fn id_only_reference_ignores_everything_else() {
        let mut stripped = ModEntry::new("skyui-1234");
        stripped.attributes = Default::default();
        assert!(matches(&stripped, &ModReference::by_id("skyui-1234")));
        assert!(matches(&sample_mod(), &ModReference::by_id("skyui-1234")));
        assert!(!matches(&sample_mod(), &ModReference::by_id("other")));
    }

    #[test]
    fn md5_decides_the_match() {
        let mut reference = ModReference {
            file_md5: Some("d41d8cd98f00b204e9800998ecf8427e".to_string()),
            logical_file_name: Some("does not matter".to_string()),
            ..Default::default()
        };
        assert!(matches(&sample_mod(), &reference));
        reference.file_md5 = Some("ffff".to_string());
        assert!(!matches(&sample_mod(), &reference));
    }

    #[test]
    fn repo_file_id_tolerated_for_fuzzy_versions() {
        let mut reference = ModReference {
            repo: Some(RepoReference {
                repository: "nexus".to_string(),
                mod_id: "3863".to_string(),
                file_id: Some("999".to_string()),
            }),
            ..Default::default()
        };
        assert!(!matches(&sample_mod(), &reference));

        reference.version_match = Some(">=5.0.0".to_string());
        assert!(matches(&sample_mod(), &reference));

        reference.repo.as_mut().unwrap().mod_id = "1".to_string();
        assert!(!matches(&sample_mod(), &reference));
    }

    #[test]
    fn logical_name_accepts_alternates_and_custom_name() {
        let mut entry = sample_mod();
        let mut reference = ModReference {
            logical_file_name: Some("SkyUI SE".to_string()),
            ..Default::default()
        };
        assert!(matches(&entry, &reference));

        entry.attributes.custom_file_name = Some("My UI".to_string());
        reference.logical_file_name = Some("My UI".to_string());
        assert!(matches(&entry, &reference));

        reference.logical_file_name = Some("SkyUI Legacy".to_string());
        assert!(!matches(&entry, &reference));
    }

    #[test]
    fn file_expression_uses_sanitized_file_name_and_globs() {
        let mut reference = ModReference {
            file_expression: Some("SkyUI_5_2-3863-5-2".to_string()),
            ..Default::default()
        };
        assert!(matches(&sample_mod(), &reference));

        reference.file_expression = Some("SkyUI_*".to_string());
        assert!(matches(&sample_mod(), &reference));

        reference.file_expression = Some("Other_*".to_string());
        assert!(!matches(&sample_mod(), &reference));
    }

    #[test]
    fn file_expression_falls_back_to_display_name() {
        let mut entry = sample_mod();
        entry.attributes.file_name = None;
        let reference = ModReference {
            file_expression: Some("SkyUI".to_string()),
            ..Default::default()
        };
        assert!(matches(&entry, &reference));
    }

    #[test]
    fn version_ranges_and_exact_strings() {
        let mut reference = ModReference {
            logical_file_name: Some("SkyUI".to_string()),
            version_match: Some("^5.0.0".to_string()),
            ..Default::default()
        };
        assert!(matches(&sample_mod(), &reference));

        reference.version_match = Some(">=6.0.0".to_string());
        assert!(!matches(&sample_mod(), &reference));

        reference.version_match = Some("5.x".to_string());
        assert!(matches(&sample_mod(), &reference));

        reference.version_match = Some("5.2.0+prefer".to_string());
        assert!(matches(&sample_mod(), &reference));

        reference.version_match = Some("*".to_string());
        assert!(matches(&sample_mod(), &reference));

        let mut older = sample_mod();
        older.attributes.version = Some("0.5.0".to_string());
        reference.version_match = Some(">=1.0.0+prefer".to_string());
        assert!(!matches(&older, &reference));
        assert!(matches(&sample_mod(), &reference));

        let mut odd = sample_mod();
        odd.attributes.version = Some("beta-build".to_string());
        reference.version_match = Some("beta-build".to_string());
        assert!(matches(&odd, &reference));
        reference.version_match = Some("^1.0.0".to_string());
        assert!(!matches(&odd, &reference));
    }

    #[test]
    fn version_without_mod_version_is_not_checked() {
        let mut entry = sample_mod();
        entry.attributes.version = None;
        let reference = ModReference {
            logical_file_name: Some("SkyUI".to_string()),
            version_match: Some(">=9.0.0".to_string()),
            ..Default::default()
        };
        assert!(matches(&entry, &reference));
    }

    #[test]
    fn game_id_must_be_supported() {
        let mut reference = ModReference {
            logical_file_name: Some("SkyUI".to_string()),
            game_id: Some("skyrimse".to_string()),
            ..Default::default()
        };
        assert!(matches(&sample_mod(), &reference));
        reference.game_id = Some("fallout4".to_string());
        assert!(!matches(&sample_mod(), &reference));
    }

    #[test]
    fn tag_match_short_circuits_and_mismatch_falls_through() {
        let mut reference = ModReference {
            tag: Some("tag-abc".to_string()),
            installer_choices: Some(json!({"type": "fomod"})),
            ..Default::default()
        };
        assert!(matches(&sample_mod(), &reference));

        reference.tag = Some("tag-other".to_string());
        assert!(!matches(&sample_mod(), &reference));

        reference.installer_choices = None;
        reference.logical_file_name = Some("SkyUI".to_string());
        assert!(matches(&sample_mod(), &reference));
    }

    #[test]
    fn installer_choices_and_patches_compare_deeply() {
        let mut entry = sample_mod();
        entry.attributes.installer_choices = Some(json!({"options": [{"name": "A"}]}));
        entry.attributes.patches = Some(json!({"file.esp": "sha"}));
        let mut reference = ModReference {
            logical_file_name: Some("SkyUI".to_string()),
            installer_choices: Some(json!({"options": [{"name": "A"}]})),
            patches: Some(json!({"file.esp": "sha"})),
            ..Default::default()
        };
        assert!(matches(&entry, &reference));
        reference.patches = Some(json!({"file.esp": "other"}));
        assert!(!matches(&entry, &reference));
    }

    #[test]
    fn fuzzy_versions() {
        assert!(is_fuzzy_version("*"));
        assert!(is_fuzzy_version("1.0.0+prefer"));
        assert!(is_fuzzy_version("1.x"));
        assert!(is_fuzzy_version("1.2.x"));
        assert!(is_fuzzy_version(">=1.0.0"));
        assert!(is_fuzzy_version("^2.1.0"));
        assert!(is_fuzzy_version("1.0.0 - 2.0.0"));
        assert!(!is_fuzzy_version("1.0.0"));
        assert!(!is_fuzzy_version("v1.0.0"));
        assert!(!is_fuzzy_version(""));
        assert!(!is_fuzzy_version("not-a-version"));
    }

    #[test]
    fn sanitize_strips_extension_and_duplicate_markers() {
        assert_eq!(sanitize_expression("mod (15).rar"), "mod");
        assert_eq!(sanitize_expression("mod.1.zip"), "mod");
        assert_eq!(sanitize_expression("mod.tar.gz"), "mod");
        assert_eq!(sanitize_expression("plain"), "plain");
        assert_eq!(sanitize_expression(""), "");
    }

    #[test]
    fn coerce_versions() {
        assert_eq!(coerce_to_semver("1.2").as_deref(), Some("1.2.0"));
        assert_eq!(coerce_to_semver("5").as_deref(), Some("5.0.0"));
        assert_eq!(coerce_to_semver("v1.2.3").as_deref(), Some("1.2.3"));
        assert_eq!(coerce_to_semver("1.2.3.4").as_deref(), Some("1.2.3-4"));
        assert_eq!(coerce_to_semver("1.2.3+beta").as_deref(), Some("1.2.3-beta"));
        assert_eq!(coerce_to_semver("version 2.4 final").as_deref(), Some("2.4.0"));
        assert_eq!(coerce_to_semver("not-a-version"), None);
    }

    #[test]
    fn coerce_leading_zero_asymmetry() {
        assert_eq!(coerce_to_semver("01.02.03").as_deref(), Some("01.02.03"));
        assert_eq!(coerce_to_semver("01.2").as_deref(), Some("1.2.0"));
    }

    #[test]
    fn best_match_prefers_exact_preferred_version() {
        let mut old = sample_mod();
        old.id = "old".to_string();
        old.attributes.version = Some("5.1.0".to_string());
        let mut new = sample_mod();
        new.id = "new".to_string();
        new.attributes.version = Some("5.3.0".to_string());
        let mods = vec![old, new];

        let mut reference = ModReference {
            logical_file_name: Some("SkyUI".to_string()),
            version_match: Some("5.1.0+prefer".to_string()),
            ..Default::default()
        };
        assert_eq!(find_best_match(&mods, &reference).map(|m| m.id.as_str()), Some("old"));

        reference.version_match = Some(">=5.0.0+prefer".to_string());
        assert_eq!(find_best_match(&mods, &reference).map(|m| m.id.as_str()), Some("new"));

        reference.version_match = Some("4.0.0+prefer".to_string());
        assert!(find_best_match(&mods, &reference).is_none());

        reference.version_match = Some(">=5.0.0".to_string());
        assert_eq!(find_best_match(&mods, &reference).map(|m| m.id.as_str()), Some("new"));
    }
}
