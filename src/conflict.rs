//! Conflict detection and deduplication over priority-ordered reference
//! lists.
//!
//! List position is priority: lower index wins. Conflict detection is
//! advisory (logged at startup); deduplication is what actually shapes the
//! exposed catalogs.

use rmcp::model::{Prompt, Resource, Tool};

use crate::config::{PromptRef, ResourceRef};
use crate::uri_template;

/// How two resource refs collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceConflictKind {
    /// Both refs carry the same exact URI.
    ExactDuplicate,
    /// The higher-priority ref is a template that matches the lower exact URI.
    TemplateCoversExact,
    /// The higher-priority ref is exact and matched by the lower template.
    ExactCoveredByTemplate,
    /// Two templates whose static skeletons may overlap.
    TemplateOverlap,
}

/// One detected resource conflict between a pair of refs.
#[derive(Debug, Clone)]
pub struct ResourceConflict {
    pub kind: ResourceConflictKind,
    pub first_index: usize,
    pub second_index: usize,
    pub first: ResourceRef,
    pub second: ResourceRef,
    /// A URI both refs could serve, for log messages.
    pub example_uri: String,
}

/// One detected prompt-name conflict between a pair of refs.
#[derive(Debug, Clone)]
pub struct PromptConflict {
    pub name: String,
    pub first_index: usize,
    pub second_index: usize,
    pub first: PromptRef,
    pub second: PromptRef,
}

/// Detect conflicts between every ordered pair of resource refs.
///
/// At most one conflict record is produced per pair `(i, j)` with `i < j`.
/// The input list is not mutated.
pub fn detect_resource_conflicts(refs: &[ResourceRef]) -> Vec<ResourceConflict> {
    let mut conflicts = Vec::new();
    for (i, first) in refs.iter().enumerate() {
        for (j, second) in refs.iter().enumerate().skip(i + 1) {
            let first_is_template = uri_template::is_template(&first.uri);
            let second_is_template = uri_template::is_template(&second.uri);

            let kind = match (first_is_template, second_is_template) {
                (false, false) if first.uri == second.uri => {
                    Some(ResourceConflictKind::ExactDuplicate)
                }
                (true, false) if uri_template::match_uri(&second.uri, &first.uri).is_some() => {
                    Some(ResourceConflictKind::TemplateCoversExact)
                }
                (false, true) if uri_template::match_uri(&first.uri, &second.uri).is_some() => {
                    Some(ResourceConflictKind::ExactCoveredByTemplate)
                }
                (true, true) if uri_template::templates_can_overlap(&first.uri, &second.uri) => {
                    Some(ResourceConflictKind::TemplateOverlap)
                }
                _ => None,
            };

            if let Some(kind) = kind {
                let example_uri = match kind {
                    ResourceConflictKind::ExactDuplicate
                    | ResourceConflictKind::ExactCoveredByTemplate => first.uri.clone(),
                    ResourceConflictKind::TemplateCoversExact => second.uri.clone(),
                    ResourceConflictKind::TemplateOverlap => {
                        uri_template::generate_example_uri(&first.uri)
                    }
                };
                conflicts.push(ResourceConflict {
                    kind,
                    first_index: i,
                    second_index: j,
                    first: first.clone(),
                    second: second.clone(),
                    example_uri,
                });
            }
        }
    }
    conflicts
}

/// Detect duplicate prompt names: one conflict per unordered pair within each
/// group of refs sharing a name.
pub fn detect_prompt_conflicts(refs: &[PromptRef]) -> Vec<PromptConflict> {
    let mut conflicts = Vec::new();
    for (i, first) in refs.iter().enumerate() {
        for (j, second) in refs.iter().enumerate().skip(i + 1) {
            if first.name == second.name {
                conflicts.push(PromptConflict {
                    name: first.name.clone(),
                    first_index: i,
                    second_index: j,
                    first: first.clone(),
                    second: second.clone(),
                });
            }
        }
    }
    conflicts
}

/// Every ref whose URI (exact or template) matches the runtime `uri`, in
/// list order.
pub fn find_matching_resource_refs<'a>(uri: &str, refs: &'a [ResourceRef]) -> Vec<&'a ResourceRef> {
    refs.iter()
        .filter(|r| uri_template::match_uri(uri, &r.uri).is_some())
        .collect()
}

/// Every ref with a name equal to the runtime `name` (case-sensitive), in
/// list order.
pub fn find_matching_prompt_refs<'a>(name: &str, refs: &'a [PromptRef]) -> Vec<&'a PromptRef> {
    refs.iter().filter(|r| r.name == name).collect()
}

/// Keep the first occurrence of each key, preserving order.
fn dedup_by_key<T, K: std::hash::Hash + Eq>(items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|item| seen.insert(key(item))).collect()
}

/// Deduplicate resources by URI, first occurrence wins. Stable.
pub fn deduplicate_resources(resources: Vec<Resource>) -> Vec<Resource> {
    dedup_by_key(resources, |r| r.raw.uri.clone())
}

/// Deduplicate prompts by name, first occurrence wins. Stable.
pub fn deduplicate_prompts(prompts: Vec<Prompt>) -> Vec<Prompt> {
    dedup_by_key(prompts, |p| p.name.clone())
}

/// Deduplicate tools by name, first occurrence wins. Stable.
pub fn deduplicate_tools(tools: Vec<Tool>) -> Vec<Tool> {
    dedup_by_key(tools, |t| t.name.to_string())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    fn rref(server: &str, uri: &str) -> ResourceRef {
        ResourceRef {
            server_name: server.to_string(),
            uri: uri.to_string(),
        }
    }

    fn pref(server: &str, name: &str) -> PromptRef {
        PromptRef {
            server_name: server.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_exact_duplicate_conflict() {
        let refs = vec![rref("a", "file:///etc/hosts"), rref("b", "file:///etc/hosts")];
        let conflicts = detect_resource_conflicts(&refs);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ResourceConflictKind::ExactDuplicate);
        assert_eq!(conflicts[0].first_index, 0);
        assert_eq!(conflicts[0].second_index, 1);
        assert_eq!(conflicts[0].example_uri, "file:///etc/hosts");
    }

    #[test]
    fn test_template_covers_exact_conflict() {
        let refs = vec![rref("a", "file:///{+path}"), rref("b", "file:///etc/hosts")];
        let conflicts = detect_resource_conflicts(&refs);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ResourceConflictKind::TemplateCoversExact);
        assert_eq!(conflicts[0].example_uri, "file:///etc/hosts");
    }

    #[test]
    fn test_exact_covered_by_template_conflict() {
        let refs = vec![rref("a", "file:///etc/hosts"), rref("b", "file:///{+path}")];
        let conflicts = detect_resource_conflicts(&refs);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(
            conflicts[0].kind,
            ResourceConflictKind::ExactCoveredByTemplate
        );
    }

    #[test]
    fn test_template_overlap_conflict() {
        let refs = vec![rref("a", "file:///{+a}"), rref("b", "file:///{+b}")];
        let conflicts = detect_resource_conflicts(&refs);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ResourceConflictKind::TemplateOverlap);
    }

    #[test]
    fn test_disjoint_refs_produce_no_conflicts() {
        let refs = vec![
            rref("a", "file:///etc/hosts"),
            rref("b", "db://{table}"),
            rref("c", "users://alice"),
        ];
        assert!(detect_resource_conflicts(&refs).is_empty());
    }

    #[test]
    fn test_prompt_conflicts_pairwise() {
        let refs = vec![pref("a", "draft"), pref("b", "draft"), pref("c", "draft")];
        let conflicts = detect_prompt_conflicts(&refs);
        // Three refs sharing a name: pairs (0,1), (0,2), (1,2).
        assert_eq!(conflicts.len(), 3);
        assert!(conflicts.iter().all(|c| c.name == "draft"));
    }

    #[test]
    fn test_prompt_names_are_case_sensitive() {
        let refs = vec![pref("a", "Draft"), pref("b", "draft")];
        assert!(detect_prompt_conflicts(&refs).is_empty());
        assert_eq!(find_matching_prompt_refs("draft", &refs).len(), 1);
    }

    #[test]
    fn test_find_matching_resource_refs_in_order() {
        let refs = vec![
            rref("a", "file:///{+path}"),
            rref("b", "db://{table}"),
            rref("c", "file:///etc/hosts"),
        ];
        let matches = find_matching_resource_refs("file:///etc/hosts", &refs);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].server_name, "a");
        assert_eq!(matches[1].server_name, "c");
    }

    #[test]
    fn test_find_matching_resource_refs_empty() {
        let refs = vec![rref("a", "db://{table}")];
        assert!(find_matching_resource_refs("file:///x", &refs).is_empty());
    }

    #[test]
    fn test_dedup_is_stable_and_first_wins() {
        let items = vec![
            ("k1", "first"),
            ("k2", "second"),
            ("k1", "shadowed"),
            ("k3", "third"),
        ];
        let deduped = dedup_by_key(items, |(k, _)| *k);
        assert_eq!(
            deduped,
            vec![("k1", "first"), ("k2", "second"), ("k3", "third")]
        );
    }
}
