//! resolv.conf rewrite rules (spec.md §4.8 step 7, §6, §8 scenario 4).
//!
//! Per spec.md §9's resolved open question, the two observed source
//! behaviors ("replace" vs "augment" the reserved nameserver) are
//! reconciled by always commenting an existing non-reserved `nameserver`
//! line rather than deleting it, then appending the reserved one if it
//! wasn't already present.

use crate::engine::types::labels;
use crate::engine::types::ContainerRecord;
use std::collections::HashSet;

pub const RESERVED_NAMESERVER: &str = "169.254.169.250";

fn dedupe_preserve_order(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|i| seen.insert(i.clone())).collect()
}

/// Domains required by the search rule, excluding whatever the resolv.conf
/// file's own pre-existing `search` line already lists (that's merged in
/// separately by `rewrite_resolv_conf`): `<svc>.<stack>.rancher.internal`
/// and `<stack>.rancher.internal` derived from `stack_service.name`, the
/// container's own `dnsSearch` entries, and the literal `rancher.internal`.
pub fn derive_search_domains(record: &ContainerRecord) -> Vec<String> {
    let mut domains = Vec::new();
    if let Some(full) = record.label(labels::STACK_SERVICE_NAME) {
        if let Some((stack, svc)) = full.split_once('/') {
            domains.push(format!("{svc}.{stack}.rancher.internal"));
            domains.push(format!("{stack}.rancher.internal"));
        }
    }
    domains.extend(record.dns_search.iter().cloned());
    domains.push("rancher.internal".to_string());
    dedupe_preserve_order(domains)
}

/// Apply the nameserver + search rewrite rules to `original` resolv.conf
/// content, merging `extra_search_domains` into any pre-existing `search`
/// line. Returns the new file content (always newline-terminated).
pub fn rewrite_resolv_conf(original: &str, extra_search_domains: &[String]) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut nameserver_already_set = false;
    let mut search_line_seen = false;

    for line in original.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("nameserver") {
            if trimmed.contains(RESERVED_NAMESERVER) {
                nameserver_already_set = true;
                lines.push(line.to_string());
            } else {
                lines.push(format!("# {line}"));
            }
        } else if trimmed.starts_with("search") {
            search_line_seen = true;
            let mut merged: Vec<String> = trimmed.split_whitespace().skip(1).map(str::to_string).collect();
            merged.extend(extra_search_domains.iter().cloned());
            let deduped = dedupe_preserve_order(merged);
            lines.push(format!("search {}", deduped.join(" ")));
        } else {
            lines.push(line.to_string());
        }
    }

    if !search_line_seen {
        let deduped = dedupe_preserve_order(extra_search_domains.to_vec());
        lines.push(format!("search {}", deduped.join(" ")));
    }
    if !nameserver_already_set {
        lines.push(format!("nameserver {RESERVED_NAMESERVER}"));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Read, rewrite, and atomically overwrite `path` (write to a sibling temp
/// file, then rename into place — overwrite-in-place is acceptable on this
/// path per spec.md §4.8).
pub async fn rewrite_file(path: &str, extra_search_domains: &[String]) -> anyhow::Result<()> {
    let original = tokio::fs::read_to_string(path).await.unwrap_or_default();
    let rewritten = rewrite_resolv_conf(&original, extra_search_domains);

    let tmp_path = format!("{path}.tmp-{}", uuid::Uuid::new_v4());
    tokio::fs::write(&tmp_path, rewritten).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_to_end_scenario_matches_literal_spec_example() {
        let original = "nameserver 8.8.8.8\nsearch corp.example\n";
        let record = ContainerRecord::default();
        let extra = derive_search_domains(&record);
        let rewritten = rewrite_resolv_conf(original, &extra);

        assert!(rewritten.contains("# nameserver 8.8.8.8"));
        assert!(rewritten.contains("search corp.example rancher.internal"));
        assert!(rewritten.contains(&format!("nameserver {RESERVED_NAMESERVER}")));
        assert_eq!(rewritten.matches("nameserver 169.254.169.250").count(), 1);
    }

    #[test]
    fn already_present_reserved_nameserver_is_marked_set_not_duplicated() {
        let original = format!("nameserver {RESERVED_NAMESERVER}\nsearch a.example\n");
        let rewritten = rewrite_resolv_conf(&original, &["rancher.internal".to_string()]);
        assert_eq!(rewritten.matches(RESERVED_NAMESERVER).count(), 1);
        assert!(!rewritten.contains("# nameserver"));
    }

    #[test]
    fn missing_search_line_gets_one_appended() {
        let original = "nameserver 8.8.8.8\n";
        let rewritten = rewrite_resolv_conf(original, &["rancher.internal".to_string()]);
        assert!(rewritten.contains("search rancher.internal"));
    }

    #[test]
    fn stack_service_name_expands_to_two_search_domains() {
        let mut record = ContainerRecord::default();
        record
            .labels
            .insert(labels::STACK_SERVICE_NAME.to_string(), "mystack/myservice".to_string());
        let domains = derive_search_domains(&record);
        assert!(domains.contains(&"myservice.mystack.rancher.internal".to_string()));
        assert!(domains.contains(&"mystack.rancher.internal".to_string()));
        assert!(domains.contains(&"rancher.internal".to_string()));
    }

    #[test]
    fn duplicate_domains_across_sources_are_not_repeated() {
        let mut record = ContainerRecord::default();
        record.dns_search = vec!["rancher.internal".to_string()];
        let domains = derive_search_domains(&record);
        assert_eq!(domains.iter().filter(|d| *d == "rancher.internal").count(), 1);
    }
}
