use std::cell::RefCell;
use std::collections::HashMap;

use regex::Regex;
use tracing::debug;

use super::ApisetNamespace;
use crate::common::starts_with_ignore_case;

/// Prefixes of the names that the loader redirects through the API set schema
const VIRTUAL_PREFIXES: [&str; 2] = ["api-", "ext-"];

/// Maps virtual library names to the library that implements them
///
/// Lookups are memoized for the lifetime of the resolver. One resolver is meant to be created
/// per run and shared by everything that parses images.
pub struct ApiSetResolver {
    namespace: Option<ApisetNamespace>,
    cache: RefCell<HashMap<String, String>>,
    version_re: Regex,
}

impl ApiSetResolver {
    pub fn new(namespace: Option<ApisetNamespace>) -> Self {
        Self {
            namespace,
            cache: RefCell::new(HashMap::new()),
            version_re: Regex::new(r"^(\S+)(-l\d+-\d+-\d+)$").expect("valid API set name regex"),
        }
    }

    /// A resolver that never redirects anything
    pub fn passthrough() -> Self {
        Self::new(None)
    }

    pub fn has_namespace(&self) -> bool {
        self.namespace.is_some()
    }

    pub fn is_virtual(name: &str) -> bool {
        VIRTUAL_PREFIXES
            .iter()
            .any(|p| starts_with_ignore_case(name, p))
    }

    /// Strip the `-lX-Y-Z` version suffix, if any
    pub fn versionless_name<'a>(&self, name: &'a str) -> &'a str {
        self.version_re
            .captures(name)
            .and_then(|c| c.get(1))
            .map_or(name, |m| m.as_str())
    }

    /// Name of the library implementing `virtual_name`; `virtual_name` itself if there is none
    pub fn resolve(&self, virtual_name: &str) -> String {
        let namespace = match &self.namespace {
            Some(ns) if Self::is_virtual(virtual_name) => ns,
            _ => return virtual_name.to_owned(),
        };

        if let Some(cached) = self.cache.borrow().get(virtual_name) {
            return cached.clone();
        }

        let stem = virtual_name.to_lowercase();
        let stem = stem.split('.').next().unwrap_or_default();
        let wanted = self.versionless_name(stem);

        let logical = namespace
            .entries()
            .iter()
            .find(|e| self.versionless_name(&e.name) == wanted)
            .and_then(|e| e.hosts.iter().rev().find(|h| !h.is_empty()))
            .cloned()
            .unwrap_or_else(|| virtual_name.to_owned());

        debug!("API set {} resolved to {}", virtual_name, logical);
        self.cache
            .borrow_mut()
            .insert(virtual_name.to_owned(), logical.clone());
        logical
    }

    /// Number of memoized lookups
    pub fn cached(&self) -> usize {
        self.cache.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apiset::ApisetEntry;

    fn resolver() -> ApiSetResolver {
        ApiSetResolver::new(Some(ApisetNamespace::from_entries(vec![
            ApisetEntry {
                name: "api-ms-win-core-file-l1-2-2".to_owned(),
                hosts: vec!["kernel32.dll".to_owned(), "kernelbase.dll".to_owned()],
            },
            ApisetEntry {
                name: "ext-ms-win-gdi-draw-l1-1-0".to_owned(),
                hosts: vec!["gdi32full.dll".to_owned(), String::new()],
            },
            ApisetEntry {
                name: "api-ms-win-nohost-l1-1-0".to_owned(),
                hosts: vec![],
            },
        ])))
    }

    #[test]
    fn versionless() {
        let r = ApiSetResolver::passthrough();
        assert_eq!(
            r.versionless_name("api-ms-onecoreuap-print-render-l1-1-0"),
            "api-ms-onecoreuap-print-render"
        );
        assert_eq!(r.versionless_name("kernel32"), "kernel32");
        assert_eq!(r.versionless_name("api-ms-win-l1"), "api-ms-win-l1");
    }

    #[test]
    fn non_virtual_names_pass_through() {
        let r = resolver();
        assert_eq!(r.resolve("KERNEL32.dll"), "KERNEL32.dll");
        assert_eq!(r.resolve("KERNEL32.dll"), "KERNEL32.dll");
        assert_eq!(r.cached(), 0);
    }

    #[test]
    fn no_namespace_passes_through() {
        let r = ApiSetResolver::passthrough();
        assert!(!r.has_namespace());
        assert_eq!(
            r.resolve("api-ms-win-core-file-l1-2-2.dll"),
            "api-ms-win-core-file-l1-2-2.dll"
        );
    }

    #[test]
    fn last_host_wins() {
        let r = resolver();
        // the version in the binary does not need to match the one in the schema
        assert_eq!(r.resolve("api-ms-win-core-file-l1-1-0.dll"), "kernelbase.dll");
        assert_eq!(r.resolve("API-MS-WIN-CORE-FILE-L1-2-2.DLL"), "kernelbase.dll");
    }

    #[test]
    fn empty_hosts_are_skipped() {
        let r = resolver();
        assert_eq!(r.resolve("ext-ms-win-gdi-draw-l1-1-0.dll"), "gdi32full.dll");
    }

    #[test]
    fn unknown_or_hostless_entries_are_cached_unchanged() {
        let r = resolver();
        assert_eq!(r.resolve("api-ms-win-nohost-l1-1-0.dll"), "api-ms-win-nohost-l1-1-0.dll");
        assert_eq!(r.resolve("api-ms-win-unknown-l1-1-0.dll"), "api-ms-win-unknown-l1-1-0.dll");
        assert_eq!(r.cached(), 2);
        assert_eq!(r.resolve("api-ms-win-unknown-l1-1-0.dll"), "api-ms-win-unknown-l1-1-0.dll");
        assert_eq!(r.cached(), 2);
    }
}
