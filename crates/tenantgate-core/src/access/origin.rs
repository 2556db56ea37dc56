// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `Origin` header matching against a workspace's allow list.

/// Host of an `Origin` header value or an allow-list pattern.
fn host_of(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let host = match url::Url::parse(raw) {
        Ok(url) if url.has_host() => url.host_str()?.to_string(),
        _ => {
            let authority = raw.split('/').next().unwrap_or_default();
            match authority.rsplit_once(':') {
                Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
                _ => authority.to_string(),
            }
        }
    };
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    (!host.is_empty()).then_some(host)
}

/// Whether `origin` is accepted by `allowed`.
///
/// An empty list accepts everything. Patterns are `*`, `*.domain` (any
/// subdomain and the apex), or a host or origin compared by host.
pub fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    if allowed.is_empty() || allowed.iter().any(|p| p.trim() == "*") {
        return true;
    }
    let Some(host) = host_of(origin) else {
        return false;
    };
    allowed.iter().any(|pattern| {
        let pattern = pattern.trim();
        if let Some(suffix) = pattern.strip_prefix("*.") {
            let suffix = suffix.trim_end_matches('.').to_ascii_lowercase();
            host == suffix || host.ends_with(&format!(".{suffix}"))
        } else {
            host_of(pattern).is_some_and(|p| p == host)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_and_star_accept_all() {
        assert!(origin_allowed(&[], "https://evil.test"));
        assert!(origin_allowed(&list(&["*"]), "null"));
    }

    #[test]
    fn test_exact_host_and_origin() {
        let allowed = list(&["app.example.com", "https://portal.example.org"]);
        assert!(origin_allowed(&allowed, "https://app.example.com"));
        assert!(origin_allowed(&allowed, "http://APP.example.com:3000"));
        assert!(origin_allowed(&allowed, "https://portal.example.org"));
        assert!(!origin_allowed(&allowed, "https://example.com"));
        assert!(!origin_allowed(&allowed, "null"));
    }

    #[test]
    fn test_wildcard_subdomains() {
        let allowed = list(&["*.example.com"]);
        assert!(origin_allowed(&allowed, "https://a.b.example.com"));
        assert!(origin_allowed(&allowed, "https://example.com"));
        assert!(!origin_allowed(&allowed, "https://badexample.com"));
    }
}
