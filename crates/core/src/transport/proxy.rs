//! Per-hop proxy routing
//!
//! Resolution order for a target URL:
//!
//! 1. identity-provider hosts are always direct;
//! 2. hosts on the configured no-proxy list are direct;
//! 3. hosts matched by `NO_PROXY` / `no_proxy` are direct;
//! 4. otherwise the configured proxy, then `HTTPS_PROXY` / `HTTP_PROXY`.

use ticketline_domain::InstanceConfig;
use url::Url;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySelector {
    proxy: Option<String>,
    no_proxy: Vec<String>,
    identity_hosts: Vec<String>,
    env_no_proxy: Vec<String>,
    env_https_proxy: Option<String>,
    env_http_proxy: Option<String>,
}

impl ProxySelector {
    /// Selector over `instance` settings and the process environment.
    pub fn new(instance: &InstanceConfig) -> Self {
        Self::with_env(instance, |key| std::env::var(key).ok())
    }

    /// Selector reading environment variables through `lookup`.
    pub fn with_env<F>(instance: &InstanceConfig, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| {
            keys.iter().find_map(|key| lookup(key)).filter(|value| !value.trim().is_empty())
        };
        Self {
            proxy: instance.proxy.clone().filter(|p| !p.trim().is_empty()),
            no_proxy: normalize(instance.no_proxy.iter().map(String::as_str)),
            identity_hosts: normalize(instance.identity_hosts.iter().map(String::as_str)),
            env_no_proxy: first(&["NO_PROXY", "no_proxy"])
                .map(|list| normalize(list.split(',')))
                .unwrap_or_default(),
            env_https_proxy: first(&["HTTPS_PROXY", "https_proxy"]),
            env_http_proxy: first(&["HTTP_PROXY", "http_proxy"]),
        }
    }

    /// Route the identity provider at `url` directly.
    #[must_use]
    pub fn with_identity_url(mut self, url: &str) -> Self {
        if let Some(host) = host_of(url) {
            if !self.identity_hosts.contains(&host) {
                self.identity_hosts.push(host);
            }
        }
        self
    }

    /// Proxy URL for `url`, or `None` to connect directly.
    pub fn select(&self, url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok();
        if let Some(host) = parsed.as_ref().and_then(Url::host_str) {
            let host = host.to_ascii_lowercase();
            if matches_any(&self.identity_hosts, &host)
                || matches_any(&self.no_proxy, &host)
                || matches_any(&self.env_no_proxy, &host)
            {
                return None;
            }
        }

        if self.proxy.is_some() {
            return self.proxy.clone();
        }
        let secure = parsed.as_ref().map_or(true, |u| u.scheme() == "https");
        if secure {
            self.env_https_proxy.clone().or_else(|| self.env_http_proxy.clone())
        } else {
            self.env_http_proxy.clone()
        }
    }
}

fn normalize<'a, I>(entries: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    entries
        .into_iter()
        .map(|entry| entry.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|entry| !entry.is_empty())
        .collect()
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(str::to_ascii_lowercase)
}

/// Exact host or subdomain match; `*` matches everything.
fn matches_any(entries: &[String], host: &str) -> bool {
    entries.iter().any(|entry| {
        entry == "*"
            || host == entry
            || host.strip_suffix(entry.as_str()).is_some_and(|prefix| prefix.ends_with('.'))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn instance(proxy: Option<&str>) -> InstanceConfig {
        InstanceConfig {
            base_url: "https://acme.service-now.com".into(),
            proxy: proxy.map(str::to_string),
            no_proxy: vec!["internal.acme.com".into()],
            identity_hosts: vec!["login.acme.com".into()],
            ..InstanceConfig::default()
        }
    }

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    /// Validates `ProxySelector::select` behavior for the routing order
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms identity hosts bypass the configured proxy.
    /// - Confirms no-proxy entries match subdomains.
    /// - Confirms other hosts use the configured proxy.
    #[test]
    fn configured_routes() {
        let selector = ProxySelector::with_env(&instance(Some("http://proxy:3128")), env(&[]));
        assert_eq!(selector.select("https://login.acme.com/sso"), None);
        assert_eq!(selector.select("https://api.internal.acme.com/x"), None);
        assert_eq!(selector.select("https://internal.acme.com"), None);
        assert_eq!(
            selector.select("https://acme.service-now.com/api/now/table/incident"),
            Some("http://proxy:3128".into())
        );
        assert_eq!(
            selector.select("https://notinternal.acme.com.evil.io"),
            Some("http://proxy:3128".into())
        );
    }

    #[test]
    fn env_no_proxy_and_fallback_proxy() {
        let selector = ProxySelector::with_env(
            &instance(None),
            env(&[
                ("NO_PROXY", "localhost, .corp.example"),
                ("HTTPS_PROXY", "http://secure:8443"),
                ("http_proxy", "http://plain:8080"),
            ]),
        );
        assert_eq!(selector.select("https://wiki.corp.example/"), None);
        assert_eq!(selector.select("http://localhost:8080/"), None);
        assert_eq!(selector.select("https://acme.service-now.com"), Some("http://secure:8443".into()));
        assert_eq!(selector.select("http://acme.service-now.com"), Some("http://plain:8080".into()));
    }

    #[test]
    fn identity_url_is_added_and_wildcard_disables_proxy() {
        let selector = ProxySelector::with_env(&instance(Some("http://proxy:3128")), env(&[]))
            .with_identity_url("https://sso.okta.example/app");
        assert_eq!(selector.select("https://sso.okta.example/app/login"), None);

        let selector = ProxySelector::with_env(
            &instance(Some("http://proxy:3128")),
            env(&[("no_proxy", "*")]),
        );
        assert_eq!(selector.select("https://acme.service-now.com"), None);
    }
}
