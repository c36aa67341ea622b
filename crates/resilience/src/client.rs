use reqwest::{Client, Proxy};
use std::time::Duration;
use tracing::{info, warn};

/// Proxy decision for one external service.
#[derive(Debug, PartialEq)]
enum ProxyResolution {
    UseProxy(String),
    /// Host matched `no_proxy`; bypass every proxy including env vars.
    ForceDirectConnect,
    /// Nothing configured; reqwest reads HTTPS_PROXY / HTTP_PROXY itself.
    None,
}

/// Whether `host` matches a `no_proxy` rule.
/// Supports exact hosts, "*.example.com" (subdomains only) and ".example.com" (domain and subdomains).
fn is_no_proxy(host: &str, no_proxy_list: &[String]) -> bool {
    let host_lower = host.to_lowercase();
    for rule in no_proxy_list {
        let r = rule.trim().to_lowercase();
        if r.is_empty() {
            continue;
        }
        if let Some(suffix) = r.strip_prefix("*.") {
            if host_lower.ends_with(&format!(".{}", suffix)) {
                return true;
            }
        } else if let Some(suffix) = r.strip_prefix('.') {
            if host_lower == suffix || host_lower.ends_with(&format!(".{}", suffix)) {
                return true;
            }
        } else if host_lower == r {
            return true;
        }
    }
    false
}

fn extract_host(url: &str) -> Option<String> {
    let without_scheme = match url.find("://") {
        Some(pos) => &url[pos + 3..],
        None => url,
    };
    let authority = without_scheme.split('/').next()?.rsplit('@').next()?;
    if authority.starts_with('[') {
        return authority
            .split(']')
            .next()
            .map(|s| s.trim_start_matches('[').to_string());
    }
    authority.split(':').next().map(str::to_string)
}

fn resolve_proxy(proxy: Option<&str>, no_proxy: &[String], service_url: &str) -> ProxyResolution {
    let proxy = match proxy {
        Some(p) if !p.trim().is_empty() => p.trim(),
        _ => return ProxyResolution::None,
    };
    if !no_proxy.is_empty() {
        if let Some(host) = extract_host(service_url) {
            if is_no_proxy(&host, no_proxy) {
                return ProxyResolution::ForceDirectConnect;
            }
        }
    }
    ProxyResolution::UseProxy(proxy.to_string())
}

/// Build the reqwest client used for calls to one external service.
///
/// - `proxy`: `resilience.proxy` from config
/// - `no_proxy`: `resilience.noProxy`
/// - `service_url`: base URL of the service, matched against `no_proxy`
pub fn build_http_client(
    proxy: Option<&str>,
    no_proxy: &[String],
    service_url: &str,
    timeout: Duration,
) -> Client {
    let mut builder = Client::builder().timeout(timeout);

    match resolve_proxy(proxy, no_proxy, service_url) {
        ProxyResolution::UseProxy(proxy_url) => match Proxy::all(&proxy_url) {
            Ok(p) => {
                info!(proxy = %proxy_url, service = %service_url, "External service using proxy");
                builder = builder.proxy(p);
            }
            Err(e) => {
                warn!(error = %e, proxy = %proxy_url, "Invalid proxy URL, falling back to direct connect");
            }
        },
        ProxyResolution::ForceDirectConnect => {
            info!(service = %service_url, "External service matched no_proxy, connecting directly");
            builder = builder.no_proxy();
        }
        ProxyResolution::None => {}
    }

    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client, using default");
        Client::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_no_proxy_rules() {
        let list = vec![
            "localhost".to_string(),
            "*.local".to_string(),
            ".hue-bridge.net".to_string(),
        ];
        assert!(is_no_proxy("localhost", &list));
        assert!(is_no_proxy("roku.local", &list));
        assert!(!is_no_proxy("local", &list));
        assert!(is_no_proxy("hue-bridge.net", &list));
        assert!(is_no_proxy("api.hue-bridge.net", &list));
        assert!(!is_no_proxy("api.weather.com", &list));
    }

    #[test]
    fn test_extract_host() {
        assert_eq!(extract_host("https://api.weather.gov/points"), Some("api.weather.gov".to_string()));
        assert_eq!(extract_host("http://192.168.1.20:8060/query"), Some("192.168.1.20".to_string()));
        assert_eq!(extract_host("https://user:pw@calendar.local:8443/x"), Some("calendar.local".to_string()));
        assert_eq!(extract_host("http://[::1]:8080/"), Some("::1".to_string()));
    }

    #[test]
    fn test_resolve_proxy() {
        let no_proxy = vec!["*.local".to_string()];
        assert_eq!(
            resolve_proxy(Some("http://proxy:3128"), &no_proxy, "http://roku.local:8060"),
            ProxyResolution::ForceDirectConnect
        );
        assert_eq!(
            resolve_proxy(Some("http://proxy:3128"), &no_proxy, "https://api.weather.gov"),
            ProxyResolution::UseProxy("http://proxy:3128".to_string())
        );
        assert_eq!(resolve_proxy(Some("  "), &no_proxy, "https://api.weather.gov"), ProxyResolution::None);
        assert_eq!(resolve_proxy(None, &[], "https://api.weather.gov"), ProxyResolution::None);
    }

    #[test]
    fn test_build_http_client() {
        let client = build_http_client(None, &[], "https://api.weather.gov", Duration::from_secs(5));
        drop(client);
    }
}
