//! Netscape cookie file support for reusing a browser login.
//!
//! Browser extensions commonly export this tab-separated format. The cookies
//! are loaded into a reqwest jar that backs a [`crate::session::Session`].

use reqwest::Url;
use reqwest::cookie::Jar;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Cookie entry parsed from a Netscape cookie file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NetscapeCookie {
    domain: String,
    include_subdomains: bool,
    path: String,
    secure: bool,
    expires_unix: Option<i64>,
    name: String,
    value: String,
    http_only: bool,
}

/// Errors that can occur while loading cookies.
#[derive(Error, Debug)]
pub enum CookieError {
    /// Failed to read the file.
    #[error("Failed to read cookie file: {0}")]
    Io(#[from] std::io::Error),

    /// Cookie file contains an invalid line.
    #[error("Invalid Netscape cookie line: {0}")]
    InvalidLine(String),

    /// Cookie domain could not be converted into a URL.
    #[error("Invalid cookie domain: {0}")]
    InvalidDomain(String),

    /// No cookie in the file applies to the target site.
    #[error("No cookies for {0}")]
    NoCookiesForSite(String),
}

/// A jar filled from a cookie file.
#[derive(Debug)]
pub struct LoadedCookies {
    pub jar: Arc<Jar>,
    /// Number of cookies added.
    pub count: usize,
    /// Earliest expiry among persistent cookies, as a unix timestamp.
    pub earliest_expiry: Option<i64>,
}

/// Loads the cookies that apply to `site_host` from a Netscape cookie file.
pub fn load_cookie_file(path: &Path, site_host: &str) -> Result<LoadedCookies, CookieError> {
    let cookies: Vec<NetscapeCookie> = parse_netscape_cookie_file(path)?
        .into_iter()
        .filter(|c| domain_matches(&c.domain, site_host))
        .collect();

    if cookies.is_empty() {
        return Err(CookieError::NoCookiesForSite(site_host.to_string()));
    }

    let jar = Arc::new(Jar::default());
    add_cookies_to_jar(&jar, &cookies)?;

    Ok(LoadedCookies {
        jar,
        count: cookies.len(),
        earliest_expiry: cookies.iter().filter_map(|c| c.expires_unix).min(),
    })
}

fn domain_matches(cookie_domain: &str, host: &str) -> bool {
    let domain = cookie_domain.trim_start_matches('.').to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    host == domain || host.ends_with(&format!(".{}", domain))
}

fn parse_netscape_cookie_file(path: &Path) -> Result<Vec<NetscapeCookie>, CookieError> {
    let content = std::fs::read_to_string(path)?;
    let mut cookies = Vec::new();

    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        let (http_only, line) = if let Some(stripped) = line.strip_prefix("#HttpOnly_") {
            (true, stripped)
        } else if line.starts_with('#') {
            continue;
        } else {
            (false, line)
        };

        let invalid = || CookieError::InvalidLine(line.to_string());
        let mut parts = line.splitn(7, '\t');
        let domain = parts.next().ok_or_else(invalid)?;
        let include_subdomains = parts.next().ok_or_else(invalid)?.eq_ignore_ascii_case("true");
        let path = parts.next().ok_or_else(invalid)?;
        let secure = parts.next().ok_or_else(invalid)?.eq_ignore_ascii_case("true");
        let expires_raw = parts.next().ok_or_else(invalid)?;
        let name = parts.next().ok_or_else(invalid)?;
        let value = parts.next().ok_or_else(invalid)?;

        // 0 marks a session cookie
        let expires_unix = expires_raw
            .parse::<i64>()
            .ok()
            .filter(|ts| *ts != 0);

        cookies.push(NetscapeCookie {
            domain: domain.to_string(),
            include_subdomains,
            path: path.to_string(),
            secure,
            expires_unix,
            name: name.to_string(),
            value: value.to_string(),
            http_only,
        });
    }

    Ok(cookies)
}

fn add_cookies_to_jar(jar: &Jar, cookies: &[NetscapeCookie]) -> Result<(), CookieError> {
    for cookie in cookies {
        let host = cookie.domain.trim_start_matches('.');
        if host.is_empty() {
            return Err(CookieError::InvalidDomain(cookie.domain.clone()));
        }

        let url = Url::parse(&format!("https://{}/", host))
            .map_err(|_| CookieError::InvalidDomain(cookie.domain.clone()))?;

        let mut cookie_str = format!("{}={}; Path={}", cookie.name, cookie.value, cookie.path);

        if cookie.include_subdomains {
            cookie_str.push_str(&format!("; Domain={}", cookie.domain));
        }
        if cookie.secure {
            cookie_str.push_str("; Secure");
        }
        if cookie.http_only {
            cookie_str.push_str("; HttpOnly");
        }

        jar.add_cookie_str(&cookie_str, &url);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::cookie::CookieStore;
    use tempfile::TempDir;

    const COOKIES: &str = "
# Netscape HTTP Cookie File
.gomuhouchi.com\tTRUE\t/\tTRUE\t2145916800\twordpress_logged_in\tabc123
#HttpOnly_gomuhouchi.com\tFALSE\t/\tFALSE\t0\tswpm_session\tsess42
.other.example\tTRUE\t/\tFALSE\t1900000000\ttracker\tzzz
";

    #[test]
    fn test_parse_netscape_cookie_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cookies.txt");
        std::fs::write(&path, COOKIES).unwrap();

        let cookies = parse_netscape_cookie_file(&path).unwrap();
        assert_eq!(cookies.len(), 3);
        assert_eq!(cookies[0].domain, ".gomuhouchi.com");
        assert!(cookies[0].include_subdomains);
        assert!(cookies[0].secure);
        assert_eq!(cookies[0].name, "wordpress_logged_in");
        assert_eq!(cookies[0].expires_unix, Some(2145916800));

        assert!(cookies[1].http_only);
        assert_eq!(cookies[1].expires_unix, None);
    }

    #[test]
    fn test_load_filters_by_site() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cookies.txt");
        std::fs::write(&path, COOKIES).unwrap();

        let loaded = load_cookie_file(&path, "gomuhouchi.com").unwrap();
        assert_eq!(loaded.count, 2);
        assert_eq!(loaded.earliest_expiry, Some(2145916800));

        let url = Url::parse("https://gomuhouchi.com/").unwrap();
        let header = loaded.jar.cookies(&url).unwrap();
        let header = header.to_str().unwrap();
        assert!(header.contains("wordpress_logged_in=abc123"));
        assert!(!header.contains("tracker"));
    }

    #[test]
    fn test_no_cookies_for_site() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cookies.txt");
        std::fs::write(&path, COOKIES).unwrap();

        let err = load_cookie_file(&path, "example.org").unwrap_err();
        assert!(matches!(err, CookieError::NoCookiesForSite(_)));
    }

    #[test]
    fn test_parse_invalid_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cookies.txt");
        std::fs::write(&path, "invalid-line").unwrap();

        let err = parse_netscape_cookie_file(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid Netscape cookie line"));
    }

    #[test]
    fn test_domain_matches() {
        assert!(domain_matches(".gomuhouchi.com", "www.gomuhouchi.com"));
        assert!(domain_matches("gomuhouchi.com", "gomuhouchi.com"));
        assert!(!domain_matches("gomuhouchi.com", "notgomuhouchi.com"));
    }
}
