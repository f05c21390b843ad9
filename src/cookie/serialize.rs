use crate::error::{Error, Result};
use httpdate::fmt_http_date;
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    pub fn as_str(self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "strict" => Some(SameSite::Strict),
            "lax" => Some(SameSite::Lax),
            "none" => Some(SameSite::None),
            _ => Option::None,
        }
    }
}

/// Cookie attributes. Attribute order on the wire is fixed:
/// `Name=Value; Max-Age; Domain; Path; Expires; HttpOnly; Secure; SameSite`.
#[derive(Clone, Debug, Deserialize)]
pub struct SerializeOptions {
    #[serde(default = "default_path")]
    pub path: String,
    pub domain: Option<String>,
    #[serde(default = "default_flag")]
    pub http_only: bool,
    #[serde(default = "default_flag")]
    pub secure: bool,
    #[serde(default = "default_same_site")]
    pub same_site: SameSite,
    pub max_age: Option<u64>,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_flag() -> bool {
    true
}

fn default_same_site() -> SameSite {
    SameSite::Lax
}

impl Default for SerializeOptions {
    fn default() -> Self {
        Self {
            path: default_path(),
            domain: None,
            http_only: true,
            secure: true,
            same_site: default_same_site(),
            max_age: Some(12 * 60 * 60),
        }
    }
}

pub fn serialize_cookie(name: &str, value: &str, options: &SerializeOptions) -> String {
    let mut cookie = format!("{name}={value}");
    if let Some(max_age) = options.max_age {
        cookie.push_str(&format!("; Max-Age={max_age}"));
    }
    if let Some(domain) = &options.domain {
        cookie.push_str(&format!("; Domain={domain}"));
    }
    cookie.push_str(&format!("; Path={}", options.path));
    if let Some(max_age) = options.max_age {
        let expires = SystemTime::now() + Duration::from_secs(max_age);
        cookie.push_str(&format!("; Expires={}", fmt_http_date(expires)));
    }
    if options.http_only {
        cookie.push_str("; HttpOnly");
    }
    if options.secure {
        cookie.push_str("; Secure");
    }
    cookie.push_str(&format!("; SameSite={}", options.same_site.as_str()));
    cookie
}

/// The logout cookie: empty value, `Max-Age=0`, epoch `Expires`, same
/// `Path`/`Domain` as the live cookie so the browser actually replaces it.
pub fn expire_cookie(name: &str, options: &SerializeOptions) -> String {
    let mut cookie = format!("{name}=");
    cookie.push_str("; Max-Age=0");
    if let Some(domain) = &options.domain {
        cookie.push_str(&format!("; Domain={domain}"));
    }
    cookie.push_str(&format!("; Path={}", options.path));
    cookie.push_str(&format!("; Expires={}", fmt_http_date(UNIX_EPOCH)));
    if options.http_only {
        cookie.push_str("; HttpOnly");
    }
    if options.secure {
        cookie.push_str("; Secure");
    }
    cookie.push_str(&format!("; SameSite={}", options.same_site.as_str()));
    cookie
}

/// A parsed `Set-Cookie` header. Attribute names are matched
/// case-insensitively and in any order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedCookie {
    pub name: String,
    pub value: String,
    pub max_age: Option<i64>,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub expires: Option<String>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: Option<SameSite>,
}

pub fn parse_set_cookie(header: &str) -> Result<ParsedCookie> {
    let mut parts = header.split(';');
    let pair = parts.next().unwrap_or_default().trim();
    let (name, value) = pair
        .split_once('=')
        .ok_or_else(|| Error::InvalidArgument("cookie has no name=value pair".to_string()))?;

    let mut cookie = ParsedCookie {
        name: name.trim().to_string(),
        value: value.trim().trim_matches('"').to_string(),
        ..ParsedCookie::default()
    };

    for attribute in parts {
        let attribute = attribute.trim();
        let (key, val) = match attribute.split_once('=') {
            Some((key, val)) => (key.trim(), Some(val.trim())),
            None => (attribute, None),
        };
        match key.to_ascii_lowercase().as_str() {
            "max-age" => cookie.max_age = val.and_then(|v| v.parse().ok()),
            "domain" => cookie.domain = val.map(str::to_string),
            "path" => cookie.path = val.map(str::to_string),
            "expires" => cookie.expires = val.map(str::to_string),
            "httponly" => cookie.http_only = true,
            "secure" => cookie.secure = true,
            "samesite" => cookie.same_site = val.and_then(SameSite::parse),
            _ => {}
        }
    }
    Ok(cookie)
}

/// Find a cookie by name in a request `Cookie:` header.
pub fn request_cookie<'a>(header: Option<&'a str>, name: &str) -> Option<&'a str> {
    header.and_then(|header| {
        header.split(';').find_map(|pair| {
            let (pair_name, value) = pair.trim().split_once('=')?;
            if pair_name == name {
                Some(value)
            } else {
                None
            }
        })
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn attributes_are_emitted_in_the_fixed_order() {
        let options = SerializeOptions {
            path: "/".to_string(),
            domain: Some("example.com".to_string()),
            http_only: true,
            secure: true,
            same_site: SameSite::Strict,
            max_age: Some(3600),
        };
        let cookie = serialize_cookie("Session", "abc.def", &options);

        assert!(cookie.starts_with("Session=abc.def; Max-Age=3600; Domain=example.com; Path=/; Expires="));
        assert!(cookie.ends_with("; HttpOnly; Secure; SameSite=Strict"));
    }

    #[test]
    fn unset_attributes_are_omitted() {
        let options = SerializeOptions {
            path: "/app".to_string(),
            domain: None,
            http_only: false,
            secure: false,
            same_site: SameSite::None,
            max_age: None,
        };
        let cookie = serialize_cookie("Session", "v", &options);
        assert_eq!(cookie, "Session=v; Path=/app; SameSite=None");
    }

    #[test]
    fn expired_cookie_clears_at_the_epoch() {
        let cookie = expire_cookie("Session", &SerializeOptions::default());
        assert!(cookie.starts_with("Session=; Max-Age=0; Path=/"));
        assert!(cookie.contains("Expires=Thu, 01 Jan 1970 00:00:00 GMT"));
    }

    #[test]
    fn parsing_tolerates_order_and_case() {
        let cookie = parse_set_cookie("Session=v; secure; SAMESITE=lax; path=/x; MAX-AGE=60; HttpOnly")
            .expect("parses");
        assert_eq!(cookie.name, "Session");
        assert_eq!(cookie.value, "v");
        assert_eq!(cookie.path.as_deref(), Some("/x"));
        assert_eq!(cookie.max_age, Some(60));
        assert_eq!(cookie.same_site, Some(SameSite::Lax));
        assert!(cookie.secure);
        assert!(cookie.http_only);
    }

    #[test]
    fn round_trip_through_the_parser() {
        let options = SerializeOptions::default();
        let header = serialize_cookie("Session", "abc.def", &options);
        let parsed = parse_set_cookie(&header).expect("parses");
        assert_eq!(parsed.value, "abc.def");
        assert_eq!(parsed.max_age, Some(12 * 60 * 60));
        assert_eq!(parsed.same_site, Some(SameSite::Lax));
    }

    #[test]
    fn request_cookie_finds_the_right_pair() {
        let header = Some("theme=dark; Session=abc.def; other=1");
        assert_eq!(request_cookie(header, "Session"), Some("abc.def"));
        assert_eq!(request_cookie(header, "missing"), None);
        assert_eq!(request_cookie(None, "Session"), None);
    }
}
