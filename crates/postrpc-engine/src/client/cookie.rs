//! Client cookie jar with path scoping and `Set-Cookie` parsing.

use std::time::{Duration, Instant};

use postrpc_core::protocol::Cookies;

/// Header carrying cookie updates on a response. Several cookies are
/// separated by newlines.
pub const SET_COOKIE: &str = "set-cookie";

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredCookie {
    name: String,
    value: String,
    path: String,
    expires_at: Option<Instant>,
}

impl StoredCookie {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

#[derive(Debug, Default)]
pub struct CookieJar {
    entries: Vec<StoredCookie>,
}

fn normalize(path: &str) -> String {
    let trimmed = path.split('?').next().unwrap_or_default();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// RFC 6265 path-match.
pub fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    let req = normalize(request_path);
    if cookie_path == "/" || req == cookie_path {
        return true;
    }
    if let Some(rest) = req.strip_prefix(cookie_path) {
        return cookie_path.ends_with('/') || rest.starts_with('/');
    }
    false
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&mut self) {
        let now = Instant::now();
        self.entries.retain(|c| !c.expired(now));
    }

    /// Insert or replace a session cookie.
    pub fn set(&mut self, name: &str, value: &str, path: Option<&str>) {
        self.insert(name, value, path.map(normalize).unwrap_or_else(|| "/".into()), None);
    }

    fn insert(&mut self, name: &str, value: &str, path: String, expires_at: Option<Instant>) {
        self.entries.retain(|c| !(c.name == name && c.path == path));
        self.entries.push(StoredCookie {
            name: name.to_string(),
            value: value.to_string(),
            path,
            expires_at,
        });
    }

    /// Most specific (longest path) match wins.
    pub fn get(&mut self, name: &str, request_path: Option<&str>) -> Option<String> {
        self.prune();
        let path = request_path.unwrap_or("/");
        self.entries
            .iter()
            .filter(|c| c.name == name && (request_path.is_none() || path_matches(&c.path, path)))
            .max_by_key(|c| c.path.len())
            .map(|c| c.value.clone())
    }

    /// Remove `name`, under one path or under every path.
    pub fn remove(&mut self, name: &str, path: Option<&str>) {
        let path = path.map(normalize);
        self.entries
            .retain(|c| !(c.name == name && path.as_ref().map(|p| *p == c.path).unwrap_or(true)));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Every live cookie, longer paths taking precedence per name.
    pub fn all(&mut self) -> Cookies {
        self.prune();
        let mut sorted: Vec<&StoredCookie> = self.entries.iter().collect();
        sorted.sort_by_key(|c| c.path.len());
        sorted
            .into_iter()
            .map(|c| (c.name.clone(), c.value.clone()))
            .collect()
    }

    /// Cookies to send with a request for `request_path`.
    pub fn matching(&mut self, request_path: &str) -> Cookies {
        self.prune();
        let mut hits: Vec<&StoredCookie> = self
            .entries
            .iter()
            .filter(|c| path_matches(&c.path, request_path))
            .collect();
        hits.sort_by_key(|c| c.path.len());
        hits.into_iter()
            .map(|c| (c.name.clone(), c.value.clone()))
            .collect()
    }

    /// Apply a `set-cookie` header value (one cookie per line).
    pub fn apply_set_cookie(&mut self, header: &str) {
        for line in header.lines().map(str::trim).filter(|l| !l.is_empty()) {
            self.apply_one(line);
        }
    }

    fn apply_one(&mut self, line: &str) {
        let mut parts = line.split(';').map(str::trim);
        let Some((name, value)) = parts.next().and_then(|nv| nv.split_once('=')) else {
            return;
        };
        let name = name.trim();
        if name.is_empty() {
            return;
        }

        let mut path = "/".to_string();
        let mut max_age: Option<i64> = None;
        for attr in parts {
            let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
            match key.trim().to_ascii_lowercase().as_str() {
                "path" if val.starts_with('/') => path = val.trim().to_string(),
                "max-age" => max_age = val.trim().parse().ok(),
                _ => {}
            }
        }

        match max_age {
            Some(secs) if secs <= 0 => self.remove(name, Some(&path)),
            // Deadlines past what `Instant` can represent never expire.
            Some(secs) => {
                let expires_at = Instant::now().checked_add(Duration::from_secs(secs.unsigned_abs()));
                self.insert(name, value.trim(), path, expires_at)
            }
            None => self.insert(name, value.trim(), path, None),
        }
    }
}
