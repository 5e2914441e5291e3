// src/dashboard/edge.rs

//! Edge hints added to every proxied response: traffic bucket cookie, region
//! hint and cache eligibility.

use axum::http::{HeaderMap, HeaderValue, Method};

pub const BUCKET_COOKIE: &str = "ab_bucket";
pub const BUCKET_MAX_AGE_SECS: u64 = 60 * 60 * 24 * 14;
pub const DEFAULT_REGION: &str = "KR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    A,
    B,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::A => "A",
            Bucket::B => "B",
        }
    }
}

/// Rolling `hash * 31 + unit` over UTF-16 units, wrapped to 32 bits.
/// Even hashes land in A.
pub fn pick_bucket(seed: &str) -> Bucket {
    let hash = seed
        .encode_utf16()
        .fold(0u32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as u32));
    if hash % 2 == 0 {
        Bucket::A
    } else {
        Bucket::B
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// First hop of `x-forwarded-for`, else `0.0.0.0`.
pub fn client_ip(headers: &HeaderMap) -> String {
    header(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or("0.0.0.0")
        .to_string()
}

pub fn region_hint(headers: &HeaderMap) -> String {
    header(headers, "x-vercel-ip-country")
        .or_else(|| header(headers, "cf-ipcountry"))
        .unwrap_or(DEFAULT_REGION)
        .to_string()
}

pub fn has_bucket_cookie(headers: &HeaderMap) -> bool {
    headers
        .get_all("cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .any(|(name, value)| name == BUCKET_COOKIE && !value.is_empty())
}

pub fn bucket_cookie(bucket: Bucket, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; Max-Age={}; SameSite=Lax",
        BUCKET_COOKIE,
        bucket.as_str(),
        BUCKET_MAX_AGE_SECS
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Adds the edge headers for one request/response pair.
pub fn apply_edge_headers(
    method: &Method,
    path: &str,
    request_headers: &HeaderMap,
    response_headers: &mut HeaderMap,
) {
    if let Ok(region) = HeaderValue::from_str(&region_hint(request_headers)) {
        response_headers.insert("x-region-hint", region);
    }

    if !has_bucket_cookie(request_headers) {
        let seed = format!("{}:{}", client_ip(request_headers), path);
        let secure = header(request_headers, "x-forwarded-proto")
            .is_some_and(|proto| proto.eq_ignore_ascii_case("https"));
        if let Ok(cookie) = HeaderValue::from_str(&bucket_cookie(pick_bucket(&seed), secure)) {
            response_headers.append("set-cookie", cookie);
        }
    }

    if *method == Method::GET {
        response_headers.insert("x-edge-cache-hint", HeaderValue::from_static("eligible"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(*k, HeaderValue::from_static(*v));
        }
        map
    }

    #[test]
    fn test_pick_bucket_parity() {
        // "a" = 97 (odd), "b" = 98 (even)
        assert_eq!(pick_bucket("a"), Bucket::B);
        assert_eq!(pick_bucket("b"), Bucket::A);
        // 31 * 97 + 98 = 3105
        assert_eq!(pick_bucket("ab"), Bucket::B);
        assert_eq!(pick_bucket(""), Bucket::A);
    }

    #[test]
    fn test_pick_bucket_wraps_without_overflow() {
        let seed = "203.0.113.7:".repeat(64);
        let _ = pick_bucket(&seed);
    }

    #[test]
    fn test_client_ip_and_region() {
        let h = headers(&[
            ("x-forwarded-for", " 203.0.113.7 , 10.0.0.1"),
            ("cf-ipcountry", "JP"),
        ]);
        assert_eq!(client_ip(&h), "203.0.113.7");
        assert_eq!(region_hint(&h), "JP");
        assert_eq!(client_ip(&HeaderMap::new()), "0.0.0.0");
        assert_eq!(region_hint(&HeaderMap::new()), "KR");
    }

    #[test]
    fn test_cookie_set_only_when_missing() {
        let mut out = HeaderMap::new();
        apply_edge_headers(
            &Method::GET,
            "/",
            &headers(&[("x-forwarded-proto", "https")]),
            &mut out,
        );
        let cookie = out.get("set-cookie").unwrap().to_str().unwrap();
        assert!(cookie.starts_with("ab_bucket="));
        assert!(cookie.contains("Max-Age=1209600"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.ends_with("; Secure"));
        assert!(!cookie.contains("HttpOnly"));
        assert_eq!(out.get("x-edge-cache-hint").unwrap(), "eligible");

        let mut out = HeaderMap::new();
        apply_edge_headers(
            &Method::POST,
            "/",
            &headers(&[("cookie", "theme=dark; ab_bucket=A")]),
            &mut out,
        );
        assert!(out.get("set-cookie").is_none());
        assert!(out.get("x-edge-cache-hint").is_none());
        assert_eq!(out.get("x-region-hint").unwrap(), "KR");
    }
}
