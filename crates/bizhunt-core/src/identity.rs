//! Listing identity: URL canonicalization and deterministic ids.

use std::fmt::Write as _;

use url::Url;
use uuid::Uuid;

use crate::{IdentityError, ListingId};

const TRACKING_PARAMS: &[&str] = &[
    "gclid", "gbraid", "wbraid", "fbclid", "msclkid", "dclid", "yclid", "mc_cid", "mc_eid",
    "igshid", "_ga", "_gl", "_hsenc", "_hsmi", "ref", "ref_src", "trk", "spm",
];

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Canonical absolute form of a listing URL.
///
/// Lower-cases scheme and host, drops default ports, user info and fragments,
/// removes tracking query parameters, sorts the rest and strips trailing slashes.
pub fn canonicalize_url(raw: &str) -> Result<String, IdentityError> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed).map_err(|e| IdentityError::InvalidUrl {
        url: trimmed.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(IdentityError::UnsupportedScheme(trimmed.to_string()));
    }
    let Some(host) = url.host_str() else {
        return Err(IdentityError::InvalidUrl {
            url: trimmed.to_string(),
            reason: "missing host".to_string(),
        });
    };

    let mut out = format!("{}://{}", url.scheme(), host.to_ascii_lowercase());
    // `Url` already reports `None` for the scheme's default port.
    if let Some(port) = url.port() {
        let _ = write!(out, ":{port}");
    }
    out.push_str(url.path().trim_end_matches('/'));

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if !pairs.is_empty() {
        pairs.sort();
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        out.push('?');
        out.push_str(&query);
    }
    Ok(out)
}

/// Resolve a possibly relative href against the page it was found on.
pub fn resolve_url(base: &str, href: &str) -> Result<String, IdentityError> {
    let base_url = Url::parse(base).map_err(|e| IdentityError::InvalidUrl {
        url: base.to_string(),
        reason: e.to_string(),
    })?;
    base_url
        .join(href.trim())
        .map(|u| u.to_string())
        .map_err(|e| IdentityError::InvalidUrl {
            url: href.to_string(),
            reason: e.to_string(),
        })
}

/// Deterministic id for an already canonical URL within a source.
pub fn listing_id(source: &str, canonical_url: &str) -> ListingId {
    let name = format!("{source}|{canonical_url}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
}

/// Canonicalize `raw_url` and derive its id in one step.
pub fn identify(source: &str, raw_url: &str) -> Result<(ListingId, String), IdentityError> {
    let canonical = canonicalize_url(raw_url)?;
    Ok((listing_id(source, &canonical), canonical))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_strips_noise() {
        let canonical = canonicalize_url(
            "HTTPS://WWW.BizBuySell.com:443/Business/amazon-store/?utm_source=x&b=2&a=1#photos",
        )
        .unwrap();
        assert_eq!(canonical, "https://www.bizbuysell.com/Business/amazon-store?a=1&b=2");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for raw in [
            "https://flippa.com/12345-widget-store/?ref=home&page=2",
            "http://example.com:8080/a//",
            "https://quietlight.com/",
            "https://empireflippers.com/listing/88123?q=two+words&utm_medium=email",
        ] {
            let once = canonicalize_url(raw).unwrap();
            let twice = canonicalize_url(&once).unwrap();
            assert_eq!(once, twice, "not idempotent for {raw}");
        }
    }

    #[test]
    fn non_default_port_is_kept() {
        assert_eq!(
            canonicalize_url("http://example.com:8080/a/").unwrap(),
            "http://example.com:8080/a"
        );
    }

    #[test]
    fn tracking_params_do_not_change_identity() {
        let (a, _) = identify("flippa", "https://flippa.com/10001-shop?utm_campaign=spring&gclid=abc").unwrap();
        let (b, _) = identify("flippa", "https://flippa.com/10001-shop/").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn identity_is_scoped_by_source() {
        let url = "https://example.com/listing/1";
        assert_ne!(listing_id("bizquest", url), listing_id("bizbuysell", url));
    }

    #[test]
    fn rejects_relative_and_non_http_urls() {
        assert!(matches!(
            canonicalize_url("/listing/1"),
            Err(IdentityError::InvalidUrl { .. })
        ));
        assert!(matches!(
            canonicalize_url("ftp://example.com/listing"),
            Err(IdentityError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn resolves_relative_links() {
        assert_eq!(
            resolve_url("https://quietlight.com/listings/page/2/", "/listings/widget-co/").unwrap(),
            "https://quietlight.com/listings/widget-co/"
        );
    }
}
