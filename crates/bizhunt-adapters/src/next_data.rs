//! Adapter for Next.js marketplaces that embed page state in `script#__NEXT_DATA__`.

use std::sync::Arc;

use async_trait::async_trait;
use bizhunt_core::{resolve_url, FetchError, RawListing};
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;

use crate::html::{paginate, SiteProfile};
use crate::{AdapterError, PageSource, SiteAdapter, UrlListing};

const LISTING_EDGES: &[&str] = &["props", "pageProps", "data", "search", "listings", "edges"];
const LISTING_STATE: &[&str] = &["props", "pageProps", "listing"];

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    Some(current)
}

fn json_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_at(value, path)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    json_at(value, path).and_then(|v| match v {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn json_string_vec(value: &JsonValue, path: &[&str]) -> Option<Vec<String>> {
    let items: Vec<String> = json_at(value, path)?
        .as_array()?
        .iter()
        .filter_map(|v| v.as_str().or_else(|| v.get("name").and_then(JsonValue::as_str)))
        .map(str::to_string)
        .collect();
    (!items.is_empty()).then_some(items)
}

fn usd(amount: f64, suffix: &str) -> String {
    format!("${amount}{suffix}")
}

/// Parse the embedded Next.js state of a page.
pub fn next_data(html: &str) -> Result<JsonValue, AdapterError> {
    let document = Html::parse_document(html);
    let sel = Selector::parse("script#__NEXT_DATA__").map_err(|e| AdapterError::Selector {
        selector: "script#__NEXT_DATA__".to_string(),
        message: e.to_string(),
    })?;
    let script = document
        .select(&sel)
        .next()
        .ok_or_else(|| AdapterError::Message("page has no __NEXT_DATA__ script".to_string()))?;
    serde_json::from_str(&script.text().collect::<String>())
        .map_err(|e| AdapterError::Message(format!("invalid __NEXT_DATA__ JSON: {e}")))
}

pub fn listing_paths(page_url: &str, html: &str) -> Result<Vec<String>, AdapterError> {
    let state = next_data(html)?;
    let Some(edges) = json_at(&state, LISTING_EDGES).and_then(JsonValue::as_array) else {
        return Ok(Vec::new());
    };
    Ok(edges
        .iter()
        .filter_map(|edge| json_str(edge, &["node", "pretty_path"]))
        .filter_map(|path| resolve_url(page_url, &path).ok())
        .collect())
}

/// Map the listing state onto raw fields. Monthly averages keep their period marker.
pub fn listing_from_state(url: &str, html: &str) -> Result<RawListing, AdapterError> {
    let state = next_data(html)?;
    let listing = json_at(&state, LISTING_STATE)
        .ok_or_else(|| AdapterError::Message("__NEXT_DATA__ has no listing state".to_string()))?;

    let mut raw = RawListing::new(url);
    raw.title = json_str(listing, &["title"]);
    raw.description = json_str(listing, &["summary"]);
    raw.category = json_str(listing, &["category", "name"]);
    raw.asking_price = json_f64(listing, &["price_usd"]).map(|v| usd(v, ""));
    raw.revenue = json_f64(listing, &["financials", "average_monthly_revenue_usd"])
        .map(|v| usd(v, " per month"));
    raw.profit = json_f64(listing, &["financials", "average_monthly_profit_usd"])
        .map(|v| usd(v, " per month"));

    let city = json_str(listing, &["location", "city"]);
    let country = json_str(listing, &["location", "country"]);
    raw.location = match (city, country) {
        (Some(city), Some(country)) => Some(format!("{city}, {country}")),
        (city, country) => city.or(country),
    };

    raw.niches = json_string_vec(listing, &["monetizations"])
        .or_else(|| raw.category.clone().map(|c| vec![c]))
        .unwrap_or_default();
    Ok(raw)
}

pub struct NextDataSiteAdapter {
    profile: SiteProfile,
    pages: Arc<dyn PageSource>,
}

impl NextDataSiteAdapter {
    pub fn new(profile: SiteProfile, pages: Arc<dyn PageSource>) -> Self {
        Self { profile, pages }
    }
}

#[async_trait]
impl SiteAdapter for NextDataSiteAdapter {
    fn source_id(&self) -> &str {
        &self.profile.source_id
    }

    async fn list_urls(&self, limit: Option<usize>) -> Result<UrlListing, AdapterError> {
        paginate(&self.profile, self.pages.as_ref(), limit, listing_paths).await
    }

    async fn fetch_listing(&self, url: &str) -> Result<RawListing, FetchError> {
        let page = self.pages.get(&self.profile.source_id, url).await?;
        listing_from_state(url, &page.text()).map_err(|err| FetchError::permanent(url, err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::next_data_profile;
    use crate::StaticPageSource;

    fn page(state: &str) -> String {
        format!(
            r#"<html><body><div id="__next"></div><script id="__NEXT_DATA__" type="application/json">{state}</script></body></html>"#
        )
    }

    #[test]
    fn search_state_yields_absolute_listing_urls() {
        let html = page(
            r#"{"props":{"pageProps":{"data":{"search":{"listings":{"edges":[
                {"node":{"pretty_path":"/10001-widget-store"}},
                {"node":{"pretty_path":"/10002-gadget-blog"}},
                {"node":{}}
            ]}}}}}}"#,
        );
        let urls = listing_paths("https://flippa.com/search?page=1", &html).unwrap();
        assert_eq!(
            urls,
            vec![
                "https://flippa.com/10001-widget-store".to_string(),
                "https://flippa.com/10002-gadget-blog".to_string(),
            ]
        );
    }

    #[test]
    fn listing_state_maps_monthly_financials() {
        let html = page(
            r#"{"props":{"pageProps":{"listing":{
                "title":"Widget Store","summary":"Shopify widget shop","price_usd":120000,
                "financials":{"average_monthly_revenue_usd":9000,"average_monthly_profit_usd":2500.5},
                "location":{"city":"Austin","country":"United States"},
                "category":{"name":"Ecommerce"}
            }}}}"#,
        );
        let raw = listing_from_state("https://flippa.com/10001-widget-store", &html).unwrap();
        assert_eq!(raw.title.as_deref(), Some("Widget Store"));
        assert_eq!(raw.asking_price.as_deref(), Some("$120000"));
        assert_eq!(raw.revenue.as_deref(), Some("$9000 per month"));
        assert_eq!(raw.profit.as_deref(), Some("$2500.5 per month"));
        assert_eq!(raw.location.as_deref(), Some("Austin, United States"));
        assert_eq!(raw.niches, vec!["Ecommerce".to_string()]);
    }

    #[test]
    fn missing_state_is_an_error() {
        assert!(listing_from_state("https://flippa.com/1", "<html></html>").is_err());
    }

    #[tokio::test]
    async fn adapter_pages_through_search_results() {
        let mut profile = next_data_profile("flippa").unwrap();
        profile.search_urls = vec!["https://flippa.com/search".into()];
        let first = page(r#"{"props":{"pageProps":{"data":{"search":{"listings":{"edges":[{"node":{"pretty_path":"/1-a"}}]}}}}}}"#);
        let empty = page(r#"{"props":{"pageProps":{"data":{"search":{"listings":{"edges":[]}}}}}}"#);
        let pages = StaticPageSource::new()
            .with_page("https://flippa.com/search?page=1", first)
            .with_page("https://flippa.com/search?page=2", empty);
        let adapter = NextDataSiteAdapter::new(profile, Arc::new(pages));

        let listing = adapter.list_urls(None).await.unwrap();
        assert_eq!(listing.urls, vec!["https://flippa.com/1-a".to_string()]);
        assert_eq!(listing.pages_scraped, 2);
    }
}
