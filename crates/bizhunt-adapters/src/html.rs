//! Selector-driven adapter for server-rendered marketplace pages.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bizhunt_core::{resolve_url, FetchError, FinancialKind, RawListing};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use tracing::debug;
use url::Url;

use crate::{AdapterError, PageSource, SiteAdapter, UrlListing};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pagination {
    /// One page per search URL.
    Single,
    /// `?<name>=N` appended to the search URL.
    QueryParam(String),
    /// `/page/N/` after the search URL; page 1 is the bare URL.
    PathSegment,
    /// `N/` after the search URL, page 1 included.
    PathSuffix,
}

impl Pagination {
    pub fn page_url(&self, base: &str, page: usize) -> Result<String, AdapterError> {
        Ok(match self {
            Pagination::Single => base.to_string(),
            Pagination::QueryParam(name) => {
                let mut url = Url::parse(base)
                    .map_err(|e| AdapterError::Message(format!("invalid search url {base}: {e}")))?;
                url.query_pairs_mut().append_pair(name, &page.to_string());
                url.to_string()
            }
            Pagination::PathSegment if page <= 1 => base.to_string(),
            Pagination::PathSegment => format!("{}/page/{page}/", base.trim_end_matches('/')),
            Pagination::PathSuffix => format!("{}/{page}/", base.trim_end_matches('/')),
        })
    }
}

/// Label/value rows such as `<tr><th>Cash Flow</th><td>$310,000</td></tr>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSelector {
    pub row: String,
    /// First match inside the row is the label.
    pub label: String,
    /// Last match inside the row is the value.
    pub value: String,
}

impl RowSelector {
    pub fn new(row: &str, label: &str, value: &str) -> Self {
        Self {
            row: row.to_string(),
            label: label.to_string(),
            value: value.to_string(),
        }
    }
}

/// Where a marketplace keeps its listing links and listing fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteProfile {
    pub source_id: String,
    pub search_urls: Vec<String>,
    pub pagination: Pagination,
    pub max_pages: usize,
    pub link_selector: String,
    /// A link must contain one of these path fragments (any link when empty).
    pub detail_path_markers: Vec<String>,
    /// Read `application/ld+json` blocks before falling back to selectors.
    pub json_ld: bool,
    pub title: Vec<String>,
    pub description: Vec<String>,
    pub category: Vec<String>,
    pub location: Vec<String>,
    pub niches: Vec<String>,
    pub asking_price: Vec<String>,
    pub revenue: Vec<String>,
    pub profit: Vec<String>,
    pub cash_flow: Vec<String>,
    pub financial_rows: Vec<RowSelector>,
}

impl SiteProfile {
    pub fn new(source_id: &str, search_urls: &[&str], pagination: Pagination) -> Self {
        Self {
            source_id: source_id.to_string(),
            search_urls: search_urls.iter().map(|s| s.to_string()).collect(),
            pagination,
            max_pages: 5,
            link_selector: "a[href]".to_string(),
            detail_path_markers: Vec::new(),
            json_ld: false,
            title: strings(&["h1"]),
            description: Vec::new(),
            category: Vec::new(),
            location: Vec::new(),
            niches: Vec::new(),
            asking_price: Vec::new(),
            revenue: Vec::new(),
            profit: Vec::new(),
            cash_flow: Vec::new(),
            financial_rows: Vec::new(),
        }
    }

    pub fn apply_overrides(&mut self, search_urls: &[String], max_pages: Option<usize>) {
        if !search_urls.is_empty() {
            self.search_urls = search_urls.to_vec();
        }
        if let Some(max_pages) = max_pages {
            self.max_pages = max_pages.max(1);
        }
    }

    fn selectors_for(&self, kind: FinancialKind) -> &[String] {
        match kind {
            FinancialKind::AskingPrice => &self.asking_price,
            FinancialKind::Revenue => &self.revenue,
            FinancialKind::Profit => &self.profit,
            FinancialKind::CashFlow => &self.cash_flow,
        }
    }
}

pub(crate) fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(&element.text().collect::<String>())
}

fn select_first_text(scope: ElementRef<'_>, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).find_map(element_text))
}

fn select_last_text(scope: ElementRef<'_>, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).filter_map(element_text).last())
}

fn select_all_texts(scope: ElementRef<'_>, css: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).filter_map(element_text).collect())
}

/// First non-empty text among a list of fallback selectors.
fn first_of(scope: ElementRef<'_>, selectors: &[String]) -> Result<Option<String>, AdapterError> {
    for css in selectors {
        if let Some(text) = select_first_text(scope, css)? {
            return Ok(Some(text));
        }
    }
    Ok(None)
}

fn fill(target: &mut Option<String>, value: Option<String>) {
    if target.is_none() {
        *target = value;
    }
}

fn json_ld_blocks(document: &Html) -> Result<Vec<JsonValue>, AdapterError> {
    let sel = selector(r#"script[type="application/ld+json"]"#)?;
    Ok(document
        .select(&sel)
        .filter_map(|node| serde_json::from_str::<JsonValue>(&node.text().collect::<String>()).ok())
        .collect())
}

fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    match current {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Listing links on one search results page, resolved and de-duplicated.
pub fn extract_listing_links(
    profile: &SiteProfile,
    page_url: &str,
    html: &str,
) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(html);
    let mut hrefs: Vec<String> = Vec::new();

    if profile.json_ld {
        for block in json_ld_blocks(&document)? {
            let items = block
                .get("about")
                .or_else(|| block.get("itemListElement"))
                .and_then(JsonValue::as_array);
            for item in items.into_iter().flatten() {
                if let Some(url) = json_text(item, &["item", "url"]).or_else(|| json_text(item, &["url"])) {
                    hrefs.push(url);
                }
            }
        }
    }

    let link_sel = selector(&profile.link_selector)?;
    hrefs.extend(
        document
            .select(&link_sel)
            .filter_map(|node| node.value().attr("href"))
            .map(str::to_string),
    );

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for href in hrefs {
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:") {
            continue;
        }
        let Ok(absolute) = resolve_url(page_url, href) else {
            continue;
        };
        let wanted = profile.detail_path_markers.is_empty()
            || profile
                .detail_path_markers
                .iter()
                .any(|marker| absolute.contains(marker.as_str()));
        if wanted && seen.insert(absolute.clone()) {
            out.push(absolute);
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowField {
    Financial(FinancialKind),
    Location,
    Category,
}

fn classify_label(label: &str) -> Option<RowField> {
    let label = label.to_lowercase();
    let has = |needle: &str| label.contains(needle);
    if has("asking price") || label.trim_end_matches(':') == "price" {
        Some(RowField::Financial(FinancialKind::AskingPrice))
    } else if has("cash flow") || has("sde") || has("discretionary") {
        Some(RowField::Financial(FinancialKind::CashFlow))
    } else if has("profit") || has("net income") || has("ebitda") {
        Some(RowField::Financial(FinancialKind::Profit))
    } else if has("revenue") || has("sales") {
        Some(RowField::Financial(FinancialKind::Revenue))
    } else if has("location") {
        Some(RowField::Location)
    } else if has("industry") || has("category") || has("business type") || has("niche") {
        Some(RowField::Category)
    } else {
        None
    }
}

fn mentions_period(value: &str) -> bool {
    let value = value.to_lowercase();
    ["/mo", "month", "/yr", "year", "annual", "ttm"]
        .iter()
        .any(|marker| value.contains(marker))
}

/// Extract raw fields from one listing page.
pub fn parse_listing_page(
    profile: &SiteProfile,
    url: &str,
    html: &str,
) -> Result<RawListing, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let mut raw = RawListing::new(url);

    if profile.json_ld {
        for block in json_ld_blocks(&document)? {
            fill(&mut raw.title, json_text(&block, &["name"]));
            fill(&mut raw.description, json_text(&block, &["description"]));
            if let Some(price) = json_text(&block, &["offers", "price"]) {
                let currency = json_text(&block, &["offers", "priceCurrency"]);
                fill(
                    &mut raw.asking_price,
                    Some(match currency {
                        Some(code) => format!("{code} {price}"),
                        None => format!("${price}"),
                    }),
                );
            }
            let city = json_text(&block, &["offers", "availableAtOrFrom", "address", "addressLocality"]);
            let region = json_text(&block, &["offers", "availableAtOrFrom", "address", "addressRegion"]);
            let location = match (city, region) {
                (Some(city), Some(region)) => Some(format!("{city}, {region}")),
                (city, region) => city.or(region),
            };
            fill(&mut raw.location, location);
        }
    }

    fill(&mut raw.title, first_of(root, &profile.title)?);
    fill(&mut raw.description, first_of(root, &profile.description)?);
    fill(&mut raw.category, first_of(root, &profile.category)?);
    fill(&mut raw.location, first_of(root, &profile.location)?);
    for kind in FinancialKind::ALL {
        let value = first_of(root, profile.selectors_for(kind))?;
        fill(raw.financial_mut(kind), value);
    }

    for rows in &profile.financial_rows {
        let row_sel = selector(&rows.row)?;
        for row in root.select(&row_sel) {
            let (Some(label), Some(value)) = (
                select_first_text(row, &rows.label)?,
                select_last_text(row, &rows.value)?,
            ) else {
                continue;
            };
            if label == value {
                continue;
            }
            match classify_label(&label) {
                Some(RowField::Financial(kind)) => {
                    let monthly_label = label.to_lowercase().contains("monthly");
                    let value = if monthly_label && !mentions_period(&value) {
                        format!("{value} per month")
                    } else {
                        value
                    };
                    fill(raw.financial_mut(kind), Some(value));
                }
                Some(RowField::Location) => fill(&mut raw.location, Some(value)),
                Some(RowField::Category) => fill(&mut raw.category, Some(value)),
                None => {}
            }
        }
    }

    for css in &profile.niches {
        raw.niches.extend(select_all_texts(root, css)?);
    }
    if raw.niches.is_empty() {
        if let Some(category) = &raw.category {
            raw.niches.push(category.clone());
        }
    }

    Ok(raw)
}

pub struct HtmlSiteAdapter {
    profile: SiteProfile,
    pages: Arc<dyn PageSource>,
}

impl HtmlSiteAdapter {
    pub fn new(profile: SiteProfile, pages: Arc<dyn PageSource>) -> Self {
        Self { profile, pages }
    }

    pub fn profile(&self) -> &SiteProfile {
        &self.profile
    }
}

/// Walk every search URL page by page, collecting links until a page adds
/// nothing new, `max_pages` is reached, or `limit` links are collected.
pub(crate) async fn paginate<F>(
    profile: &SiteProfile,
    pages: &dyn PageSource,
    limit: Option<usize>,
    mut links_on_page: F,
) -> Result<UrlListing, AdapterError>
where
    F: FnMut(&str, &str) -> Result<Vec<String>, AdapterError> + Send,
{
    let mut listing = UrlListing::default();
    let mut seen = HashSet::new();

    'search: for base in &profile.search_urls {
        for page in 1..=profile.max_pages.max(1) {
            let page_url = profile.pagination.page_url(base, page)?;
            let fetched = pages.get(&profile.source_id, &page_url).await?;
            listing.pages_scraped += 1;

            let links = links_on_page(&page_url, &fetched.text())?;
            let mut fresh = 0usize;
            for link in links {
                if !seen.insert(link.clone()) {
                    continue;
                }
                if limit.is_some_and(|limit| listing.urls.len() >= limit) {
                    listing.truncated = true;
                    break 'search;
                }
                listing.urls.push(link);
                fresh += 1;
            }
            debug!(source_id = %profile.source_id, page_url = %page_url, fresh, "search page parsed");

            if fresh == 0 || profile.pagination == Pagination::Single {
                break;
            }
        }
    }
    Ok(listing)
}

#[async_trait]
impl SiteAdapter for HtmlSiteAdapter {
    fn source_id(&self) -> &str {
        &self.profile.source_id
    }

    async fn list_urls(&self, limit: Option<usize>) -> Result<UrlListing, AdapterError> {
        let profile = &self.profile;
        paginate(profile, self.pages.as_ref(), limit, |page_url, body| {
            extract_listing_links(profile, page_url, body)
        })
        .await
    }

    async fn fetch_listing(&self, url: &str) -> Result<RawListing, FetchError> {
        let page = self.pages.get(&self.profile.source_id, url).await?;
        parse_listing_page(&self.profile, url, &page.text())
            .map_err(|err| FetchError::permanent(url, err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::html_profile;
    use crate::StaticPageSource;

    const SEARCH_PAGE: &str = r#"
        <html><body>
          <div class="search-result-card-container"><a href="/business-for-sale/widget-co/1001/">Widget Co</a></div>
          <div class="search-result-card-container"><a href="/business-for-sale/gadget-co/1002/?utm_source=list">Gadget Co</a></div>
          <div class="search-result-card-container"><a href="/business-for-sale/widget-co/1001/">dup</a></div>
          <a href="/about-us/">About</a>
        </body></html>
    "#;

    const BIZQUEST_DETAIL: &str = r#"
        <html><body>
          <h1 class="font-h1-new">  Widget   Co </h1>
          <div class="business-description">Profitable widget manufacturer.</div>
          <table class="table-striped">
            <tr><th>Asking Price:</th><td>$1.2M</td></tr>
            <tr><th>Gross Revenue:</th><td>$600K</td></tr>
            <tr><th>Cash Flow:</th><td>$310,000</td></tr>
            <tr><th>Location:</th><td>Austin, TX</td></tr>
            <tr><th>Industry:</th><td>Manufacturing</td></tr>
          </table>
        </body></html>
    "#;

    #[test]
    fn pagination_styles() {
        let q = Pagination::QueryParam("page".into());
        assert_eq!(
            q.page_url("https://www.bizquest.com/search/", 2).unwrap(),
            "https://www.bizquest.com/search/?page=2"
        );
        assert_eq!(
            q.page_url("https://flippa.com/search?filter[property_type][]=website", 3).unwrap(),
            "https://flippa.com/search?filter[property_type][]=website&page=3"
        );
        assert_eq!(
            Pagination::PathSegment.page_url("https://quietlight.com/listings/", 1).unwrap(),
            "https://quietlight.com/listings/"
        );
        assert_eq!(
            Pagination::PathSegment.page_url("https://quietlight.com/listings/", 3).unwrap(),
            "https://quietlight.com/listings/page/3/"
        );
        assert_eq!(
            Pagination::PathSuffix.page_url("https://www.bizbuysell.com/amazon-stores-for-sale/", 1).unwrap(),
            "https://www.bizbuysell.com/amazon-stores-for-sale/1/"
        );
    }

    #[test]
    fn links_are_resolved_filtered_and_deduplicated() {
        let profile = html_profile("bizquest").unwrap();
        let links = extract_listing_links(&profile, "https://www.bizquest.com/search/?page=1", SEARCH_PAGE).unwrap();
        assert_eq!(
            links,
            vec![
                "https://www.bizquest.com/business-for-sale/widget-co/1001/".to_string(),
                "https://www.bizquest.com/business-for-sale/gadget-co/1002/?utm_source=list".to_string(),
            ]
        );
    }

    #[test]
    fn detail_rows_map_onto_raw_fields() {
        let profile = html_profile("bizquest").unwrap();
        let raw = parse_listing_page(&profile, "https://www.bizquest.com/b/1", BIZQUEST_DETAIL).unwrap();
        assert_eq!(raw.title.as_deref(), Some("Widget Co"));
        assert_eq!(raw.description.as_deref(), Some("Profitable widget manufacturer."));
        assert_eq!(raw.asking_price.as_deref(), Some("$1.2M"));
        assert_eq!(raw.revenue.as_deref(), Some("$600K"));
        assert_eq!(raw.cash_flow.as_deref(), Some("$310,000"));
        assert_eq!(raw.profit, None);
        assert_eq!(raw.location.as_deref(), Some("Austin, TX"));
        assert_eq!(raw.category.as_deref(), Some("Manufacturing"));
        assert_eq!(raw.niches, vec!["Manufacturing".to_string()]);
    }

    #[test]
    fn json_ld_takes_precedence_and_monthly_labels_carry_period() {
        let html = r#"
            <html><head>
              <script type="application/ld+json">
                {"name": "Pet Supply Store", "description": "Online pet store",
                 "offers": {"price": 450000, "availableAtOrFrom": {"address": {"addressLocality": "Tampa", "addressRegion": "FL"}}}}
              </script>
            </head><body>
              <h1 class="font-h1-new">Ignored Title</h1>
              <div class="financials-desktop__wrapper--item"><p>Monthly Net Profit</p><p>$8,000</p></div>
            </body></html>
        "#;
        let profile = html_profile("bizbuysell").unwrap();
        let raw = parse_listing_page(&profile, "https://www.bizbuysell.com/b/9", html).unwrap();
        assert_eq!(raw.title.as_deref(), Some("Pet Supply Store"));
        assert_eq!(raw.asking_price.as_deref(), Some("$450000"));
        assert_eq!(raw.location.as_deref(), Some("Tampa, FL"));
        assert_eq!(raw.profit.as_deref(), Some("$8,000 per month"));
    }

    #[tokio::test]
    async fn enumeration_stops_on_a_page_without_new_links() {
        let mut profile = html_profile("bizquest").unwrap();
        profile.search_urls = vec!["https://www.bizquest.com/search/".into()];
        let pages = StaticPageSource::new()
            .with_page("https://www.bizquest.com/search/?page=1", SEARCH_PAGE)
            .with_page("https://www.bizquest.com/search/?page=2", SEARCH_PAGE);
        let adapter = HtmlSiteAdapter::new(profile, Arc::new(pages));

        let listing = adapter.list_urls(None).await.unwrap();
        assert_eq!(listing.urls.len(), 2);
        assert_eq!(listing.pages_scraped, 2);
        assert!(!listing.truncated);

        let limited = adapter.list_urls(Some(1)).await.unwrap();
        assert_eq!(limited.urls.len(), 1);
        assert!(limited.truncated);
    }

    #[tokio::test]
    async fn a_failed_search_page_fails_the_enumeration() {
        let mut profile = html_profile("bizquest").unwrap();
        profile.search_urls = vec!["https://www.bizquest.com/search/".into()];
        profile.pagination = Pagination::QueryParam("p".into());
        let adapter = HtmlSiteAdapter::new(profile, Arc::new(StaticPageSource::new()));
        assert!(matches!(adapter.list_urls(None).await, Err(AdapterError::Fetch(_))));
    }

    #[tokio::test]
    async fn fetch_listing_parses_the_detail_page() {
        let url = "https://www.bizquest.com/business-for-sale/widget-co/1001/";
        let pages = StaticPageSource::new().with_page(url, BIZQUEST_DETAIL);
        let adapter = HtmlSiteAdapter::new(html_profile("bizquest").unwrap(), Arc::new(pages));
        let raw = adapter.fetch_listing(url).await.unwrap();
        assert_eq!(raw.url, url);
        assert_eq!(raw.title.as_deref(), Some("Widget Co"));

        let missing = adapter.fetch_listing("https://www.bizquest.com/gone/").await.unwrap_err();
        assert!(!missing.is_transient());
    }
}
