//! Built-in marketplace profiles.

use crate::html::{strings, Pagination, RowSelector, SiteProfile};
use crate::AdapterMode;

pub const BUILTIN_SOURCES: &[&str] = &[
    "bizbuysell",
    "bizquest",
    "quietlight",
    "websiteproperties",
    "empireflippers",
    "websiteclosers",
    "flippa",
];

pub fn default_mode(source_id: &str) -> AdapterMode {
    match source_id {
        "flippa" => AdapterMode::NextData,
        _ => AdapterMode::Html,
    }
}

pub fn display_name(source_id: &str) -> &str {
    match source_id {
        "bizbuysell" => "BizBuySell",
        "bizquest" => "BizQuest",
        "quietlight" => "QuietLight",
        "websiteproperties" => "WebsiteProperties",
        "empireflippers" => "EmpireFlippers",
        "websiteclosers" => "WebsiteClosers",
        "flippa" => "Flippa",
        other => other,
    }
}

fn label_value_rows() -> Vec<RowSelector> {
    vec![
        RowSelector::new("table tr", "th, td", "td"),
        RowSelector::new("dl.financials div, .financial-item, .listing-metric", "dt, .label, span", "dd, .value, strong"),
    ]
}

pub fn html_profile(source_id: &str) -> Option<SiteProfile> {
    let profile = match source_id {
        "bizbuysell" => SiteProfile {
            max_pages: 3,
            link_selector: "div.search-result-card a[href]".into(),
            detail_path_markers: strings(&["/business-opportunity/", "/business-for-sale/", "/amazon-store"]),
            json_ld: true,
            title: strings(&["h1.font-h1-new", "h1"]),
            description: strings(&["div.business-description"]),
            location: strings(&["div.location", "span.location"]),
            asking_price: strings(&["div.asking-price", "span.price"]),
            financial_rows: vec![RowSelector::new("div.financials-desktop__wrapper--item", "p", "p")],
            ..SiteProfile::new(
                "bizbuysell",
                &["https://www.bizbuysell.com/amazon-stores-for-sale/"],
                Pagination::PathSuffix,
            )
        },
        "bizquest" => SiteProfile {
            link_selector: "div.search-result-card-container a[href]".into(),
            detail_path_markers: strings(&["/business-for-sale/"]),
            title: strings(&["h1.font-h1-new", "h1"]),
            description: strings(&["div.business-description"]),
            financial_rows: vec![RowSelector::new("table.table-striped tr", "th, td", "td")],
            ..SiteProfile::new(
                "bizquest",
                &[
                    "https://www.bizquest.com/dynamic/search/businesses-for-sale/",
                    "https://www.bizquest.com/amazon-business-for-sale/",
                ],
                Pagination::QueryParam("page".into()),
            )
        },
        "quietlight" => SiteProfile {
            detail_path_markers: strings(&["/listings/"]),
            title: strings(&["h1.listing-title", "h1", "h2.listing-title"]),
            description: strings(&["div.listing-description", "div.entry-content"]),
            category: strings(&["span.listing-category", "a[rel=tag]"]),
            asking_price: strings(&["span.asking-price", "div.price"]),
            financial_rows: label_value_rows(),
            ..SiteProfile::new(
                "quietlight",
                &[
                    "https://quietlight.com/amazon-fba-businesses-for-sale/",
                    "https://quietlight.com/ecommerce-businesses-for-sale/",
                ],
                Pagination::PathSegment,
            )
        },
        "websiteproperties" => SiteProfile {
            detail_path_markers: strings(&["/properties/", "/websites/"]),
            title: strings(&["h1.property-title", "h1.entry-title", "h1"]),
            description: strings(&["div.property-description", "div.entry-content"]),
            asking_price: strings(&["span.price", "div.price"]),
            financial_rows: label_value_rows(),
            ..SiteProfile::new(
                "websiteproperties",
                &["https://websiteproperties.com/websites-for-sale/"],
                Pagination::PathSegment,
            )
        },
        "empireflippers" => SiteProfile {
            detail_path_markers: strings(&["/listing/"]),
            title: strings(&["h1.listing-title", "h1"]),
            description: strings(&["div.listing-description", "div.description"]),
            niches: strings(&["span.niche", "a.niche-tag"]),
            asking_price: strings(&["span.listing-price", "div.price"]),
            financial_rows: label_value_rows(),
            ..SiteProfile::new(
                "empireflippers",
                &[
                    "https://empireflippers.com/marketplace/",
                    "https://empireflippers.com/marketplace/amazon-fba-businesses-for-sale/",
                ],
                Pagination::QueryParam("page".into()),
            )
        },
        "websiteclosers" => SiteProfile {
            max_pages: 1,
            link_selector: "a.listing-link[href], div.listing-item a[href], h3.listing-title a[href], a[href*=\"/listing/\"]".into(),
            detail_path_markers: strings(&["/listing/"]),
            title: strings(&["h1.entry-title", "h1"]),
            description: strings(&["div.listing-description", "div.entry-content"]),
            asking_price: strings(&["span.asking-price", "div.price"]),
            financial_rows: label_value_rows(),
            ..SiteProfile::new(
                "websiteclosers",
                &[
                    "https://www.websiteclosers.com/businesses-for-sale/",
                    "https://www.websiteclosers.com/listings/",
                ],
                Pagination::Single,
            )
        },
        _ => return None,
    };
    Some(profile)
}

/// Search-page settings for sources read from embedded Next.js state.
pub fn next_data_profile(source_id: &str) -> Option<SiteProfile> {
    match source_id {
        "flippa" => Some(SiteProfile {
            max_pages: 5,
            ..SiteProfile::new(
                "flippa",
                &[
                    "https://flippa.com/search?filter[property_type][]=website",
                    "https://flippa.com/buy/monetization/amazon-fba",
                ],
                Pagination::QueryParam("page".into()),
            )
        }),
        _ => None,
    }
}
