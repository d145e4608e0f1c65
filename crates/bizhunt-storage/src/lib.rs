//! Listing persistence, raw page archive and HTTP fetch utilities.

pub mod archive;
pub mod http;
pub mod listings;
pub mod postgres;
pub mod throttle;

pub use archive::{sha256_hex, write_atomic, ArchivedPage, RawPageArchive};
pub use http::{
    classify_reqwest_error, classify_status, FetchedPage, HttpClientConfig, HttpError,
    HttpFetcher, ProxyConfig, RetryDisposition,
};
pub use listings::{ListingStore, MemoryListingStore};
pub use postgres::PgListingStore;
pub use throttle::{BackoffPolicy, SimpleTokenBucket, TokenBucketConfig};

pub const CRATE_NAME: &str = "bizhunt-storage";
