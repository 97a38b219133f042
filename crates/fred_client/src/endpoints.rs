//! Known FRED API paths and upstream limits.

use std::time::Duration;

use api_dispatch::endpoint::SEPARATOR;

pub const FRED_API_URL: &str = "https://api.stlouisfed.org/fred";
pub const FRED_DOC_URL: &str = "https://fred.stlouisfed.org/docs/api/fred";

/// Requests allowed per [`FRED_API_RATE_RESET`].
pub const FRED_API_RATE_LIMIT: u32 = 120;
pub const FRED_API_RATE_RESET: Duration = Duration::from_secs(60);

pub const FRED_API_KEY_PARAM: &str = "api_key";
pub const FRED_API_FILE_TYPE: &str = "json";

pub const FRED_API_ENDPOINTS: [&str; 31] = [
    "category",
    "category/children",
    "category/related",
    "category/series",
    "category/tags",
    "category/related_tags",
    "releases",
    "releases/dates",
    "release",
    "release/dates",
    "release/series",
    "release/sources",
    "release/tags",
    "release/related_tags",
    "release/tables",
    "series",
    "series/categories",
    "series/observations",
    "series/release",
    "series/search",
    "series/search/tags",
    "series/search/related_tags",
    "series/tags",
    "series/updates",
    "series/vintagedates",
    "sources",
    "source",
    "source/releases",
    "tags",
    "tags/series",
    "related_tags",
];

/// Documentation page for an endpoint path, e.g. `series/observations` maps
/// to `.../fred/series_observations.html`. The root maps to the index.
pub fn doc_url(path: &str) -> String {
    let page = path.trim_matches(SEPARATOR).replace(SEPARATOR, "_");
    if page.is_empty() {
        format!("{FRED_DOC_URL}/")
    } else {
        format!("{FRED_DOC_URL}/{page}.html")
    }
}
