//! Wire format shared by the HTTP service and [`VolumeClient`](crate::client::volume_client::VolumeClient).

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

pub const ROUTE_RESERVE: &str = "/reserve/";
pub const ROUTE_RELEASE: &str = "/release/";
pub const ROUTE_REPORT: &str = "/report/";
pub const ROUTE_PING: &str = "/ping/";

pub const PATH_REQUIRED: &str = "Param 'path' is required.";
pub const BYTES_INVALID: &str = "Param 'bytes' must be an integer greater than zero.";

/// JSON body of every service response.
///
/// `{"Succeeded":true,"ErrorMessage":"","Data":null}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeResponse {
    pub succeeded: bool,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub data: Option<BTreeMap<String, u64>>,
}

impl VolumeResponse {
    #[must_use]
    pub fn success() -> Self {
        Self {
            succeeded: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_data(data: BTreeMap<String, u64>) -> Self {
        Self {
            succeeded: true,
            error_message: String::new(),
            data: Some(data),
        }
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            error_message: message.into(),
            data: None,
        }
    }
}

/// Request parameters merged HTML-form style: query string first, then an
/// urlencoded body whose values win. Within one source the first value of a
/// repeated key is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormParams {
    values: HashMap<String, String>,
}

impl FormParams {
    #[must_use]
    pub fn parse(query: &str, body: Option<&[u8]>) -> Self {
        let mut values = first_values(query.as_bytes());
        if let Some(body) = body {
            values.extend(first_values(body));
        }
        Self { values }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Non-empty `path` parameter.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.get("path").filter(|path| !path.is_empty())
    }

    /// `bytes` parameter when it is a positive integer.
    #[must_use]
    pub fn bytes(&self) -> Option<u64> {
        self.get("bytes")
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|bytes| *bytes > 0)
    }
}

fn first_values(input: &[u8]) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(input) {
        values
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    values
}

/// Canonical route for a URL path: `/reserve` and `/reserve/` both map to
/// [`ROUTE_RESERVE`]. Unknown paths return `None`.
#[must_use]
pub fn canonical_route(url_path: &str) -> Option<&'static str> {
    let trimmed = url_path.trim_end_matches('/');
    [ROUTE_RESERVE, ROUTE_RELEASE, ROUTE_REPORT, ROUTE_PING]
        .into_iter()
        .find(|route| route.trim_end_matches('/') == trimmed)
}
