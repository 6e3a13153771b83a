//! Cache page keys
//!
//! A page is identified by its number plus a fingerprint of the listing
//! parameters, so differently filtered listings never overwrite each other.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};

use crate::models::ListQuery;

/// Prefix shared by every durable cache page key
pub const PAGE_KEY_PREFIX: &str = "cache_page_";

/// Hex characters kept from the SHA-256 digest
const FINGERPRINT_LEN: usize = 16;

/// Identifies one cached page
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub page: u32,
    pub fingerprint: String,
}

impl PageKey {
    pub fn new(page: u32, fingerprint: impl Into<String>) -> Self {
        Self {
            page,
            fingerprint: fingerprint.into(),
        }
    }

    /// Key for the page a listing query asks for
    ///
    /// The page size is part of the fingerprint: page 2 of a 20-item listing
    /// holds different entities than page 2 of a 50-item one.
    pub fn for_query(query: &ListQuery) -> Self {
        let mut params = query.filters.clone();
        params.insert("pageSize".to_string(), query.page_size.to_string());
        Self::new(query.page, fingerprint(&params))
    }

    /// Key under which the page is stored durably
    pub fn storage_key(&self) -> String {
        format!("{}{}_{}", PAGE_KEY_PREFIX, self.page, self.fingerprint)
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {} [{}]", self.page, self.fingerprint)
    }
}

/// Normalized hash of listing parameters
///
/// Keys and values are trimmed and lowercased, empty values are dropped and
/// the pairs are sorted before hashing.
pub fn fingerprint(params: &BTreeMap<String, String>) -> String {
    let normalized: BTreeMap<String, String> = params
        .iter()
        .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_lowercase()))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .collect();

    let material = normalized
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let digest = Sha256::digest(material.as_bytes());
    let mut hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex.truncate(FINGERPRINT_LEN);
    hex
}
