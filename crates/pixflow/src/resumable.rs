//! Partially downloaded data that can be resumed with an HTTP range request.

use std::collections::HashSet;
use std::sync::OnceLock;

use bytes::Bytes;
use moka::sync::Cache;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT_RANGES, ETAG, HeaderMap, HeaderValue, IF_RANGE, LAST_MODIFIED, RANGE};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::loader::UrlResponse;
use crate::request::ImageRequest;

/// Upper bound on the payload kept across all pipelines.
pub const RESUMABLE_DATA_CAPACITY: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumableData {
    pub data: Bytes,
    pub validator: String,
}

impl ResumableData {
    /// Build a resumable record when the interrupted response allows it.
    ///
    /// Requires non-empty data shorter than the expected length, a 200 or 206
    /// status, byte range support and a validator (`ETag`, else
    /// `Last-Modified`).
    pub fn new(response: &UrlResponse, data: Bytes) -> Option<Self> {
        let expected = response.expected_content_length?;
        if data.is_empty() || data.len() as u64 >= expected {
            return None;
        }
        if !matches!(response.status, 200 | 206) {
            return None;
        }
        let accepts_ranges = header_str(&response.headers, ACCEPT_RANGES.as_str())
            .is_some_and(|value| value.eq_ignore_ascii_case("bytes"));
        if !accepts_ranges {
            return None;
        }
        let validator = header_str(&response.headers, ETAG.as_str())
            .or_else(|| header_str(&response.headers, LAST_MODIFIED.as_str()))?
            .to_owned();
        Some(Self { data, validator })
    }

    /// Ask the server for the remaining bytes.
    pub fn resume(&self, headers: &mut HeaderMap) {
        if let Ok(range) = HeaderValue::from_str(&format!("bytes={}-", self.data.len())) {
            headers.insert(RANGE, range);
        }
        if let Ok(validator) = HeaderValue::from_str(&self.validator) {
            headers.insert(IF_RANGE, validator);
        }
    }

    /// Whether the server honoured the range request.
    pub fn is_resumed_response(response: &UrlResponse) -> bool {
        response.status == 206
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResumableKey {
    pipeline_id: Uuid,
    url: String,
}

#[derive(Default)]
struct StorageState {
    registered: HashSet<Uuid>,
    cache: Option<Cache<ResumableKey, ResumableData>>,
}

/// Process-wide registry of resumable downloads, keyed by pipeline and URL.
///
/// The backing cache exists only while at least one pipeline is registered.
pub struct ResumableDataStorage {
    state: Mutex<StorageState>,
}

impl ResumableDataStorage {
    pub fn shared() -> &'static ResumableDataStorage {
        static SHARED: OnceLock<ResumableDataStorage> = OnceLock::new();
        SHARED.get_or_init(|| ResumableDataStorage {
            state: Mutex::new(StorageState::default()),
        })
    }

    pub fn register(&self, pipeline_id: Uuid) {
        let mut state = self.state.lock();
        if state.registered.is_empty() {
            debug!("Allocating resumable data storage");
            state.cache = Some(
                Cache::builder()
                    .weigher(|_key: &ResumableKey, value: &ResumableData| {
                        u32::try_from(value.data.len()).unwrap_or(u32::MAX)
                    })
                    .max_capacity(RESUMABLE_DATA_CAPACITY)
                    .build(),
            );
        }
        state.registered.insert(pipeline_id);
    }

    pub fn unregister(&self, pipeline_id: Uuid) {
        let mut state = self.state.lock();
        state.registered.remove(&pipeline_id);
        if state.registered.is_empty() {
            debug!("Releasing resumable data storage");
            state.cache = None;
        }
    }

    /// Take the record for `request`, if any. Each record is handed out once.
    pub fn remove_resumable_data(
        &self,
        request: &ImageRequest,
        pipeline_id: Uuid,
    ) -> Option<ResumableData> {
        let cache = self.state.lock().cache.clone()?;
        cache.remove(&ResumableKey {
            pipeline_id,
            url: request.url().to_string(),
        })
    }

    pub fn store_resumable_data(
        &self,
        data: ResumableData,
        request: &ImageRequest,
        pipeline_id: Uuid,
    ) {
        let Some(cache) = self.state.lock().cache.clone() else {
            return;
        };
        trace!(
            url = %request.url(),
            bytes = data.data.len(),
            "Storing resumable data"
        );
        cache.insert(
            ResumableKey {
                pipeline_id,
                url: request.url().to_string(),
            },
            data,
        );
    }

    pub fn is_registered(&self, pipeline_id: Uuid) -> bool {
        self.state.lock().registered.contains(&pipeline_id)
    }
}
