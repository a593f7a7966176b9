//! Client identifier resolution
//!
//! The identifier is the rate-limit bucket: caller address plus the
//! addressed resource. It is never derived from a user account.

use axum::http::HeaderMap;

/// Public form-submission path prefix
pub const SUBMIT_PREFIX: &str = "/api/submit";

/// Address used when no forwarding header is present
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Headers consulted for the caller address, in order. No single header is
/// trusted exclusively because deployment front-ends vary.
const ADDRESS_HEADERS: [&str; 3] = ["x-forwarded-for", "x-real-ip", "cf-connecting-ip"];

/// Form endpoint addressed by a submission path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionTarget<'a> {
    pub project_id: &'a str,
    pub endpoint_path: &'a str,
}

/// Derives rate-limit identifiers from request metadata
#[derive(Debug, Clone)]
pub struct IdentifierResolver {
    submit_prefix: String,
}

impl Default for IdentifierResolver {
    fn default() -> Self {
        Self::new(SUBMIT_PREFIX)
    }
}

impl IdentifierResolver {
    pub fn new(submit_prefix: impl Into<String>) -> Self {
        let prefix: String = submit_prefix.into();
        Self {
            submit_prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// `{address}:{projectId}:{endpointPath}` for submission paths,
    /// `{address}:{path}` for everything else (including malformed
    /// submission paths).
    pub fn resolve(&self, path: &str, headers: &HeaderMap) -> String {
        let address = resolve_source_address(headers);

        match self.parse_submission_path(path) {
            Some(target) => format!(
                "{}:{}:{}",
                address, target.project_id, target.endpoint_path
            ),
            None => format!("{}:{}", address, path),
        }
    }

    /// Parse `/api/submit/{projectId}/{endpointPath}`; both segments must be
    /// non-empty. Segments after the endpoint are ignored.
    pub fn parse_submission_path<'a>(&self, path: &'a str) -> Option<SubmissionTarget<'a>> {
        let rest = path.strip_prefix(self.submit_prefix.as_str())?;
        let rest = rest.strip_prefix('/')?;

        let mut segments = rest.split('/');
        let project_id = segments.next().filter(|s| !s.is_empty())?;
        let endpoint_path = segments.next().filter(|s| !s.is_empty())?;

        Some(SubmissionTarget {
            project_id,
            endpoint_path,
        })
    }
}

/// First present of `x-forwarded-for` (its first hop), `x-real-ip`,
/// `cf-connecting-ip`, else `unknown`.
pub fn resolve_source_address(headers: &HeaderMap) -> String {
    ADDRESS_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(',').next())
        .map(str::trim)
        .find(|address| !address.is_empty())
        .unwrap_or(UNKNOWN_ADDRESS)
        .to_string()
}
