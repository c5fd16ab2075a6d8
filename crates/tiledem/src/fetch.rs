//! Fetching and validating provider tiles.
//!
//! A fetch never fails the pipeline: every problem a provider can have
//! (HTTP errors, timeouts, garbage payloads, "found" responses that are
//! really empty) becomes [`FetchOutcome::Unavailable`] so the composite can
//! move on to the next source.

use crate::decode::{decode_heights, decode_image};
use crate::geo::TileIndex;
use crate::heights::HeightBuffer;
use crate::source::TileSourceSpec;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tiledem_metrics::{metric_defs, SourceLabels};
use tracing::debug;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 12;

/// Responses shorter than this are not images.
pub const DEFAULT_MIN_BODY_BYTES: usize = 64;

/// Coverage-checked providers must return at least this fraction of valid samples.
///
/// Tuned against the Q-chizu tile service, which answers out-of-coverage
/// requests with tiles painted in its sentinel colour.
pub const DEFAULT_MIN_VALID_FRACTION: f64 = 0.001;

/// Coverage-checked responses with more sentinel or transparent pixels than
/// this are treated as missing.
pub const DEFAULT_MAX_SENTINEL_RATIO: f64 = 0.95;

/// Thresholds applied to provider responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchPolicy {
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Minimum plausible body length.
    pub min_body_bytes: usize,
    /// Minimum valid-sample fraction for coverage-checked sources.
    pub min_valid_fraction: f64,
    /// Maximum sentinel-pixel ratio for coverage-checked sources.
    pub max_sentinel_ratio: f64,
    /// `User-Agent` header sent to providers.
    pub user_agent: String,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            min_body_bytes: DEFAULT_MIN_BODY_BYTES,
            min_valid_fraction: DEFAULT_MIN_VALID_FRACTION,
            max_sentinel_ratio: DEFAULT_MAX_SENTINEL_RATIO,
            user_agent: concat!("tiledem/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl FetchPolicy {
    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Why a source could not supply a tile.
#[derive(Debug, Clone, PartialEq)]
pub enum UnavailableReason {
    /// Non-success HTTP status.
    HttpStatus(u16),
    /// Body too short to be an image.
    BodyTooSmall(usize),
    /// Payload could not be decoded into heights.
    Undecodable(String),
    /// Too few valid samples for a coverage-checked source.
    SparseCoverage(f64),
    /// Too many sentinel/transparent pixels for a coverage-checked source.
    SentinelDominated(f64),
    /// Timeout, connection failure, malformed URL.
    Transport(String),
}

impl UnavailableReason {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::HttpStatus(_) => "http_status",
            Self::BodyTooSmall(_) => "body_too_small",
            Self::Undecodable(_) => "undecodable",
            Self::SparseCoverage(_) => "sparse_coverage",
            Self::SentinelDominated(_) => "sentinel_dominated",
            Self::Transport(_) => "transport",
        }
    }
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpStatus(code) => write!(f, "HTTP {}", code),
            Self::BodyTooSmall(len) => write!(f, "body of {} bytes", len),
            Self::Undecodable(msg) => write!(f, "undecodable: {}", msg),
            Self::SparseCoverage(frac) => write!(f, "valid fraction {:.4}", frac),
            Self::SentinelDominated(ratio) => write!(f, "sentinel ratio {:.3}", ratio),
            Self::Transport(msg) => write!(f, "transport: {}", msg),
        }
    }
}

/// Result of asking one source for one tile.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Decoded heights at the source's native zoom.
    Tile(HeightBuffer),
    /// The source has nothing usable for this tile.
    Unavailable(UnavailableReason),
}

impl FetchOutcome {
    /// Heights, if any.
    pub fn into_tile(self) -> Option<HeightBuffer> {
        match self {
            FetchOutcome::Tile(buf) => Some(buf),
            FetchOutcome::Unavailable(_) => None,
        }
    }
}

/// Anything that can retrieve a decoded tile from a source.
///
/// `tile` is always at the source's native zoom.
pub trait TileFetch {
    /// Fetch one tile.
    fn fetch(&self, source: &TileSourceSpec, tile: TileIndex) -> FetchOutcome;
}

/// Judge a provider response and decode it.
///
/// Pure function of the response so the acceptance rules are testable
/// without a network.
pub fn assess_response(
    status: u16,
    body: &[u8],
    source: &TileSourceSpec,
    policy: &FetchPolicy,
    side: usize,
) -> FetchOutcome {
    if !(200..300).contains(&status) {
        return FetchOutcome::Unavailable(UnavailableReason::HttpStatus(status));
    }
    if body.len() < policy.min_body_bytes {
        return FetchOutcome::Unavailable(UnavailableReason::BodyTooSmall(body.len()));
    }

    let pixels = match decode_image(body) {
        Ok(p) => p,
        Err(e) => return FetchOutcome::Unavailable(UnavailableReason::Undecodable(e.to_string())),
    };

    if source.coverage_check {
        let ratio = pixels.sentinel_ratio(source.decode_format);
        if ratio > policy.max_sentinel_ratio {
            return FetchOutcome::Unavailable(UnavailableReason::SentinelDominated(ratio));
        }
    }

    let heights = match decode_heights(source.decode_format, &pixels, side) {
        Ok(h) => h,
        Err(e) => return FetchOutcome::Unavailable(UnavailableReason::Undecodable(e.to_string())),
    };

    if source.coverage_check {
        let fraction = heights.valid_fraction();
        if fraction < policy.min_valid_fraction {
            return FetchOutcome::Unavailable(UnavailableReason::SparseCoverage(fraction));
        }
    }

    FetchOutcome::Tile(heights)
}

/// Download statistics for a fetcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadStats {
    /// Responses received (any status).
    pub responses: usize,
    /// Total body bytes received.
    pub bytes_downloaded: u64,
}

/// Blocking HTTP fetcher.
///
/// Holds its own connection pool; the scheduler builds one per task.
pub struct HttpTileFetcher {
    client: reqwest::blocking::Client,
    policy: FetchPolicy,
    side: usize,
    responses: AtomicUsize,
    bytes_downloaded: AtomicU64,
}

impl fmt::Debug for HttpTileFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTileFetcher")
            .field("policy", &self.policy)
            .field("side", &self.side)
            .finish()
    }
}

impl HttpTileFetcher {
    /// Create a fetcher for `side x side` tiles.
    pub fn new(policy: FetchPolicy, side: usize) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(policy.timeout())
            .user_agent(policy.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            policy,
            side,
            responses: AtomicUsize::new(0),
            bytes_downloaded: AtomicU64::new(0),
        })
    }

    /// The acceptance policy.
    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Download statistics so far.
    pub fn download_stats(&self) -> DownloadStats {
        DownloadStats {
            responses: self.responses.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }

    fn get(&self, url: &str) -> std::result::Result<(u16, Vec<u8>), reqwest::Error> {
        let response = self.client.get(url).send()?;
        let status = response.status().as_u16();
        let bytes = response.bytes()?;

        self.responses.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        metrics::counter!(metric_defs::FETCH_BYTES.name).increment(bytes.len() as u64);

        Ok((status, bytes.to_vec()))
    }
}

impl TileFetch for HttpTileFetcher {
    fn fetch(&self, source: &TileSourceSpec, tile: TileIndex) -> FetchOutcome {
        let url = source.tile_url(tile);
        let labels = SourceLabels::new(source.key.as_str());
        metrics::counter!(metric_defs::FETCH_ATTEMPTS.name, &labels.to_labels()).increment(1);

        let outcome = match self.get(&url) {
            Ok((status, body)) => assess_response(status, &body, source, &self.policy, self.side),
            Err(e) => FetchOutcome::Unavailable(UnavailableReason::Transport(e.to_string())),
        };

        if let FetchOutcome::Unavailable(reason) = &outcome {
            debug!(source = %source.key, tile = %tile, %url, %reason, "tile unavailable");
            let labels = labels.with_reason(reason.label());
            metrics::counter!(metric_defs::FETCH_UNAVAILABLE.name, &labels.to_labels()).increment(1);
        }
        outcome
    }
}
