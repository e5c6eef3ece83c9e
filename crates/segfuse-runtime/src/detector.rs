//! [`Detector`] – the instance-segmentation collaborator.
//!
//! The fusion pipeline hands every decoded RGB image to a [`Detector`] and
//! gets back class ids, scores and per-point masks.  Two implementations are
//! provided:
//!
//! - [`RemoteDetector`] talks to a model server over HTTP.  The server
//!   exposes `POST /v1/segment` (body: image + [`DetectorSettings`], reply:
//!   [`DetectionResult`]) and `GET /health`.
//! - [`RecordedDetector`] replays a stored [`DetectionResult`]; used by
//!   `segfuse replay` and the tests.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use segfuse_runtime::detector::RemoteDetector;
//!
//! let detector = RemoteDetector::new("http://localhost:8500", Duration::from_secs(5))
//!     .expect("client");
//! // Requires a running model server – skipped in unit tests.
//! // assert!(detector.is_reachable());
//! ```

use std::time::Duration;

use segfuse_types::{DetectionResult, FuseError, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Model configuration used when none is configured.
pub const DEFAULT_MODEL_CONFIG: &str = "COCO-InstanceSegmentation/mask_rcnn_R_50_FPN_3x.yaml";

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Thresholds passed through to the detector untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorSettings {
    /// Minimum confidence for an instance to be returned.
    pub score_threshold: f64,
    /// IoU above which overlapping instances are suppressed.
    pub nms_threshold: f64,
    /// Model configuration name understood by the server.
    pub model_config: String,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            score_threshold: 0.8,
            nms_threshold: 0.3,
            model_config: DEFAULT_MODEL_CONFIG.to_string(),
        }
    }
}

impl DetectorSettings {
    /// # Errors
    ///
    /// Returns [`FuseError::InvalidConfig`] when a threshold lies outside
    /// `[0, 1]`.
    pub fn validate(&self) -> Result<(), FuseError> {
        for (name, value) in [
            ("score_threshold", self.score_threshold),
            ("nms_threshold", self.nms_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(FuseError::InvalidConfig(format!(
                    "{name} must lie in [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Blocking instance segmentation of one image.
///
/// Called from a blocking worker thread, never from an async task.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &RgbImage, settings: &DetectorSettings) -> Result<DetectionResult, FuseError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from talking to the model server.
#[derive(Error, Debug)]
pub enum DetectorError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The request did not complete within the client timeout.
    #[error("model server did not answer within {0:?}")]
    Timeout(Duration),
}

impl From<DetectorError> for FuseError {
    fn from(err: DetectorError) -> Self {
        FuseError::DetectionUnavailable(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RemoteDetector
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SegmentRequest<'a> {
    image: &'a RgbImage,
    settings: &'a DetectorSettings,
}

/// Blocking HTTP client for a segmentation model server.
///
/// Construct it outside any async runtime and call it from
/// `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct RemoteDetector {
    base_url: String,
    timeout: Duration,
    client: reqwest::blocking::Client,
}

impl RemoteDetector {
    /// Create a client for the server at `base_url`
    /// (e.g. `"http://localhost:8500"`).
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::InvalidConfig`] if the HTTP client cannot be
    /// built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FuseError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FuseError::InvalidConfig(format!("cannot build HTTP client: {e}")))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            base_url,
            timeout,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns `true` if the server answers `GET /health` with a success
    /// status.
    pub fn is_reachable(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        self.client
            .get(&url)
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Send `image` to `POST /v1/segment` and parse the reply.
    ///
    /// # Errors
    ///
    /// Returns [`DetectorError::Timeout`] when the server is too slow and
    /// [`DetectorError::Http`] for any other transport or status failure.
    pub fn segment(
        &self,
        image: &RgbImage,
        settings: &DetectorSettings,
    ) -> Result<DetectionResult, DetectorError> {
        let url = format!("{}/v1/segment", self.base_url);
        let body = SegmentRequest { image, settings };
        let send = || -> Result<DetectionResult, reqwest::Error> {
            self.client
                .post(&url)
                .json(&body)
                .send()?
                .error_for_status()?
                .json()
        };
        send().map_err(|e| {
            if e.is_timeout() {
                DetectorError::Timeout(self.timeout)
            } else {
                DetectorError::Http(e)
            }
        })
    }
}

impl Detector for RemoteDetector {
    fn detect(&self, image: &RgbImage, settings: &DetectorSettings) -> Result<DetectionResult, FuseError> {
        let mut result = self.segment(image, settings)?;
        result.retain_min_score(settings.score_threshold);
        debug!(instances = result.len(), url = %self.base_url, "detector replied");
        Ok(result)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RecordedDetector
// ─────────────────────────────────────────────────────────────────────────────

/// Replays a fixed [`DetectionResult`] for every image.
#[derive(Debug, Clone, Default)]
pub struct RecordedDetector {
    result: DetectionResult,
}

impl RecordedDetector {
    pub fn new(result: DetectionResult) -> Self {
        Self { result }
    }

    /// Parse a recorded result from its JSON form.
    pub fn from_json(text: &str) -> Result<Self, FuseError> {
        serde_json::from_str(text)
            .map(Self::new)
            .map_err(|e| FuseError::Serialization(format!("bad detection record: {e}")))
    }
}

impl Detector for RecordedDetector {
    fn detect(&self, _image: &RgbImage, settings: &DetectorSettings) -> Result<DetectionResult, FuseError> {
        let mut result = self.result.clone();
        result.retain_min_score(settings.score_threshold);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;

    fn two_instances() -> DetectionResult {
        DetectionResult {
            height: 1,
            width: 2,
            classes: vec![0, 3],
            scores: vec![0.95, 0.4],
            masks: vec![vec![true, false], vec![false, true]],
            image: None,
        }
    }

    /// Serve exactly one HTTP request with `body` and return the request
    /// line that was received.
    fn serve_once(status: &'static str, body: String) -> (String, std::thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':')
                    && name.eq_ignore_ascii_case("content-length")
                {
                    content_length = value.trim().parse().unwrap();
                }
            }
            let mut request_body = vec![0u8; content_length];
            reader.read_exact(&mut request_body).unwrap();
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            reader.get_mut().write_all(response.as_bytes()).unwrap();
            request_line
        });
        (url, handle)
    }

    #[test]
    fn default_settings_match_node_defaults() {
        let s = DetectorSettings::default();
        assert_eq!(s.score_threshold, 0.8);
        assert_eq!(s.nms_threshold, 0.3);
        assert_eq!(s.model_config, DEFAULT_MODEL_CONFIG);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let s = DetectorSettings {
            nms_threshold: 1.5,
            ..Default::default()
        };
        assert!(matches!(s.validate(), Err(FuseError::InvalidConfig(_))));
    }

    #[test]
    fn recorded_detector_applies_score_threshold() {
        let detector = RecordedDetector::new(two_instances());
        let got = detector
            .detect(&RgbImage::default(), &DetectorSettings::default())
            .unwrap();
        assert_eq!(got.classes, vec![0]);
        assert_eq!(got.scores, vec![0.95]);
        assert_eq!(got.masks, vec![vec![true, false]]);

        let permissive = DetectorSettings {
            score_threshold: 0.0,
            ..Default::default()
        };
        assert_eq!(detector.detect(&RgbImage::default(), &permissive).unwrap().len(), 2);
    }

    #[test]
    fn recorded_detector_parses_json() {
        let json = serde_json::to_string(&two_instances()).unwrap();
        let detector = RecordedDetector::from_json(&json).unwrap();
        let settings = DetectorSettings {
            score_threshold: 0.0,
            ..Default::default()
        };
        assert_eq!(detector.detect(&RgbImage::default(), &settings).unwrap(), two_instances());
        assert!(matches!(
            RecordedDetector::from_json("{}"),
            Err(FuseError::Serialization(_))
        ));
    }

    #[test]
    fn remote_detector_parses_server_reply() {
        let (url, server) = serve_once("200 OK", serde_json::to_string(&two_instances()).unwrap());
        let detector = RemoteDetector::new(format!("{url}/"), Duration::from_secs(5)).unwrap();
        assert_eq!(detector.base_url(), url);

        let got = detector
            .detect(&RgbImage::new(1, 2, vec![0; 6]), &DetectorSettings::default())
            .unwrap();
        assert_eq!(got.classes, vec![0]);
        assert!(server.join().unwrap().starts_with("POST /v1/segment "));
    }

    #[test]
    fn remote_detector_maps_http_errors_to_unavailable() {
        let (url, server) = serve_once("500 Internal Server Error", "{}".to_string());
        let detector = RemoteDetector::new(url, Duration::from_secs(5)).unwrap();
        let err = detector
            .detect(&RgbImage::default(), &DetectorSettings::default())
            .unwrap_err();
        assert!(matches!(err, FuseError::DetectionUnavailable(_)));
        server.join().unwrap();
    }

    #[test]
    fn unreachable_server_is_unavailable() {
        // Bind then drop to obtain a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let detector =
            RemoteDetector::new(format!("http://127.0.0.1:{port}"), Duration::from_millis(500)).unwrap();
        assert!(!detector.is_reachable());
        assert!(matches!(
            detector.detect(&RgbImage::default(), &DetectorSettings::default()),
            Err(FuseError::DetectionUnavailable(_))
        ));
    }

    #[test]
    fn timeout_error_names_the_limit() {
        let err: FuseError = DetectorError::Timeout(Duration::from_secs(2)).into();
        assert_eq!(
            err,
            FuseError::DetectionUnavailable("model server did not answer within 2s".to_string())
        );
    }
}
