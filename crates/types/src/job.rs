//! Job data model: search options, found records and progress tracking.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::InvalidRangeError;

/// Unique identifier of a job. Generated once in [`Job::new`].
pub type JobId = String;

/// Number of `{time, progress}` samples kept per job for rate estimation.
pub const PROGRESS_WINDOW: usize = 20;

/// Stable identity of one physical worker connection.
///
/// Never reused: a worker that reconnects gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Search topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Spiral,
    Cube,
}

impl SearchMode {
    /// Guess the mode from a reported `maps` counter.
    ///
    /// Spiral jobs report a count of visited regions, cube jobs a fraction in
    /// `[0, 1]`. A spiral job that has visited zero or one region is
    /// misclassified as cube; prefer an explicit mode when the worker sends one.
    pub fn infer_from_maps(maps: f64) -> Self {
        if maps > 1.0 {
            SearchMode::Spiral
        } else {
            SearchMode::Cube
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Spiral => f.write_str("spiral"),
            SearchMode::Cube => f.write_str("cube"),
        }
    }
}

/// Mode-specific search parameters. Only one variant's fields can ever be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum SearchArea {
    #[serde(rename = "spiral", rename_all = "camelCase")]
    Spiral {
        spiral_start: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maxa: Option<u64>,
    },
    #[serde(rename = "cube")]
    Cube {
        minx: i64,
        maxx: i64,
        minz: i64,
        maxz: i64,
    },
}

/// Parameters forwarded to a worker in `job_start`.
///
/// Deserializing rejects fields that belong to the other mode, so a spiral
/// job cannot arrive carrying cube bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct JobOptions {
    #[serde(flatten)]
    pub area: SearchArea,
    #[serde(default)]
    pub fpos: Option<i64>,
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default)]
    pub biomes: Option<Vec<i32>>,
}

const SHARED_FIELDS: &[&str] = &["mode", "fpos", "threads", "biomes"];
const SPIRAL_FIELDS: &[&str] = &["spiralStart", "maxa"];
const CUBE_FIELDS: &[&str] = &["minx", "maxx", "minz", "maxz"];

#[derive(Deserialize)]
struct JobOptionsRepr {
    #[serde(flatten)]
    area: SearchArea,
    #[serde(default)]
    fpos: Option<i64>,
    #[serde(default)]
    threads: Option<u32>,
    #[serde(default)]
    biomes: Option<Vec<i32>>,
}

impl TryFrom<Map<String, Value>> for JobOptions {
    type Error = String;

    fn try_from(fields: Map<String, Value>) -> Result<Self, Self::Error> {
        let mode_fields = match fields.get("mode").and_then(Value::as_str) {
            Some("spiral") => Some(SPIRAL_FIELDS),
            Some("cube") => Some(CUBE_FIELDS),
            // unknown or missing tag is reported by the tagged decode below
            _ => None,
        };
        if let Some(allowed) = mode_fields {
            let stray = fields
                .keys()
                .find(|k| !SHARED_FIELDS.contains(&k.as_str()) && !allowed.contains(&k.as_str()));
            if let Some(stray) = stray {
                return Err(format!("field `{stray}` is not valid for this mode"));
            }
        }
        let repr: JobOptionsRepr =
            serde_json::from_value(Value::Object(fields)).map_err(|e| e.to_string())?;
        Ok(Self {
            area: repr.area,
            fpos: repr.fpos,
            threads: repr.threads,
            biomes: repr.biomes,
        })
    }
}

impl JobOptions {
    pub fn spiral(spiral_start: u64, maxa: Option<u64>) -> Self {
        Self {
            area: SearchArea::Spiral { spiral_start, maxa },
            fpos: None,
            threads: None,
            biomes: None,
        }
    }

    pub fn cube(minx: i64, maxx: i64, minz: i64, maxz: i64) -> Self {
        Self {
            area: SearchArea::Cube {
                minx,
                maxx,
                minz,
                maxz,
            },
            fpos: None,
            threads: None,
            biomes: None,
        }
    }

    pub fn mode(&self) -> SearchMode {
        match self.area {
            SearchArea::Spiral { .. } => SearchMode::Spiral,
            SearchArea::Cube { .. } => SearchMode::Cube,
        }
    }

    /// Reject cube bounds with `min > max` on either axis.
    pub fn validate(&self) -> Result<(), InvalidRangeError> {
        if let SearchArea::Cube {
            minx,
            maxx,
            minz,
            maxz,
        } = self.area
        {
            if minx > maxx {
                return Err(InvalidRangeError {
                    axis: 'x',
                    min: minx,
                    max: maxx,
                });
            }
            if minz > maxz {
                return Err(InvalidRangeError {
                    axis: 'z',
                    min: minz,
                    max: maxz,
                });
            }
        }
        Ok(())
    }
}

/// A discovered location reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundInfo {
    pub x: i64,
    pub z: i64,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<i64>,
}

impl FoundInfo {
    /// Decode a `found` payload. Workers send either an object or the same
    /// object encoded as a JSON string.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        match payload {
            Value::String(raw) => serde_json::from_str(raw).ok(),
            other => serde_json::from_value(other.clone()).ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Finished,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub time: DateTime<Utc>,
    pub progress: f64,
}

/// Bounded sliding window of progress samples. Oldest samples are evicted first.
#[derive(Debug, Clone)]
pub struct ProgressWindow {
    samples: VecDeque<ProgressSample>,
    capacity: usize,
}

impl ProgressWindow {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: ProgressSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn last(&self) -> Option<&ProgressSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Progress units per second across the window, or `None` with fewer
    /// than two samples or no elapsed time.
    pub fn rate(&self) -> Option<f64> {
        let first = self.samples.front()?;
        let last = self.samples.back()?;
        let elapsed_ms = (last.time - first.time).num_milliseconds();
        if elapsed_ms <= 0 {
            return None;
        }
        Some((last.progress - first.progress) / (elapsed_ms as f64 / 1000.0))
    }
}

impl Default for ProgressWindow {
    fn default() -> Self {
        Self::with_capacity(PROGRESS_WINDOW)
    }
}

/// One unit of search work.
///
/// `client`, `requested_worker` and the progress window are runtime-only and
/// are not part of the persisted snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub job_options: JobOptions,
    #[serde(skip)]
    pub client: Option<ConnectionId>,
    #[serde(skip)]
    pub requested_worker: Option<ConnectionId>,
    #[serde(default)]
    pub found: Vec<FoundInfo>,
    #[serde(default)]
    pub progress: f64,
    #[serde(skip)]
    progress_window: ProgressWindow,
    #[serde(default)]
    pub rel_file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_file_path: Option<PathBuf>,
    #[serde(default)]
    pub distance: Option<f64>,
    #[serde(default)]
    pub status: JobStatus,
}

impl Job {
    pub fn new(name: impl Into<String>, job_options: JobOptions) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            job_options,
            client: None,
            requested_worker: None,
            found: Vec::new(),
            progress: 0.0,
            progress_window: ProgressWindow::default(),
            rel_file_name: String::new(),
            rel_file_path: None,
            distance: None,
            status: JobStatus::Pending,
        }
    }

    pub fn mode(&self) -> SearchMode {
        self.job_options.mode()
    }

    /// Waiting for a worker: pending and not bound to a connection.
    pub fn is_assignable(&self) -> bool {
        self.status == JobStatus::Pending && self.client.is_none()
    }

    /// Overwrite progress and distance, and append a sample to the window.
    pub fn record_progress(&mut self, progress: f64, distance: Option<f64>, at: DateTime<Utc>) {
        self.progress = progress;
        if distance.is_some() {
            self.distance = distance;
        }
        self.progress_window.push(ProgressSample { time: at, progress });
    }

    pub fn last_progress(&self) -> Option<f64> {
        self.progress_window.last().map(|s| s.progress)
    }

    pub fn progress_rate(&self) -> Option<f64> {
        self.progress_window.rate()
    }

    pub fn bind(&mut self, connection: ConnectionId) {
        self.client = Some(connection);
        self.status = JobStatus::Running;
    }

    /// Drop the connection reference. A running job goes back to pending so
    /// it can be assigned to another worker.
    pub fn unbind(&mut self) {
        self.client = None;
        if self.status == JobStatus::Running {
            self.status = JobStatus::Pending;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_cube_validation() {
        assert!(JobOptions::cube(0, 10, 0, 10).validate().is_ok());
        assert!(JobOptions::cube(5, 5, -3, -3).validate().is_ok());

        let err = JobOptions::cube(11, 10, 0, 10).validate().unwrap_err();
        assert_eq!(err.axis, 'x');
        let err = JobOptions::cube(0, 10, 1, 0).validate().unwrap_err();
        assert_eq!(err.axis, 'z');
    }

    #[test]
    fn test_spiral_always_valid() {
        assert!(JobOptions::spiral(0, None).validate().is_ok());
    }

    #[test]
    fn test_options_wire_shape() {
        let mut opts = JobOptions::spiral(40, Some(2000));
        opts.threads = Some(4);
        let value = serde_json::to_value(&opts).unwrap();
        assert_eq!(
            value,
            json!({
                "mode": "spiral",
                "spiralStart": 40,
                "maxa": 2000,
                "fpos": null,
                "threads": 4,
                "biomes": null,
            })
        );

        let cube: JobOptions = serde_json::from_value(json!({
            "mode": "cube",
            "minx": -100, "maxx": 100, "minz": -50, "maxz": 50,
            "biomes": [1, 7],
        }))
        .unwrap();
        assert_eq!(cube.mode(), SearchMode::Cube);
        assert_eq!(cube.biomes, Some(vec![1, 7]));
    }

    #[test]
    fn test_options_reject_mixed_variant() {
        // a cube without its bounds cannot be built from spiral fields
        let res: Result<JobOptions, _> =
            serde_json::from_value(json!({"mode": "cube", "spiralStart": 3}));
        assert!(res.is_err());
    }

    #[test]
    fn test_options_reject_inactive_variant_fields() {
        let res: Result<JobOptions, _> =
            serde_json::from_value(json!({"mode": "spiral", "spiralStart": 0, "minx": 5}));
        let err = res.unwrap_err().to_string();
        assert!(err.contains("minx"), "{err}");

        let res: Result<JobOptions, _> = serde_json::from_value(json!({
            "mode": "cube",
            "minx": 0, "maxx": 1, "minz": 0, "maxz": 1,
            "maxa": 100,
        }));
        assert!(res.is_err());

        let res: Result<JobOptions, _> = serde_json::from_value(json!({"mode": "ring", "minx": 0}));
        assert!(res.is_err());
    }

    #[test]
    fn test_options_nested_in_messages() {
        let job = Job::new("nested", JobOptions::cube(-8, 8, -8, 8));
        let back: Job = serde_json::from_value(serde_json::to_value(&job).unwrap()).unwrap();
        assert_eq!(back.job_options, job.job_options);
    }

    #[test]
    fn test_found_from_payload() {
        let obj = FoundInfo::from_payload(&json!({"x": 10, "z": -20})).unwrap();
        assert_eq!(obj, FoundInfo { x: 10, z: -20, date: None });

        let encoded = FoundInfo::from_payload(&json!("{\"x\":1,\"z\":2,\"date\":99}")).unwrap();
        assert_eq!(encoded.date, Some(99));

        assert!(FoundInfo::from_payload(&json!("not json")).is_none());
    }

    #[test]
    fn test_infer_mode() {
        assert_eq!(SearchMode::infer_from_maps(3.0), SearchMode::Spiral);
        assert_eq!(SearchMode::infer_from_maps(1.0), SearchMode::Cube);
        assert_eq!(SearchMode::infer_from_maps(0.25), SearchMode::Cube);
    }

    #[test]
    fn test_progress_window_evicts_oldest() {
        let start = Utc::now();
        let mut window = ProgressWindow::with_capacity(3);
        for i in 0..5 {
            window.push(ProgressSample {
                time: start + Duration::seconds(i),
                progress: i as f64 * 10.0,
            });
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.last().unwrap().progress, 40.0);
        // samples 2..=4 remain: 20 units over 2 seconds
        assert_eq!(window.rate(), Some(10.0));
    }

    #[test]
    fn test_progress_rate_needs_two_samples() {
        let mut job = Job::new("single", JobOptions::spiral(0, None));
        assert_eq!(job.last_progress(), None);
        job.record_progress(5.0, Some(120.0), Utc::now());
        assert_eq!(job.last_progress(), Some(5.0));
        assert_eq!(job.progress_rate(), None);
        assert_eq!(job.distance, Some(120.0));
    }

    #[test]
    fn test_job_snapshot_skips_runtime_fields() {
        let mut job = Job::new("north", JobOptions::cube(0, 1, 0, 1));
        job.bind(ConnectionId::new());
        job.record_progress(0.5, None, Utc::now());

        let value = serde_json::to_value(&job).unwrap();
        assert!(value.get("client").is_none());
        assert!(value.get("progressWindow").is_none());
        assert_eq!(value["status"], "running");
        assert_eq!(value["jobOptions"]["mode"], "cube");

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.client, None);
        assert_eq!(back.last_progress(), None);
    }

    #[test]
    fn test_unbind_returns_running_job_to_pending() {
        let mut job = Job::new("j", JobOptions::spiral(0, None));
        job.bind(ConnectionId::new());
        assert!(!job.is_assignable());
        job.unbind();
        assert!(job.is_assignable());

        job.status = JobStatus::Finished;
        job.unbind();
        assert_eq!(job.status, JobStatus::Finished);
    }
}
