//! Core types shared by every engine component

use crate::error::{IngestError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque job identifier assigned by the backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        JobId(value)
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        JobId(value.to_string())
    }
}

/// Ingest job lifecycle
///
/// ```text
/// Created -> Uploading -> Completing -> Complete
///    |           |            |
///    +-----------+--> Cancelled
///    +-----------+------------+--> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Uploading,
    Completing,
    Complete,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Uploading => "uploading",
            JobStatus::Completing => "completing",
            JobStatus::Complete => "complete",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Cancelled | JobStatus::Failed
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Created, Uploading)
                | (Uploading, Completing)
                | (Completing, Complete)
                | (Completing, Uploading)
                | (Created, Cancelled)
                | (Uploading, Cancelled)
                | (Created, Failed)
                | (Uploading, Failed)
                | (Completing, Failed)
        )
    }

    /// Check a transition, returning the error the controller surfaces
    pub fn transition(self, next: JobStatus) -> Result<JobStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(IngestError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Map the numeric status reported by the ingest service
    pub fn from_backend_code(code: i64) -> Option<JobStatus> {
        match code {
            0 => Some(JobStatus::Created),
            1 => Some(JobStatus::Uploading),
            2 => Some(JobStatus::Complete),
            3 => Some(JobStatus::Cancelled),
            4 => Some(JobStatus::Failed),
            5 => Some(JobStatus::Completing),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IngestType {
    #[default]
    Tile,
    #[serde(alias = "volume")]
    Volumetric,
}

impl IngestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestType::Tile => "tile",
            IngestType::Volumetric => "volumetric",
        }
    }
}

impl fmt::Display for IngestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open range `[start, stop)` along one axis. Serialized as `[start, stop]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u64; 2]", into = "[u64; 2]")]
pub struct AxisRange {
    pub start: u64,
    pub stop: u64,
}

impl AxisRange {
    pub fn new(start: u64, stop: u64) -> Self {
        Self { start, stop }
    }

    pub fn len(&self) -> u64 {
        self.stop.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `ceil((stop - start) / size)`
    pub fn unit_count(&self, size: u64) -> u64 {
        if size == 0 {
            return 0;
        }
        self.len().div_ceil(size)
    }

    fn validate(&self, axis: &str) -> Result<()> {
        if self.start >= self.stop {
            return Err(IngestError::configuration(format!(
                "extent.{axis} must satisfy start < stop, got [{}, {}]",
                self.start, self.stop
            )));
        }
        Ok(())
    }
}

impl From<[u64; 2]> for AxisRange {
    fn from([start, stop]: [u64; 2]) -> Self {
        Self { start, stop }
    }
}

impl From<AxisRange> for [u64; 2] {
    fn from(range: AxisRange) -> Self {
        [range.start, range.stop]
    }
}

fn single_timepoint() -> AxisRange {
    AxisRange::new(0, 1)
}

fn one() -> u64 {
    1
}

/// Voxel bounds of the dataset being ingested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub x: AxisRange,
    pub y: AxisRange,
    pub z: AxisRange,
    #[serde(default = "single_timepoint")]
    pub t: AxisRange,
}

/// Edge lengths of one work unit. Tile jobs leave `z` and `t` at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSize {
    pub x: u64,
    pub y: u64,
    #[serde(default = "one")]
    pub z: u64,
    #[serde(default = "one")]
    pub t: u64,
}

impl ChunkSize {
    pub fn new(x: u64, y: u64, z: u64, t: u64) -> Self {
        Self { x, y, z, t }
    }

    fn validate(&self) -> Result<()> {
        if self.x == 0 || self.y == 0 || self.z == 0 || self.t == 0 {
            return Err(IngestError::configuration(format!(
                "unit size must be positive on every axis, got {}x{}x{}x{}",
                self.x, self.y, self.z, self.t
            )));
        }
        Ok(())
    }
}

impl Extent {
    pub fn validate(&self, size: &ChunkSize) -> Result<()> {
        self.x.validate("x")?;
        self.y.validate("y")?;
        self.z.validate("z")?;
        self.t.validate("t")?;
        size.validate()
    }

    /// Units per axis in `[x, y, z, t]` order
    pub fn unit_counts(&self, size: &ChunkSize) -> [u64; 4] {
        [
            self.x.unit_count(size.x),
            self.y.unit_count(size.y),
            self.z.unit_count(size.z),
            self.t.unit_count(size.t),
        ]
    }

    /// Total work units, the product of the per-axis counts
    pub fn work_unit_count(&self, size: &ChunkSize) -> u64 {
        self.unit_counts(size)
            .iter()
            .fold(1u64, |acc, n| acc.saturating_mul(*n))
    }

    /// Every unit coordinate, x varying fastest
    pub fn units(&self, size: ChunkSize, resolution: u32) -> UnitIter {
        UnitIter::new(*self, size, resolution)
    }
}

/// Grid position of one work unit
///
/// Indices count in unit-size steps from voxel zero, so unit `k` along an
/// axis starting at `start` has index `start / size + k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: u64,
    pub y: u64,
    pub z: u64,
    pub t: u64,
    pub resolution: u32,
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "res {} x {} y {} z {} t {}",
            self.resolution, self.x, self.y, self.z, self.t
        )
    }
}

/// Iterator over the unit grid of an extent
#[derive(Debug, Clone)]
pub struct UnitIter {
    base: [u64; 4],
    counts: [u64; 4],
    cursor: [u64; 4],
    resolution: u32,
    done: bool,
}

impl UnitIter {
    fn new(extent: Extent, size: ChunkSize, resolution: u32) -> Self {
        let counts = extent.unit_counts(&size);
        let base = [
            extent.x.start / size.x.max(1),
            extent.y.start / size.y.max(1),
            extent.z.start / size.z.max(1),
            extent.t.start / size.t.max(1),
        ];
        Self {
            base,
            counts,
            cursor: [0; 4],
            resolution,
            done: counts.contains(&0),
        }
    }
}

impl Iterator for UnitIter {
    type Item = TileCoord;

    fn next(&mut self) -> Option<TileCoord> {
        if self.done {
            return None;
        }
        let [x, y, z, t] = self.cursor;
        let coord = TileCoord {
            x: self.base[0] + x,
            y: self.base[1] + y,
            z: self.base[2] + z,
            t: self.base[3] + t,
            resolution: self.resolution,
        };

        // Odometer increment, x fastest
        self.done = true;
        for axis in 0..4 {
            self.cursor[axis] += 1;
            if self.cursor[axis] < self.counts[axis] {
                self.done = false;
                break;
            }
            self.cursor[axis] = 0;
        }
        Some(coord)
    }
}

/// Names of the collection, experiment and channel receiving the data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRef {
    pub collection: String,
    pub experiment: String,
    pub channel: String,
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.collection, self.experiment, self.channel)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestJob {
    pub id: JobId,
    pub status: JobStatus,
    pub ingest_type: IngestType,
    pub resolution: u32,
    pub extent: Extent,
    pub unit_size: ChunkSize,
    pub target: CollectionRef,
    /// Number of work units the backend expects to receive
    pub expected_units: u64,
}

/// Queue addresses handed out by the backend for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueHandles {
    pub upload: String,
    #[serde(default)]
    pub ingest: Option<String>,
    #[serde(default)]
    pub tile_index: Option<String>,
}

/// Short-lived storage credentials scoped to one job
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.access_key.is_empty() || self.secret_key.is_empty()
    }

    /// True when the credentials lapse within `margin` of `now`
    pub fn expires_within(&self, margin: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - margin <= now,
            None => false,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Everything a client needs to start uploading for a job
#[derive(Debug, Clone)]
pub struct JobSession {
    pub job: IngestJob,
    pub queues: QueueHandles,
    pub bucket: String,
    pub credentials: Credentials,
    /// Opaque job parameters echoed back in upload metadata
    pub parameters: serde_json::Value,
}

/// One leased queue message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub lease_deadline: DateTime<Utc>,
}
