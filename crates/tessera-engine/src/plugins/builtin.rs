//! Bundled processors
//!
//! The `File*` processors read source images from a directory tree. The
//! `Test*` processors synthesize deterministic payloads so a job can be
//! exercised end to end without any source data.

use super::{ChunkProcessor, PathProcessor, PluginParams, TileProcessor};
use crate::error::{IngestError, Result};
use crate::types::TileCoord;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tessera_common::checksum::sha256_bytes;

const PATH_KIND: &str = "path processor";
const TILE_KIND: &str = "tile processor";
const CHUNK_KIND: &str = "chunk processor";

// ============================================================================
// Path processors
// ============================================================================

/// Builds a file path from a template such as `slice_{z_index:04}/{y_index}_{x_index}.png`
///
/// Params: `root_dir` (required), `filename_template` (default `{z_index}.png`),
/// `z_offset` added to the unit z index before formatting.
#[derive(Debug)]
pub struct FilePathProcessor {
    root_dir: PathBuf,
    template: Vec<Segment>,
    z_offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    X,
    Y,
    Z,
    T,
    Resolution,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field { field: Field, width: usize },
}

fn parse_template(template: &str) -> std::result::Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        if open > 0 {
            segments.push(Segment::Literal(rest[..open].to_string()));
        }
        let close = rest[open..]
            .find('}')
            .map(|i| open + i)
            .ok_or_else(|| format!("unclosed placeholder in '{template}'"))?;
        let spec = &rest[open + 1..close];
        let (name, width) = match spec.split_once(':') {
            Some((name, fmt)) => {
                let digits = fmt.trim_start_matches('0');
                let width = if digits.is_empty() {
                    0
                } else {
                    digits
                        .parse::<usize>()
                        .map_err(|_| format!("bad width '{fmt}' in placeholder '{spec}'"))?
                };
                (name, width)
            },
            None => (spec, 0),
        };
        let field = match name {
            "x_index" => Field::X,
            "y_index" => Field::Y,
            "z_index" => Field::Z,
            "t_index" => Field::T,
            "resolution" => Field::Resolution,
            other => return Err(format!("unknown placeholder '{other}'")),
        };
        segments.push(Segment::Field { field, width });
        rest = &rest[close + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(segments)
}

impl FilePathProcessor {
    pub fn new(params: &PluginParams) -> Result<Self> {
        let root_dir = PathBuf::from(params.required_str(PATH_KIND, "root_dir")?);
        let template = parse_template(params.str_or("filename_template", "{z_index}.png"))
            .map_err(|reason| IngestError::plugin(PATH_KIND, params.name.clone(), reason))?;
        let z_offset = params.i64_or(PATH_KIND, "z_offset", 0)?;
        Ok(Self {
            root_dir,
            template,
            z_offset,
        })
    }

    fn file_name(&self, coord: &TileCoord) -> Result<String> {
        let z = i64::try_from(coord.z)
            .ok()
            .and_then(|z| z.checked_add(self.z_offset))
            .filter(|z| *z >= 0)
            .ok_or_else(|| {
                IngestError::permanent(format!("z index {} with offset {} is out of range", coord.z, self.z_offset))
            })?;

        let mut name = String::new();
        for segment in &self.template {
            match segment {
                Segment::Literal(text) => name.push_str(text),
                Segment::Field { field, width } => {
                    let value = match field {
                        Field::X => coord.x as i64,
                        Field::Y => coord.y as i64,
                        Field::Z => z,
                        Field::T => coord.t as i64,
                        Field::Resolution => i64::from(coord.resolution),
                    };
                    name.push_str(&format!("{value:0width$}", width = *width));
                },
            }
        }
        Ok(name)
    }
}

#[async_trait]
impl PathProcessor for FilePathProcessor {
    async fn resolve(&self, coord: &TileCoord) -> Result<String> {
        let path = self.root_dir.join(self.file_name(coord)?);
        Ok(path.to_string_lossy().into_owned())
    }
}

/// Names each unit by its coordinates; pairs with the `Test*` renderers
#[derive(Debug, Default)]
pub struct TestPathProcessor;

#[async_trait]
impl PathProcessor for TestPathProcessor {
    async fn resolve(&self, coord: &TileCoord) -> Result<String> {
        Ok(format!(
            "synthetic/{}/{}_{}_{}_{}",
            coord.resolution, coord.x, coord.y, coord.z, coord.t
        ))
    }
}

/// Always resolves to an empty location, for renderers that ignore it
#[derive(Debug, Default)]
pub struct PassThroughPathProcessor;

#[async_trait]
impl PathProcessor for PassThroughPathProcessor {
    async fn resolve(&self, _coord: &TileCoord) -> Result<String> {
        Ok(String::new())
    }
}

// ============================================================================
// Renderers
// ============================================================================

async fn read_source(location: &str) -> Result<Vec<u8>> {
    match tokio::fs::read(location).await {
        Ok(bytes) => Ok(bytes),
        Err(e)
            if matches!(
                e.kind(),
                ErrorKind::NotFound
                    | ErrorKind::PermissionDenied
                    | ErrorKind::InvalidInput
                    | ErrorKind::InvalidData
                    | ErrorKind::IsADirectory
            ) =>
        {
            Err(IngestError::permanent(format!("cannot read '{location}': {e}")))
        },
        Err(e) => Err(IngestError::Io(e)),
    }
}

/// Uploads the source file as-is
#[derive(Debug, Default)]
pub struct FileTileProcessor;

#[async_trait]
impl TileProcessor for FileTileProcessor {
    async fn render(&self, _coord: &TileCoord, location: &str) -> Result<Vec<u8>> {
        read_source(location).await
    }
}

#[derive(Debug, Default)]
pub struct FileChunkProcessor;

#[async_trait]
impl ChunkProcessor for FileChunkProcessor {
    async fn render(&self, _coord: &TileCoord, location: &str) -> Result<Vec<u8>> {
        read_source(location).await
    }
}

/// Fill `len` bytes from a SHA-256 stream seeded by the unit coordinate
fn synthetic_payload(coord: &TileCoord, len: usize) -> Vec<u8> {
    let seed = format!("{}&{}&{}&{}&{}", coord.resolution, coord.x, coord.y, coord.z, coord.t);
    let mut out = Vec::with_capacity(len);
    let mut counter = 0u64;
    while out.len() < len {
        let block = sha256_bytes(format!("{seed}#{counter}"));
        let take = (len - out.len()).min(block.len());
        out.extend_from_slice(&block[..take]);
        counter += 1;
    }
    out
}

/// Sizes a synthetic payload from `payload_bytes` or from the unit volume
fn payload_len(params: &PluginParams, kind: &'static str, depth: u64) -> Result<usize> {
    let len = match params.u64_opt(kind, "payload_bytes")? {
        Some(n) => n,
        None => {
            let size = params.ingest_job.unit_size()?;
            size.x.saturating_mul(size.y).saturating_mul(depth)
        },
    };
    usize::try_from(len).map_err(|_| IngestError::plugin(kind, params.name.clone(), "payload too large"))
}

/// Deterministic pseudo-random tile. Params: `payload_bytes` (default tile width x height).
#[derive(Debug)]
pub struct TestTileProcessor {
    len: usize,
}

impl TestTileProcessor {
    pub fn new(params: &PluginParams) -> Result<Self> {
        Ok(Self {
            len: payload_len(params, TILE_KIND, 1)?,
        })
    }
}

#[async_trait]
impl TileProcessor for TestTileProcessor {
    async fn render(&self, coord: &TileCoord, _location: &str) -> Result<Vec<u8>> {
        Ok(synthetic_payload(coord, self.len))
    }
}

/// Deterministic pseudo-random chunk. Params: `payload_bytes` (default chunk volume).
#[derive(Debug)]
pub struct TestChunkProcessor {
    len: usize,
}

impl TestChunkProcessor {
    pub fn new(params: &PluginParams) -> Result<Self> {
        let depth = params.ingest_job.unit_size()?.z;
        Ok(Self {
            len: payload_len(params, CHUNK_KIND, depth)?,
        })
    }
}

#[async_trait]
impl ChunkProcessor for TestChunkProcessor {
    async fn render(&self, coord: &TileCoord, _location: &str) -> Result<Vec<u8>> {
        Ok(synthetic_payload(coord, self.len))
    }
}
