//! Object and chunk keys carried in queue messages
//!
//! A key is `md5(base)&base`. The hash prefix spreads keys across storage
//! partitions and lets the client reject corrupted messages.
//!
//! - tile key base: `collection&experiment&channel&resolution&x&y&z&t`
//! - chunk key base: `num_tiles&collection&experiment&channel&resolution&x&y&z&t`

use crate::error::{IngestError, Result};
use crate::types::{IngestType, TileCoord};
use serde::{Deserialize, Serialize};
use tessera_common::checksum::md5_hex;

/// Numeric ids the backend assigned to the target collection, experiment and channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectIds {
    pub collection: u64,
    pub experiment: u64,
    pub channel: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedKey {
    pub project: ProjectIds,
    pub coord: TileCoord,
    /// Present on chunk keys only
    pub num_tiles: Option<u64>,
}

fn base_key(project: &ProjectIds, coord: &TileCoord) -> String {
    format!(
        "{}&{}&{}&{}&{}&{}&{}&{}",
        project.collection,
        project.experiment,
        project.channel,
        coord.resolution,
        coord.x,
        coord.y,
        coord.z,
        coord.t
    )
}

fn with_hash(base: String) -> String {
    format!("{}&{}", md5_hex(base.as_bytes()), base)
}

pub fn encode_tile_key(project: &ProjectIds, coord: &TileCoord) -> String {
    with_hash(base_key(project, coord))
}

pub fn encode_chunk_key(num_tiles: u64, project: &ProjectIds, coord: &TileCoord) -> String {
    with_hash(format!("{}&{}", num_tiles, base_key(project, coord)))
}

fn split_verified(key: &str, fields: usize) -> Result<Vec<u64>> {
    let (hash, base) = key
        .split_once('&')
        .ok_or_else(|| IngestError::permanent(format!("malformed key '{key}'")))?;
    if md5_hex(base.as_bytes()) != hash {
        return Err(IngestError::permanent(format!("key hash mismatch for '{key}'")));
    }
    let parts: Vec<u64> = base
        .split('&')
        .map(|part| part.parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| IngestError::permanent(format!("non-numeric field in key '{key}': {e}")))?;
    if parts.len() != fields {
        return Err(IngestError::permanent(format!(
            "key '{key}' has {} fields, expected {fields}",
            parts.len()
        )));
    }
    Ok(parts)
}

fn decode_fields(fields: &[u64]) -> Result<(ProjectIds, TileCoord)> {
    let resolution = u32::try_from(fields[3])
        .map_err(|_| IngestError::permanent(format!("resolution {} out of range", fields[3])))?;
    Ok((
        ProjectIds {
            collection: fields[0],
            experiment: fields[1],
            channel: fields[2],
        },
        TileCoord {
            resolution,
            x: fields[4],
            y: fields[5],
            z: fields[6],
            t: fields[7],
        },
    ))
}

pub fn decode_tile_key(key: &str) -> Result<DecodedKey> {
    let fields = split_verified(key, 8)?;
    let (project, coord) = decode_fields(&fields)?;
    Ok(DecodedKey {
        project,
        coord,
        num_tiles: None,
    })
}

pub fn decode_chunk_key(key: &str) -> Result<DecodedKey> {
    let fields = split_verified(key, 9)?;
    let (project, coord) = decode_fields(&fields[1..])?;
    Ok(DecodedKey {
        project,
        coord,
        num_tiles: Some(fields[0]),
    })
}

/// JSON body of an upload-queue message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_key: Option<String>,
    pub chunk_key: String,
}

impl TaskMessage {
    pub fn parse(body: &str) -> Result<Self> {
        serde_json::from_str(body)
            .map_err(|e| IngestError::permanent(format!("unreadable task message: {e}")))
    }

    pub fn to_body(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Storage key the rendered unit is written under
    pub fn object_key(&self, ingest_type: IngestType) -> Result<&str> {
        match ingest_type {
            IngestType::Tile => self
                .tile_key
                .as_deref()
                .ok_or_else(|| IngestError::permanent("tile task without tile_key")),
            IngestType::Volumetric => Ok(&self.chunk_key),
        }
    }

    pub fn decode(&self, ingest_type: IngestType) -> Result<DecodedKey> {
        match ingest_type {
            IngestType::Tile => decode_tile_key(self.object_key(ingest_type)?),
            IngestType::Volumetric => decode_chunk_key(&self.chunk_key),
        }
    }
}
