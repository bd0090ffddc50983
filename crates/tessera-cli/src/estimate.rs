//! Pre-flight job estimate shown before a new job is created

use crate::error::Result;
use std::fmt;
use tessera_engine::config::PluginSpec;
use tessera_engine::types::{ChunkSize, CollectionRef, Extent};
use tessera_engine::{IngestType, JobConfig};

#[derive(Debug, Clone)]
pub struct Estimate {
    pub target: CollectionRef,
    pub ingest_type: IngestType,
    pub resolution: u32,
    pub extent: Extent,
    pub unit_size: ChunkSize,
    pub units: u64,
    pub plugins: Vec<(&'static str, PluginSpec)>,
}

impl Estimate {
    pub fn from_config(config: &JobConfig) -> Result<Self> {
        let job = &config.ingest_job;
        let client = &config.client;
        let mut plugins = vec![("Path processor", client.path_processor.clone())];
        if let Some(spec) = &client.tile_processor {
            plugins.push(("Tile processor", spec.clone()));
        }
        if let Some(spec) = &client.chunk_processor {
            plugins.push(("Chunk processor", spec.clone()));
        }

        Ok(Self {
            target: config.database.clone(),
            ingest_type: job.ingest_type,
            resolution: job.resolution,
            extent: job.extent,
            unit_size: job.unit_size()?,
            units: job.work_unit_count()?,
            plugins,
        })
    }
}

impl fmt::Display for Estimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let e = &self.extent;
        let u = &self.unit_size;
        writeln!(f, "Ingest job estimate")?;
        writeln!(f, "  Target:      {}", self.target)?;
        writeln!(f, "  Ingest type: {}", self.ingest_type)?;
        writeln!(f, "  Resolution:  {}", self.resolution)?;
        writeln!(
            f,
            "  Extent:      x [{}, {}) y [{}, {}) z [{}, {}) t [{}, {})",
            e.x.start, e.x.stop, e.y.start, e.y.stop, e.z.start, e.z.stop, e.t.start, e.t.stop
        )?;
        writeln!(f, "  Unit size:   {}x{}x{}x{}", u.x, u.y, u.z, u.t)?;
        for (role, spec) in &self.plugins {
            writeln!(f, "  {:<12} {} {}", format!("{role}:"), spec.short_name(), spec.params)?;
        }
        write!(f, "  Work units:  {}", self.units)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(ingest_type: &str) -> JobConfig {
        let value = json!({
            "client": {
                "backend": {"host": "api.example.org"},
                "path_processor": {"class": "ingest.plugins.TestPathProcessor", "params": {}},
                "tile_processor": {"class": "ingest.plugins.TestTileProcessor", "params": {"payload_bytes": 8}},
                "chunk_processor": {"class": "ingest.plugins.TestChunkProcessor", "params": {}}
            },
            "database": {"collection": "col1", "experiment": "exp1", "channel": "ch1"},
            "ingest_job": {
                "ingest_type": ingest_type,
                "resolution": 0,
                "extent": {"x": [0, 2048], "y": [0, 2048], "z": [0, 32], "t": [0, 1]},
                "tile_size": {"x": 512, "y": 512, "z": 1, "t": 1},
                "chunk_size": {"x": 512, "y": 512, "z": 16, "t": 1}
            }
        });
        JobConfig::from_json(&value.to_string()).unwrap()
    }

    #[test]
    fn test_tile_estimate_counts_tiles() {
        let estimate = Estimate::from_config(&config("tile")).unwrap();
        assert_eq!(estimate.units, 512);
        assert_eq!(estimate.plugins.len(), 3);
        let text = estimate.to_string();
        assert!(text.contains("col1/exp1/ch1"));
        assert!(text.contains("TestTileProcessor"));
        assert!(text.contains("Work units:  512"));
    }

    #[test]
    fn test_volumetric_estimate_counts_chunks() {
        let estimate = Estimate::from_config(&config("volumetric")).unwrap();
        assert_eq!(estimate.units, 32);
        assert!(estimate.to_string().contains("512x512x16x1"));
    }
}
