//! Job configuration file
//!
//! The JSON document an operator writes to describe an ingest: which backend
//! to talk to, which plugins read the source data, where the data lands, and
//! the extent being uploaded. Unknown keys are preserved so the whole
//! document can be forwarded to the backend verbatim on job creation.

use crate::error::{IngestError, Result};
use crate::types::{ChunkSize, CollectionRef, Extent, IngestType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaRef>,
    pub client: ClientConfig,
    pub database: CollectionRef,
    pub ingest_job: IngestJobSpec,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub backend: BackendConfig,
    pub path_processor: PluginSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_processor: Option<PluginSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_processor: Option<PluginSpec>,
}

fn default_protocol() -> String {
    "https".to_string()
}

fn default_api_version() -> String {
    "latest".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub class: String,
    pub host: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

impl BackendConfig {
    /// `protocol://host`, without a trailing slash
    pub fn base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.contains("://") {
            host.to_string()
        } else {
            format!("{}://{}", self.protocol, host)
        }
    }
}

/// Names a plugin and the parameters handed to it at construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSpec {
    pub class: String,
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Object(Map::new())
}

impl PluginSpec {
    /// Last segment of a dotted class path: `ingest.plugins.FileTileProcessor` -> `FileTileProcessor`
    pub fn short_name(&self) -> &str {
        self.class.rsplit('.').next().unwrap_or(&self.class)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestJobSpec {
    #[serde(default)]
    pub ingest_type: IngestType,
    #[serde(default)]
    pub resolution: u32,
    pub extent: Extent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_size: Option<ChunkSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<ChunkSize>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IngestJobSpec {
    /// Size of one work unit for this job's ingest type
    pub fn unit_size(&self) -> Result<ChunkSize> {
        match self.ingest_type {
            IngestType::Tile => self
                .tile_size
                .ok_or_else(|| IngestError::configuration("tile ingest requires ingest_job.tile_size")),
            IngestType::Volumetric => self.chunk_size.ok_or_else(|| {
                IngestError::configuration("volumetric ingest requires ingest_job.chunk_size")
            }),
        }
    }

    pub fn work_unit_count(&self) -> Result<u64> {
        Ok(self.extent.work_unit_count(&self.unit_size()?))
    }
}

impl JobConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            IngestError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: JobConfig = serde_json::from_str(raw)
            .map_err(|e| IngestError::configuration(format!("invalid job configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that need no network access
    pub fn validate(&self) -> Result<()> {
        if self.client.backend.host.trim().is_empty() {
            return Err(IngestError::configuration("client.backend.host must not be empty"));
        }
        for (field, value) in [
            ("collection", &self.database.collection),
            ("experiment", &self.database.experiment),
            ("channel", &self.database.channel),
        ] {
            if value.trim().is_empty() {
                return Err(IngestError::configuration(format!("database.{field} must not be empty")));
            }
        }

        let size = self.ingest_job.unit_size()?;
        self.ingest_job.extent.validate(&size)?;

        match self.ingest_job.ingest_type {
            IngestType::Tile => {
                if self.client.tile_processor.is_none() {
                    return Err(IngestError::configuration("tile ingest requires client.tile_processor"));
                }
                if size.z != 1 {
                    return Err(IngestError::configuration("tile_size.z must be 1 for tile ingest"));
                }
            },
            IngestType::Volumetric => {
                if self.client.chunk_processor.is_none() {
                    return Err(IngestError::configuration(
                        "volumetric ingest requires client.chunk_processor",
                    ));
                }
            },
        }
        Ok(())
    }

    /// The document sent to the backend when creating a job
    pub fn to_payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn tile_config_json() -> String {
        r#"{
            "schema": {"name": "boss-v0.2-schema", "validator": "BossValidatorV02"},
            "client": {
                "backend": {"name": "boss", "class": "BossBackend", "host": "api.example.org", "protocol": "https"},
                "path_processor": {"class": "ingest.plugins.TestPathProcessor", "params": {}},
                "tile_processor": {"class": "ingest.plugins.TestTileProcessor", "params": {"filetype": "raw"}}
            },
            "database": {"collection": "col1", "experiment": "exp1", "channel": "ch1"},
            "ingest_job": {
                "resolution": 0,
                "extent": {"x": [0, 2048], "y": [0, 2048], "z": [0, 32], "t": [0, 1]},
                "tile_size": {"x": 512, "y": 512, "z": 1, "t": 1}
            }
        }"#
        .to_string()
    }

    #[test]
    fn test_parse_tile_config() {
        let config = JobConfig::from_json(&tile_config_json()).unwrap();
        assert_eq!(config.ingest_job.ingest_type, IngestType::Tile);
        assert_eq!(config.ingest_job.work_unit_count().unwrap(), 4 * 4 * 32);
        assert_eq!(config.client.backend.base_url(), "https://api.example.org");
        assert_eq!(config.client.path_processor.short_name(), "TestPathProcessor");
    }

    #[test]
    fn test_payload_preserves_unknown_keys() {
        let mut value: Value = serde_json::from_str(&tile_config_json()).unwrap();
        value["ingest_job"]["notes"] = Value::String("batch 7".into());
        value["site"] = Value::String("lab-a".into());
        let config = JobConfig::from_json(&value.to_string()).unwrap();
        let payload = config.to_payload().unwrap();
        assert_eq!(payload["ingest_job"]["notes"], "batch 7");
        assert_eq!(payload["site"], "lab-a");
        assert_eq!(payload["ingest_job"]["extent"]["x"], serde_json::json!([0, 2048]));
    }

    #[test]
    fn test_missing_tile_size_is_configuration_error() {
        let mut value: Value = serde_json::from_str(&tile_config_json()).unwrap();
        value["ingest_job"].as_object_mut().unwrap().remove("tile_size");
        let err = JobConfig::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(err, IngestError::Configuration(msg) if msg.contains("tile_size")));
    }

    #[test]
    fn test_volumetric_requires_chunk_processor() {
        let mut value: Value = serde_json::from_str(&tile_config_json()).unwrap();
        value["ingest_job"]["ingest_type"] = Value::String("volumetric".into());
        value["ingest_job"]["chunk_size"] = serde_json::json!({"x": 512, "y": 512, "z": 16});
        let err = JobConfig::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(err, IngestError::Configuration(msg) if msg.contains("chunk_processor")));
    }

    #[test]
    fn test_inverted_extent_rejected() {
        let mut value: Value = serde_json::from_str(&tile_config_json()).unwrap();
        value["ingest_job"]["extent"]["z"] = serde_json::json!([10, 2]);
        assert!(JobConfig::from_json(&value.to_string()).is_err());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            JobConfig::from_json("{ not json"),
            Err(IngestError::Configuration(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(&path, tile_config_json()).unwrap();
        assert!(JobConfig::from_file(&path).is_ok());
        assert!(JobConfig::from_file(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_base_url_respects_explicit_scheme() {
        let backend = BackendConfig {
            name: String::new(),
            class: String::new(),
            host: "http://localhost:8000/".into(),
            protocol: "https".into(),
            api_version: "v1".into(),
        };
        assert_eq!(backend.base_url(), "http://localhost:8000");
    }
}
