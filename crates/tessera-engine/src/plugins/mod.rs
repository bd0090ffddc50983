//! Plugins that locate and render source data
//!
//! A job names its plugins by class in the configuration file. The path
//! processor maps a unit coordinate to a source location; the tile or chunk
//! processor turns that location into the bytes that get uploaded.

mod builtin;

pub use builtin::{
    FileChunkProcessor, FilePathProcessor, FileTileProcessor, PassThroughPathProcessor,
    TestChunkProcessor, TestPathProcessor, TestTileProcessor,
};

use crate::config::{IngestJobSpec, JobConfig, PluginSpec};
use crate::error::{IngestError, Result};
use crate::types::{IngestType, TileCoord};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Map a unit coordinate to the location of its source data
#[async_trait]
pub trait PathProcessor: Send + Sync {
    async fn resolve(&self, coord: &TileCoord) -> Result<String>;
}

/// Produce the bytes of one 2D tile
#[async_trait]
pub trait TileProcessor: Send + Sync {
    async fn render(&self, coord: &TileCoord, location: &str) -> Result<Vec<u8>>;
}

/// Produce the bytes of one 3D chunk
#[async_trait]
pub trait ChunkProcessor: Send + Sync {
    async fn render(&self, coord: &TileCoord, location: &str) -> Result<Vec<u8>>;
}

/// Construction parameters for a plugin
#[derive(Debug, Clone)]
pub struct PluginParams {
    pub name: String,
    pub params: Value,
    pub ingest_job: IngestJobSpec,
}

impl PluginParams {
    fn invalid(&self, kind: &'static str, reason: String) -> IngestError {
        IngestError::plugin(kind, self.name.clone(), reason)
    }

    pub fn required_str(&self, kind: &'static str, key: &str) -> Result<&str> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| self.invalid(kind, format!("missing string parameter '{key}'")))
    }

    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.params.get(key).and_then(Value::as_str).unwrap_or(default)
    }

    pub fn i64_or(&self, kind: &'static str, key: &str, default: i64) -> Result<i64> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(v) => v
                .as_i64()
                .ok_or_else(|| self.invalid(kind, format!("parameter '{key}' must be an integer"))),
        }
    }

    pub fn u64_opt(&self, kind: &'static str, key: &str) -> Result<Option<u64>> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.invalid(kind, format!("parameter '{key}' must be a non-negative integer"))),
        }
    }
}

type Factory<T> = Arc<dyn Fn(&PluginParams) -> Result<Arc<T>> + Send + Sync>;

/// Turns plugin class names from a job configuration into instances
#[derive(Default, Clone)]
pub struct PluginRegistry {
    paths: HashMap<String, Factory<dyn PathProcessor>>,
    tiles: HashMap<String, Factory<dyn TileProcessor>>,
    chunks: HashMap<String, Factory<dyn ChunkProcessor>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the bundled processors
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_path_processor("FilePathProcessor", |p| {
            Ok(Arc::new(FilePathProcessor::new(p)?) as Arc<dyn PathProcessor>)
        });
        registry.register_path_processor("TestPathProcessor", |_| {
            Ok(Arc::new(TestPathProcessor) as Arc<dyn PathProcessor>)
        });
        registry.register_path_processor("PassThroughPathProcessor", |_| {
            Ok(Arc::new(PassThroughPathProcessor) as Arc<dyn PathProcessor>)
        });
        registry.register_tile_processor("FileTileProcessor", |_| {
            Ok(Arc::new(FileTileProcessor) as Arc<dyn TileProcessor>)
        });
        registry.register_tile_processor("TestTileProcessor", |p| {
            Ok(Arc::new(TestTileProcessor::new(p)?) as Arc<dyn TileProcessor>)
        });
        registry.register_chunk_processor("FileChunkProcessor", |_| {
            Ok(Arc::new(FileChunkProcessor) as Arc<dyn ChunkProcessor>)
        });
        registry.register_chunk_processor("TestChunkProcessor", |p| {
            Ok(Arc::new(TestChunkProcessor::new(p)?) as Arc<dyn ChunkProcessor>)
        });
        registry
    }

    pub fn register_path_processor<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&PluginParams) -> Result<Arc<dyn PathProcessor>> + Send + Sync + 'static,
    {
        self.paths.insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_tile_processor<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&PluginParams) -> Result<Arc<dyn TileProcessor>> + Send + Sync + 'static,
    {
        self.tiles.insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_chunk_processor<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&PluginParams) -> Result<Arc<dyn ChunkProcessor>> + Send + Sync + 'static,
    {
        self.chunks.insert(name.to_string(), Arc::new(factory));
    }

    fn lookup<'a, T: ?Sized>(
        table: &'a HashMap<String, Factory<T>>,
        kind: &'static str,
        spec: &PluginSpec,
    ) -> Result<&'a Factory<T>> {
        table
            .get(&spec.class)
            .or_else(|| table.get(spec.short_name()))
            .ok_or_else(|| IngestError::plugin(kind, spec.class.clone(), "no such plugin is registered"))
    }

    /// Instantiate the plugins a job configuration names
    pub fn build(&self, config: &JobConfig) -> Result<Plugins> {
        let params = |spec: &PluginSpec| PluginParams {
            name: spec.class.clone(),
            params: spec.params.clone(),
            ingest_job: config.ingest_job.clone(),
        };

        let path_spec = &config.client.path_processor;
        let path_factory = Self::lookup(&self.paths, "path processor", path_spec)?;
        let path = path_factory(&params(path_spec))?;

        let renderer = match config.ingest_job.ingest_type {
            IngestType::Tile => {
                let spec = config.client.tile_processor.as_ref().ok_or_else(|| {
                    IngestError::configuration("tile ingest requires client.tile_processor")
                })?;
                let factory = Self::lookup(&self.tiles, "tile processor", spec)?;
                Renderer::Tile(factory(&params(spec))?)
            },
            IngestType::Volumetric => {
                let spec = config.client.chunk_processor.as_ref().ok_or_else(|| {
                    IngestError::configuration("volumetric ingest requires client.chunk_processor")
                })?;
                let factory = Self::lookup(&self.chunks, "chunk processor", spec)?;
                Renderer::Chunk(factory(&params(spec))?)
            },
        };

        Ok(Plugins { path, renderer })
    }
}

pub enum Renderer {
    Tile(Arc<dyn TileProcessor>),
    Chunk(Arc<dyn ChunkProcessor>),
}

/// The resolved plugin set for one job
pub struct Plugins {
    path: Arc<dyn PathProcessor>,
    renderer: Renderer,
}

impl Plugins {
    pub fn new(path: Arc<dyn PathProcessor>, renderer: Renderer) -> Self {
        Self { path, renderer }
    }

    /// Locate and render one unit
    pub async fn render(&self, coord: &TileCoord) -> Result<Vec<u8>> {
        let location = self.path.resolve(coord).await?;
        match &self.renderer {
            Renderer::Tile(tiles) => tiles.render(coord, &location).await,
            Renderer::Chunk(chunks) => chunks.render(coord, &location).await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::tests::tile_config_json;
    use serde_json::json;

    fn config_with(path_class: &str, tile_class: &str) -> JobConfig {
        let mut value: Value = serde_json::from_str(&tile_config_json()).unwrap();
        value["client"]["path_processor"]["class"] = json!(path_class);
        value["client"]["tile_processor"]["class"] = json!(tile_class);
        value["client"]["tile_processor"]["params"] = json!({"payload_bytes": 32});
        JobConfig::from_json(&value.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_build_builtin_plugins() {
        let config = config_with("ingest.plugins.TestPathProcessor", "TestTileProcessor");
        let plugins = PluginRegistry::with_builtins().build(&config).unwrap();
        let coord = TileCoord {
            x: 1,
            y: 2,
            z: 3,
            t: 0,
            resolution: 0,
        };
        let bytes = plugins.render(&coord).await.unwrap();
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes, plugins.render(&coord).await.unwrap());
    }

    #[test]
    fn test_unknown_plugin_is_reported() {
        let config = config_with("TestPathProcessor", "NoSuchTileProcessor");
        let err = PluginRegistry::with_builtins().build(&config).err().unwrap();
        assert!(matches!(
            err,
            IngestError::Plugin { kind: "tile processor", ref name, .. } if name == "NoSuchTileProcessor"
        ));
    }

    #[test]
    fn test_plugin_params_accessors() {
        let params = PluginParams {
            name: "FilePathProcessor".into(),
            params: json!({"root_dir": "/data", "z_offset": -3, "bad": "x"}),
            ingest_job: JobConfig::from_json(&tile_config_json()).unwrap().ingest_job,
        };
        assert_eq!(params.required_str("path processor", "root_dir").unwrap(), "/data");
        assert!(params.required_str("path processor", "missing").is_err());
        assert_eq!(params.i64_or("path processor", "z_offset", 0).unwrap(), -3);
        assert_eq!(params.i64_or("path processor", "absent", 5).unwrap(), 5);
        assert!(params.i64_or("path processor", "bad", 0).is_err());
        assert_eq!(params.str_or("template", "{z_index}.png"), "{z_index}.png");
    }

    #[tokio::test]
    async fn test_custom_registration_overrides_by_class() {
        struct Fixed;
        #[async_trait]
        impl PathProcessor for Fixed {
            async fn resolve(&self, _coord: &TileCoord) -> Result<String> {
                Ok("fixed".into())
            }
        }

        let mut registry = PluginRegistry::with_builtins();
        registry.register_path_processor("lab.plugins.Fixed", |_| Ok(Arc::new(Fixed) as Arc<dyn PathProcessor>));
        let config = config_with("lab.plugins.Fixed", "TestTileProcessor");
        assert!(registry.build(&config).is_ok());
    }
}
