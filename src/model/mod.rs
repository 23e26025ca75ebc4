pub mod artifact;
pub mod config;
pub mod model_metadata;
pub mod model_storage;
pub mod registry;

pub use artifact::ModelArtifact;
pub use config::{DatasetKind, DatasetSettings, EngineConfig};
pub use model_metadata::{print_metadata_info, ModelMetadata, ModelMetrics};
pub use model_storage::{ArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use registry::ModelRegistry;
