pub mod config;
pub mod inference_config;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, DeviceType, InferenceSettings, ModelSettings, TrainingSettings};
pub use inference_config::InferenceConfig;
pub use model_metadata::{ModelMetadata, ARTIFACT_FORMAT_VERSION};
pub use model_storage::{
    load_metadata, load_model, load_model_with_metadata, print_metadata_info, save_model,
    save_model_with_metadata,
};
