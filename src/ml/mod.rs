pub mod dataset;
pub mod inference;
pub mod label_codec;
pub mod ml_model;
pub mod normalize;
pub mod training;

pub use dataset::{DigitBatch, DigitBatcher, DigitDataset, DigitItem};
pub use inference::{apply_confidence_gate, Prediction, Predictor, REJECTED_LABEL};
pub use label_codec::{decode, encode, OneHot, ProbabilityVector};
pub use ml_model::{ClassifierConfig, DigitClassifier, CLASS_NAMES, IMAGE_SIZE, NUM_CLASSES};
pub use normalize::{ImageNormalizer, ImageTensor};
pub use training::{EpochMetrics, Trainer, TrainingHistory};
