//! 手書き数字認識
//!
//! 28x28のグレースケール画像に正規化した入力をCNNで10クラスに分類します。
//! 学習（[`ml::Trainer`]）、モデルの保存・読み込み（[`model::model_storage`]）、
//! 信頼度しきい値付きの推論（[`ml::Predictor`]）を提供します。

pub mod backend;
pub mod error;
pub mod ml;
pub mod model;
pub mod pipeline;

pub use error::{DigitError, Result};
pub use pipeline::{ArtifactState, DigitPipeline};
