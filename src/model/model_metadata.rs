//! モデルメタデータの定義
//!
//! アーティファクト（tar.gz）内の `metadata.json` に保存され、読み込み時に
//! アーキテクチャの互換性チェックに使われます。

use serde::{Deserialize, Serialize};

use crate::error::{DigitError, Result};
use crate::ml::ml_model::{ClassifierConfig, CLASS_NAMES, IMAGE_SIZE, NUM_CLASSES};
use crate::ml::normalize::ImageNormalizer;
use crate::ml::training::TrainingHistory;
use crate::model::config::TrainingSettings;

/// アーティファクト形式のバージョン
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// アーティファクト形式のバージョン
    pub format_version: u32,

    /// モデルのアーキテクチャ
    pub architecture: ClassifierConfig,

    /// クラスラベル（インデックス順）
    pub class_labels: Vec<String>,

    /// モデル入力サイズ（28x28）
    pub model_input_size: u32,

    /// 学習時の前処理設定
    pub preprocessing: ImageNormalizer,

    /// 学習エポック数
    pub num_epochs: usize,

    /// バッチサイズ
    pub batch_size: usize,

    /// 学習率
    pub learning_rate: f64,

    /// 学習履歴
    #[serde(default)]
    pub history: TrainingHistory,

    /// モデルの学習時刻（RFC 3339形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        architecture: ClassifierConfig,
        preprocessing: ImageNormalizer,
        training: &TrainingSettings,
        history: TrainingHistory,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            model_input_size: architecture.image_size as u32,
            architecture,
            class_labels: CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
            preprocessing,
            num_epochs: training.num_epochs,
            batch_size: training.batch_size,
            learning_rate: training.learning_rate,
            history,
            trained_at,
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            DigitError::artifact_write("metadata.json", format!("failed to serialize: {e}"))
        })
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            DigitError::artifact_corrupt("metadata.json", format!("invalid metadata JSON: {e}"))
        })
    }

    /// このビルドのモデルで読み込めるか確認
    ///
    /// 不一致の理由を返します。
    pub fn check_compatible(&self) -> std::result::Result<(), String> {
        if self.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(format!(
                "unsupported format version {} (expected {ARTIFACT_FORMAT_VERSION})",
                self.format_version
            ));
        }
        if self.architecture != ClassifierConfig::new() {
            return Err(format!(
                "architecture mismatch: {:?}",
                self.architecture
            ));
        }
        if self.class_labels.len() != NUM_CLASSES {
            return Err(format!(
                "expected {NUM_CLASSES} class labels, got {}",
                self.class_labels.len()
            ));
        }
        if self.model_input_size as usize != IMAGE_SIZE {
            return Err(format!(
                "expected input size {IMAGE_SIZE}, got {}",
                self.model_input_size
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::training::EpochMetrics;

    fn sample_metadata() -> ModelMetadata {
        let mut history = TrainingHistory::default();
        history.push(EpochMetrics {
            train_loss: 0.4,
            train_accuracy: 0.88,
            valid_loss: 0.3,
            valid_accuracy: 0.91,
        });
        ModelMetadata::new(
            ClassifierConfig::new(),
            ImageNormalizer::default(),
            &TrainingSettings::default(),
            history,
        )
    }

    #[test]
    fn test_json_round_trip() {
        let metadata = sample_metadata();
        let json = metadata.to_json_string().unwrap();
        let restored = ModelMetadata::from_json_string(&json).unwrap();

        assert_eq!(restored.architecture, metadata.architecture);
        assert_eq!(restored.history, metadata.history);
        assert_eq!(restored.class_labels, metadata.class_labels);
        assert_eq!(restored.trained_at, metadata.trained_at);
        assert!(restored.check_compatible().is_ok());
    }

    #[test]
    fn test_new_fills_fixed_fields() {
        let metadata = sample_metadata();
        assert_eq!(metadata.format_version, ARTIFACT_FORMAT_VERSION);
        assert_eq!(metadata.model_input_size, 28);
        assert_eq!(metadata.class_labels[9], "9");
        assert_eq!(metadata.num_epochs, 3);
        assert!(chrono::DateTime::parse_from_rfc3339(&metadata.trained_at).is_ok());
    }

    #[test]
    fn test_incompatible_metadata() {
        let mut metadata = sample_metadata();
        metadata.format_version = 99;
        assert!(metadata.check_compatible().is_err());

        let mut metadata = sample_metadata();
        metadata.architecture = ClassifierConfig::new().with_hidden_units(64);
        assert!(metadata.check_compatible().unwrap_err().contains("architecture"));
    }

    #[test]
    fn test_invalid_json_is_corrupt() {
        let err = ModelMetadata::from_json_string("{}").unwrap_err();
        assert!(matches!(err, DigitError::ArtifactCorrupt { .. }));
    }

    #[test]
    fn test_missing_history_defaults_to_empty() {
        let mut value = serde_json::to_value(sample_metadata()).unwrap();
        value.as_object_mut().unwrap().remove("history");
        let restored: ModelMetadata = serde_json::from_value(value).unwrap();
        assert!(restored.history.is_empty());
    }
}
