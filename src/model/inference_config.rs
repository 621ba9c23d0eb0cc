//! モデルメタデータを使用した推論設定
//!
//! 保存されたモデルメタデータとアプリケーション設定から推論に必要な情報をまとめます。

use crate::error::{DigitError, Result};
use crate::ml::normalize::ImageNormalizer;
use crate::model::config::InferenceSettings;
use crate::model::model_metadata::ModelMetadata;

/// 推論用設定
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    /// 信頼度しきい値
    pub confidence_threshold: f32,

    /// 入力画像の前処理
    pub normalizer: ImageNormalizer,

    /// クラスラベル（インデックス順）
    pub class_labels: Vec<String>,
}

impl InferenceConfig {
    /// メタデータと推論設定から作成
    ///
    /// 前処理は呼び出し側が指定したものを使います。学習時の前処理と異なる場合は警告を出します。
    pub fn from_metadata(
        metadata: &ModelMetadata,
        settings: &InferenceSettings,
        normalizer: ImageNormalizer,
    ) -> Result<Self> {
        if metadata.preprocessing != normalizer {
            log::warn!(
                "前処理設定が学習時と異なります: 学習時 {:?}, 現在 {:?}",
                metadata.preprocessing,
                normalizer
            );
        }

        let config = Self {
            confidence_threshold: settings.confidence_threshold,
            normalizer,
            class_labels: metadata.class_labels.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(DigitError::invalid_config(format!(
                "confidence threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        Ok(())
    }

    /// クラス数を取得
    pub fn num_total_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// クラスインデックスからラベルを取得
    pub fn class_index_to_label(&self, index: usize) -> Option<&str> {
        self.class_labels.get(index).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ml_model::ClassifierConfig;
    use crate::ml::training::TrainingHistory;
    use crate::model::config::TrainingSettings;

    fn metadata() -> ModelMetadata {
        ModelMetadata::new(
            ClassifierConfig::new(),
            ImageNormalizer::default(),
            &TrainingSettings::default(),
            TrainingHistory::default(),
        )
    }

    #[test]
    fn test_from_metadata() {
        let config = InferenceConfig::from_metadata(
            &metadata(),
            &InferenceSettings::default(),
            ImageNormalizer::default().with_crop(false),
        )
        .unwrap();

        assert_eq!(config.confidence_threshold, 0.5);
        assert!(!config.normalizer.crop_to_content);
        assert_eq!(config.num_total_classes(), 10);
        assert_eq!(config.class_index_to_label(3), Some("3"));
        assert_eq!(config.class_index_to_label(10), None);
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let settings = InferenceSettings {
            confidence_threshold: -0.1,
        };
        let result =
            InferenceConfig::from_metadata(&metadata(), &settings, ImageNormalizer::default());
        assert!(matches!(result, Err(DigitError::InvalidConfig(_))));
    }
}
