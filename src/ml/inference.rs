//! 推論エンジン
//!
//! 保存済みモデルを読み込み、画像1枚ごとに数字ラベルと確率ベクトルを返します。
//! 最大確率がしきい値未満の場合はラベル `-1`（棄却）を返します。棄却はエラーではありません。

use std::path::Path;

use burn::tensor::backend::Backend;
use serde::Serialize;

use crate::error::{DigitError, Result};
use crate::ml::label_codec::ProbabilityVector;
use crate::ml::ml_model::DigitClassifier;
use crate::ml::normalize::{ImageNormalizer, ImageTensor};
use crate::model::config::InferenceSettings;
use crate::model::inference_config::InferenceConfig;
use crate::model::model_storage;

/// 信頼できる予測がないことを表すラベル
pub const REJECTED_LABEL: i32 = -1;

/// 推論結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    /// 予測ラベル（0～9、棄却時は -1）
    pub label: i32,
    /// 各数字の確率（棄却時も変更しない）
    pub probabilities: ProbabilityVector,
    /// 最大確率のインデックス
    pub candidate: usize,
    /// 候補の確率
    pub confidence: f32,
}

impl Prediction {
    pub fn is_rejected(&self) -> bool {
        self.label == REJECTED_LABEL
    }

    /// 棄却されていなければ数字を返す
    pub fn digit(&self) -> Option<u8> {
        u8::try_from(self.label).ok()
    }
}

/// 信頼度ゲート
///
/// 候補の確率がしきい値未満ならラベルを -1 にします。
pub fn apply_confidence_gate(probabilities: ProbabilityVector, threshold: f32) -> Prediction {
    let candidate = probabilities.argmax();
    let confidence = probabilities.get(candidate).unwrap_or(0.0);
    let label = if confidence < threshold {
        REJECTED_LABEL
    } else {
        candidate as i32
    };

    Prediction {
        label,
        probabilities,
        candidate,
        confidence,
    }
}

/// 推論器
///
/// 読み込み後のモデルは変更されません。
pub struct Predictor<B: Backend> {
    model: DigitClassifier<B>,
    config: InferenceConfig,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn new(model: DigitClassifier<B>, config: InferenceConfig, device: B::Device) -> Self {
        Self {
            model,
            config,
            device,
        }
    }

    /// モデルファイルを読み込んで推論器を作成
    pub fn load(
        model_path: &Path,
        settings: &InferenceSettings,
        normalizer: ImageNormalizer,
        device: B::Device,
    ) -> Result<Self> {
        let (model, metadata) = model_storage::load_model::<B>(model_path, &device)?;
        let config = InferenceConfig::from_metadata(&metadata, settings, normalizer)?;
        log::info!(
            "推論器を初期化しました ({} クラス, しきい値 {})",
            config.num_total_classes(),
            config.confidence_threshold
        );

        Ok(Self::new(model, config, device))
    }

    /// 画像ファイルを分類
    pub fn predict(&self, image_path: &Path) -> Result<Prediction> {
        let image = self.config.normalizer.normalize_path(image_path)?;
        let prediction = self.predict_tensor(&image)?;

        if prediction.is_rejected() {
            log::warn!(
                "{}: 信頼度が低いため棄却しました (候補 {}, 確率 {:.3})",
                image_path.display(),
                prediction.candidate,
                prediction.confidence
            );
        } else {
            log::debug!(
                "{}: {} (確率 {:.3})",
                image_path.display(),
                prediction.label,
                prediction.confidence
            );
        }
        Ok(prediction)
    }

    /// 正規化済み画像を分類
    pub fn predict_tensor(&self, image: &ImageTensor) -> Result<Prediction> {
        let input = image.to_tensor::<B>(&self.device);
        let output = self.model.forward_probabilities(input);

        let values: Vec<f32> = output.into_data().iter::<f32>().collect();
        let probabilities = ProbabilityVector::from_slice(&values).ok_or_else(|| {
            DigitError::artifact_corrupt(
                "<loaded model>",
                format!("model produced {} outputs, expected 10", values.len()),
            )
        })?;

        Ok(apply_confidence_gate(
            probabilities,
            self.config.confidence_threshold,
        ))
    }

    /// 複数画像を順に分類（結果は入力順、最初の失敗で中断）
    pub fn predict_batch<P: AsRef<Path>>(&self, image_paths: &[P]) -> Result<Vec<Prediction>> {
        image_paths
            .iter()
            .map(|path| self.predict(path.as_ref()))
            .collect()
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }
}
