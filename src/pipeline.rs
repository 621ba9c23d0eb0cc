//! 学習から推論までをまとめるパイプライン
//!
//! 設定とデバイスを保持するコンテキストです。グローバルな状態は持ちません。

use std::path::Path;

use burn::{data::dataset::Dataset, module::AutodiffModule, tensor::backend::AutodiffBackend};

use crate::error::Result;
use crate::ml::dataset::DigitDataset;
use crate::ml::inference::Predictor;
use crate::ml::ml_model::{ClassifierConfig, DigitClassifier};
use crate::ml::training::{Trainer, TrainingHistory};
use crate::model::config::AppConfig;
use crate::model::model_metadata::ModelMetadata;
use crate::model::model_storage;

/// モデルアーティファクトの有無
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Present,
    Missing,
}

/// 数字認識パイプライン
pub struct DigitPipeline<B: AutodiffBackend> {
    config: AppConfig,
    device: B::Device,
}

impl<B: AutodiffBackend> DigitPipeline<B> {
    /// 設定を検証してパイプラインを作成
    pub fn new(config: AppConfig, device: B::Device) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, device })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn artifact_path(&self) -> &Path {
        &self.config.model.artifact_path
    }

    /// 起動時のアーティファクト確認
    pub fn artifact_state(&self) -> ArtifactState {
        if self.artifact_path().is_file() {
            ArtifactState::Present
        } else {
            ArtifactState::Missing
        }
    }

    /// 設定のデータディレクトリから (学習用, テスト用) を読み込む
    ///
    /// MNISTのIDXファイルがあればその分割を使い、なければ数字ごとの
    /// サブディレクトリから読み込んでシード付きで分割します。
    pub fn load_dataset(&self) -> Result<(DigitDataset, DigitDataset)> {
        let training = &self.config.training;
        let data_dir = training.data_dir.as_path();

        if DigitDataset::is_mnist_dir(data_dir) {
            log::info!("MNIST形式のデータを読み込みます: {}", data_dir.display());
            return DigitDataset::from_mnist_dir(data_dir);
        }

        log::info!("画像ディレクトリを読み込みます: {}", data_dir.display());
        let dataset = DigitDataset::from_directory(data_dir, &self.config.preprocessing)?;
        let (train, test) = dataset.split(training.train_ratio, training.seed);
        log::info!("学習データ: {} 枚, テストデータ: {} 枚", train.len(), test.len());
        Ok((train, test))
    }

    /// 新しいモデルを作成して学習
    pub fn train(
        &self,
        train_set: DigitDataset,
        test_set: DigitDataset,
    ) -> Result<(DigitClassifier<B>, TrainingHistory)> {
        let trainer = Trainer::<B>::new(self.config.training.clone(), self.device.clone())?;
        let mut model = ClassifierConfig::new().init::<B>(&self.device);
        let history = trainer.train(&mut model, train_set, test_set)?;
        Ok((model, history))
    }

    /// 学習済みモデルを設定のパスに保存
    pub fn save(
        &self,
        model: &DigitClassifier<B>,
        history: TrainingHistory,
    ) -> Result<ModelMetadata> {
        let metadata = ModelMetadata::new(
            ClassifierConfig::new(),
            self.config.preprocessing,
            &self.config.training,
            history,
        );
        model_storage::save_model(&model.valid(), &metadata, self.artifact_path())?;
        Ok(metadata)
    }

    /// 保存済みモデルから推論器を作成
    pub fn predictor(&self) -> Result<Predictor<B::InnerBackend>> {
        Predictor::load(
            self.artifact_path(),
            &self.config.inference,
            self.config.preprocessing,
            self.device.clone(),
        )
    }

    /// アーティファクトがあれば読み込み、なければ学習して保存してから読み込む
    pub fn ensure_predictor<F>(&self, load_data: F) -> Result<Predictor<B::InnerBackend>>
    where
        F: FnOnce() -> Result<(DigitDataset, DigitDataset)>,
    {
        match self.artifact_state() {
            ArtifactState::Present => self.predictor(),
            ArtifactState::Missing => {
                log::warn!(
                    "モデルが見つかりません。学習を実行します: {}",
                    self.artifact_path().display()
                );
                let (train_set, test_set) = load_data()?;
                let (model, history) = self.train(train_set, test_set)?;
                self.save(&model, history)?;
                self.predictor()
            }
        }
    }
}
