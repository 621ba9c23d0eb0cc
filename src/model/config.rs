//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、モデルパス、学習・前処理・推論の設定をJSON形式で保存・読み込みします。
//! 欠けているフィールドはデフォルト値で補われます。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DigitError, Result};
use crate::ml::normalize::ImageNormalizer;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelSettings {
    /// モデルアーティファクト（tar.gz）のパス
    pub artifact_path: PathBuf,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            artifact_path: PathBuf::from("models/digit_classifier.tar.gz"),
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// トレーニングデータの割合（ディレクトリ形式のデータセットのみ）
    pub train_ratio: f32,
    /// データセットのディレクトリ
    pub data_dir: PathBuf,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 3,
            batch_size: 1000,
            learning_rate: 1e-3,
            seed: 42,
            train_ratio: 0.8,
            data_dir: PathBuf::from("data/mnist"),
        }
    }
}

impl TrainingSettings {
    pub fn validate(&self) -> Result<()> {
        if self.num_epochs == 0 {
            return Err(DigitError::invalid_config("training.num_epochs must be >= 1"));
        }
        if self.batch_size == 0 {
            return Err(DigitError::invalid_config("training.batch_size must be >= 1"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(DigitError::invalid_config(format!(
                "training.learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.train_ratio > 0.0 && self.train_ratio < 1.0) {
            return Err(DigitError::invalid_config(format!(
                "training.train_ratio must be in (0, 1), got {}",
                self.train_ratio
            )));
        }
        Ok(())
    }
}

/// 推論設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceSettings {
    /// この確率未満の予測は棄却（ラベル -1）
    pub confidence_threshold: f32,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
        }
    }
}

impl InferenceSettings {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(DigitError::invalid_config(format!(
                "inference.confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        Ok(())
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// 前処理設定
    pub preprocessing: ImageNormalizer,
    /// 推論設定
    pub inference: InferenceSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| DigitError::config(path.display().to_string(), e.to_string()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| DigitError::config(path.display().to_string(), e.to_string()))?;
        Ok(config)
    }

    /// 設定を読み込む、存在しないか読み込めない場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                log::info!("設定ファイルを読み込みました: {}", path.display());
                config
            }
            Err(e) => {
                log::warn!("設定ファイルの読み込みに失敗しました: {e}");
                log::warn!("デフォルト設定を使用します");
                Self::default()
            }
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| DigitError::config(path.display().to_string(), e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)
            .map_err(|e| DigitError::config(path.display().to_string(), e.to_string()))?;
        log::info!("設定ファイルを保存しました: {}", path.display());
        Ok(())
    }

    /// 設定値を検証
    pub fn validate(&self) -> Result<()> {
        self.training.validate()?;
        self.inference.validate()?;
        if self.model.artifact_path.as_os_str().is_empty() {
            return Err(DigitError::invalid_config("model.artifact_path is empty"));
        }
        Ok(())
    }

    /// 計算デバイスを設定
    pub fn set_device_type(&mut self, device_type: DeviceType) {
        self.device_type = device_type;
    }

    /// モデルパスを設定
    pub fn set_model_path<P: Into<PathBuf>>(&mut self, path: P) {
        self.model.artifact_path = path.into();
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("モデルパス: {}", self.model.artifact_path.display());
        println!("\n--- トレーニング設定 ---");
        println!("データディレクトリ: {}", self.training.data_dir.display());
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("シード: {}", self.training.seed);
        println!("学習データ割合: {}", self.training.train_ratio);
        println!("\n--- 前処理設定 ---");
        println!("内容領域で切り抜き: {}", self.preprocessing.crop_to_content);
        println!("切り抜きマージン: {}px", self.preprocessing.crop_margin);
        println!("背景輝度: {}", self.preprocessing.background_level);
        println!("\n--- 推論設定 ---");
        println!("信頼度しきい値: {}", self.inference.confidence_threshold);
        println!("========================\n");
    }
}
