//! エラー型の定義
//!
//! 画像読み込み、ラベル変換、モデル永続化、学習の各段階で発生するエラーを
//! 1つの列挙型にまとめています。低信頼度による棄却はエラーではなく
//! `-1` ラベルとして返されるため、ここには含まれません。

use thiserror::Error;

/// 数字認識パイプラインで発生するエラー
#[derive(Debug, Error)]
pub enum DigitError {
    /// 画像を読み込めない、またはデコードできない
    #[error("failed to read image {path}: {reason}")]
    ImageRead {
        /// 入力画像のパス
        path: String,
        /// 失敗理由
        reason: String,
    },

    /// ラベルが [0, 9] の範囲外
    #[error("invalid label {0}: expected a digit in [0, 9]")]
    InvalidLabel(i64),

    /// モデルアーティファクトが存在しない
    #[error("model artifact not found: {0}")]
    ArtifactNotFound(String),

    /// モデルアーティファクトを解釈できない
    #[error("model artifact {path} is corrupt: {reason}")]
    ArtifactCorrupt {
        /// アーティファクトのパス
        path: String,
        /// 失敗理由
        reason: String,
    },

    /// モデルアーティファクトを書き込めない
    #[error("failed to write model artifact {path}: {reason}")]
    ArtifactWrite {
        /// アーティファクトのパス
        path: String,
        /// 失敗理由
        reason: String,
    },

    /// 学習中に損失が有限値でなくなった
    #[error("training diverged at epoch {epoch}, batch {batch}: loss = {loss}")]
    TrainingDiverged {
        /// 1始まりのエポック番号
        epoch: usize,
        /// 1始まりのバッチ番号（検証中の場合は0）
        batch: usize,
        /// 検出された損失値
        loss: f64,
    },

    /// データセットの読み込み・解析エラー
    #[error("dataset error: {0}")]
    Dataset(String),

    /// 設定値が不正
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// 設定ファイルの読み書きエラー
    #[error("config file {path}: {reason}")]
    Config {
        /// 設定ファイルのパス
        path: String,
        /// 失敗理由
        reason: String,
    },

    /// IOエラー
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DigitError {
    /// 画像読み込みエラーを作成
    #[must_use]
    pub fn image_read(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ImageRead {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// アーティファクト未検出エラーを作成
    #[must_use]
    pub fn artifact_not_found(path: impl Into<String>) -> Self {
        Self::ArtifactNotFound(path.into())
    }

    /// アーティファクト破損エラーを作成
    #[must_use]
    pub fn artifact_corrupt(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ArtifactCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// アーティファクト書き込みエラーを作成
    #[must_use]
    pub fn artifact_write(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ArtifactWrite {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// 学習発散エラーを作成
    #[must_use]
    pub const fn training_diverged(epoch: usize, batch: usize, loss: f64) -> Self {
        Self::TrainingDiverged { epoch, batch, loss }
    }

    /// データセットエラーを作成
    #[must_use]
    pub fn dataset(reason: impl Into<String>) -> Self {
        Self::Dataset(reason.into())
    }

    /// 設定値エラーを作成
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// 設定ファイルエラーを作成
    #[must_use]
    pub fn config(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// クレート共通のResult型
pub type Result<T> = std::result::Result<T, DigitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_image_read() {
        let err = DigitError::image_read("digit.png", "unsupported format");
        assert!(err.to_string().contains("digit.png"));
        assert!(err.to_string().contains("unsupported format"));
    }

    #[test]
    fn error_invalid_label() {
        let err = DigitError::InvalidLabel(12);
        assert!(err.to_string().contains("12"));
    }

    #[test]
    fn error_artifact_not_found() {
        let err = DigitError::artifact_not_found("/models/missing.tar.gz");
        assert!(err.to_string().contains("/models/missing.tar.gz"));
    }

    #[test]
    fn error_artifact_corrupt() {
        let err = DigitError::artifact_corrupt("model.tar.gz", "unexpected end of file");
        assert!(err.to_string().contains("corrupt"));
        assert!(err.to_string().contains("unexpected end of file"));
    }

    #[test]
    fn error_artifact_write() {
        let err = DigitError::artifact_write("out/model.tar.gz", "read-only file system");
        assert!(err.to_string().contains("out/model.tar.gz"));
    }

    #[test]
    fn error_training_diverged() {
        let err = DigitError::training_diverged(2, 7, f64::NAN);
        let msg = err.to_string();
        assert!(msg.contains("epoch 2"));
        assert!(msg.contains("batch 7"));
        assert!(msg.contains("NaN"));
    }

    #[test]
    fn error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: DigitError = io_err.into();
        assert!(matches!(err, DigitError::Io(_)));
    }
}
