//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（アーキテクチャ、前処理設定、学習履歴など）
//! - model.bin       - モデルの重み（burn MessagePackレコード、f32精度）

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder},
    tensor::backend::Backend,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::error::{DigitError, Result};
use crate::ml::ml_model::{ClassifierConfig, DigitClassifier};
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// メタデータと共にモデルバイナリをTar.gz形式で保存
///
/// 同じディレクトリの一時ファイルに書き込んでから置き換えるため、
/// 読み込み側が書きかけのファイルを見ることはありません。既存のファイルは上書きされます。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<()> {
    let write_err =
        |reason: String| DigitError::artifact_write(output_path.display().to_string(), reason);

    // 親ディレクトリが存在しない場合は作成
    let parent = match output_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .map_err(|e| write_err(format!("failed to create {}: {e}", parent.display())))?;

    let archive = build_archive(metadata, model_binary).map_err(|e| write_err(e.to_string()))?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| write_err(format!("failed to create temporary file: {e}")))?;
    temp_file
        .write_all(&archive)
        .and_then(|_| temp_file.as_file().sync_all())
        .map_err(|e| write_err(e.to_string()))?;
    temp_file
        .persist(output_path)
        .map_err(|e| write_err(e.error.to_string()))?;

    log::info!(
        "モデルを保存しました: {} ({:.2} KB)",
        output_path.display(),
        archive.len() as f64 / 1024.0
    );
    Ok(())
}

fn build_archive(metadata: &ModelMetadata, model_binary: &[u8]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    // tarアーカイブを完成させてgzipストリームを閉じる
    let bytes = tar_builder.into_inner()?.finish()?;
    Ok(bytes)
}

fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, data)?;
    Ok(())
}

fn open_archive(tar_gz_path: &Path) -> Result<Archive<GzDecoder<File>>> {
    let file = File::open(tar_gz_path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => DigitError::artifact_not_found(tar_gz_path.display().to_string()),
        _ => DigitError::Io(e),
    })?;
    Ok(Archive::new(GzDecoder::new(file)))
}

fn corrupt(tar_gz_path: &Path, reason: impl std::fmt::Display) -> DigitError {
    DigitError::artifact_corrupt(tar_gz_path.display().to_string(), reason.to_string())
}

/// アーカイブの中身を読み出す（want_binary = false ならメタデータのみ）
fn read_entries(tar_gz_path: &Path, want_binary: bool) -> Result<(ModelMetadata, Option<Vec<u8>>)> {
    let mut archive = open_archive(tar_gz_path)?;

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    let entries = archive.entries().map_err(|e| corrupt(tar_gz_path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt(tar_gz_path, e))?;
        let name = entry
            .path()
            .map_err(|e| corrupt(tar_gz_path, e))?
            .to_string_lossy()
            .into_owned();

        match name.as_str() {
            METADATA_ENTRY => {
                let mut json_str = String::new();
                entry
                    .read_to_string(&mut json_str)
                    .map_err(|e| corrupt(tar_gz_path, e))?;
                let metadata = ModelMetadata::from_json_string(&json_str).map_err(|e| match e {
                    DigitError::ArtifactCorrupt { reason, .. } => corrupt(tar_gz_path, reason),
                    other => other,
                })?;
                metadata_opt = Some(metadata);
                if !want_binary {
                    break;
                }
            }
            MODEL_ENTRY if want_binary => {
                let mut buffer = Vec::new();
                entry
                    .read_to_end(&mut buffer)
                    .map_err(|e| corrupt(tar_gz_path, e))?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match metadata_opt {
        Some(metadata) => Ok((metadata, model_binary_opt)),
        None => Err(corrupt(tar_gz_path, "metadata.json not found in archive")),
    }
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    read_entries(tar_gz_path, false).map(|(metadata, _)| metadata)
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let (metadata, binary) = read_entries(tar_gz_path, true)?;
    let binary = binary.ok_or_else(|| corrupt(tar_gz_path, "model.bin not found in archive"))?;
    Ok((metadata, binary))
}

/// 学習済みモデルを保存
pub fn save_model<B: Backend>(
    model: &DigitClassifier<B>,
    metadata: &ModelMetadata,
    output_path: &Path,
) -> Result<()> {
    // f32精度で保存
    let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();
    let model_binary = recorder
        .record(model.clone().into_record(), ())
        .map_err(|e| {
            DigitError::artifact_write(output_path.display().to_string(), format!("{e:?}"))
        })?;

    save_model_with_metadata(output_path, metadata, &model_binary)
}

/// 保存済みモデルを読み込む
///
/// # エラー
/// - ファイルが存在しなければ `DigitError::ArtifactNotFound`
/// - 解釈できない・アーキテクチャが一致しなければ `DigitError::ArtifactCorrupt`
pub fn load_model<B: Backend>(
    tar_gz_path: &Path,
    device: &B::Device,
) -> Result<(DigitClassifier<B>, ModelMetadata)> {
    if !tar_gz_path.exists() {
        return Err(DigitError::artifact_not_found(
            tar_gz_path.display().to_string(),
        ));
    }

    let (metadata, model_binary) = load_model_with_metadata(tar_gz_path)?;
    metadata
        .check_compatible()
        .map_err(|reason| corrupt(tar_gz_path, reason))?;

    let model = ClassifierConfig::new().init::<B>(device);
    let expected_params = model.num_params();

    // 壊れた重みはパニックせず RecorderError になる
    let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();
    let record = recorder
        .load(model_binary, device)
        .map_err(|e| corrupt(tar_gz_path, format!("failed to decode weights: {e:?}")))?;
    let model = model.load_record(record);

    let loaded_params = model.num_params();
    if loaded_params != expected_params {
        return Err(corrupt(
            tar_gz_path,
            format!("parameter count mismatch: expected {expected_params}, got {loaded_params}"),
        ));
    }

    log::info!(
        "モデルを読み込みました: {} (パラメータ数 {loaded_params}, 学習日時 {})",
        tar_gz_path.display(),
        metadata.trained_at
    );
    Ok((model, metadata))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    let arch = &metadata.architecture;
    println!("\n=== モデルメタデータ ===");
    println!("形式バージョン: {}", metadata.format_version);
    println!(
        "アーキテクチャ: Conv{k}x{k}({}) -> Conv{k}x{k}({}) -> FC({}) -> {}",
        arch.conv1_filters,
        arch.conv2_filters,
        arch.hidden_units,
        arch.num_classes,
        k = arch.kernel_size
    );
    println!("クラスラベル: {}", metadata.class_labels.join(", "));
    println!(
        "モデル入力サイズ: {}x{}",
        metadata.model_input_size, metadata.model_input_size
    );
    println!(
        "前処理: 切り抜き={}, マージン={}px, 背景輝度={}",
        metadata.preprocessing.crop_to_content,
        metadata.preprocessing.crop_margin,
        metadata.preprocessing.background_level
    );
    println!(
        "学習設定: エポック数 {}, バッチサイズ {}, 学習率 {}",
        metadata.num_epochs, metadata.batch_size, metadata.learning_rate
    );
    for i in 0..metadata.history.len() {
        if let Some(m) = metadata.history.epoch(i) {
            println!(
                "  Epoch {}: train loss {:.4} acc {:.2}% | valid loss {:.4} acc {:.2}%",
                i + 1,
                m.train_loss,
                m.train_accuracy * 100.0,
                m.valid_loss,
                m.valid_accuracy * 100.0
            );
        }
    }
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CpuBackend, CpuDevice};
    use crate::ml::normalize::ImageNormalizer;
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
    fn test_save_and_load_raw_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("model.tar.gz");

        save_model_with_metadata(&path, &metadata(), &[1, 2, 3, 4]).unwrap();
        let (meta, binary) = load_model_with_metadata(&path).unwrap();
        assert_eq!(binary, vec![1, 2, 3, 4]);
        assert_eq!(meta.class_labels.len(), 10);

        let meta_only = load_metadata(&path).unwrap();
        assert_eq!(meta_only.trained_at, meta.trained_at);
    }

    #[test]
    fn test_save_overwrites_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");

        save_model_with_metadata(&path, &metadata(), &[1]).unwrap();
        save_model_with_metadata(&path, &metadata(), &[9, 9]).unwrap();
        let (_, binary) = load_model_with_metadata(&path).unwrap();
        assert_eq!(binary, vec![9, 9]);

        // 一時ファイルが残っていない
        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 1);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = load_metadata(Path::new("/nonexistent/model.tar.gz")).unwrap_err();
        assert!(matches!(err, DigitError::ArtifactNotFound(_)));

        let device = CpuDevice::default();
        let err = load_model::<CpuBackend>(Path::new("/nonexistent/model.tar.gz"), &device)
            .unwrap_err();
        assert!(matches!(err, DigitError::ArtifactNotFound(_)));
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        std::fs::write(&path, b"definitely not gzip").unwrap();

        let err = load_metadata(&path).unwrap_err();
        assert!(matches!(err, DigitError::ArtifactCorrupt { .. }));
    }

    #[test]
    fn test_missing_model_entry_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");

        let encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        let mut builder = Builder::new(encoder);
        let json = metadata().to_json_string().unwrap();
        append_entry(&mut builder, METADATA_ENTRY, json.as_bytes()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let err = load_model_with_metadata(&path).unwrap_err();
        assert!(matches!(err, DigitError::ArtifactCorrupt { .. }));
    }

    #[test]
    fn test_bad_weights_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        save_model_with_metadata(&path, &metadata(), &[0xde, 0xad, 0xbe, 0xef]).unwrap();

        let device = CpuDevice::default();
        let err = load_model::<CpuBackend>(&path, &device).unwrap_err();
        assert!(matches!(err, DigitError::ArtifactCorrupt { .. }), "{err}");
    }

    #[test]
    fn test_empty_weights_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        save_model_with_metadata(&path, &metadata(), &[]).unwrap();

        let device = CpuDevice::default();
        let err = load_model::<CpuBackend>(&path, &device).unwrap_err();
        assert!(matches!(err, DigitError::ArtifactCorrupt { .. }), "{err}");
    }

    #[test]
    fn test_truncated_weights_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        let device = CpuDevice::default();

        let model = ClassifierConfig::new().init::<CpuBackend>(&device);
        save_model(&model, &metadata(), &path).unwrap();
        let (meta, binary) = load_model_with_metadata(&path).unwrap();
        save_model_with_metadata(&path, &meta, &binary[..binary.len() / 2]).unwrap();

        let err = load_model::<CpuBackend>(&path, &device).unwrap_err();
        assert!(matches!(err, DigitError::ArtifactCorrupt { .. }), "{err}");
    }

    #[test]
    fn test_incompatible_architecture_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        let device = CpuDevice::default();

        let model = ClassifierConfig::new().init::<CpuBackend>(&device);
        let mut meta = metadata();
        meta.architecture = ClassifierConfig::new().with_conv1_filters(8);
        save_model(&model, &meta, &path).unwrap();

        let err = load_model::<CpuBackend>(&path, &device).unwrap_err();
        assert!(err.to_string().contains("architecture"));
    }
}
