//! モデル学習
//!
//! ミニバッチ + Adam による学習ループ。エポックごとに学習データで重みを更新し、
//! テストデータで損失と精度を評価します（テストデータで重みは更新しません）。

use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use serde::{Deserialize, Serialize};

use crate::error::{DigitError, Result};
use crate::ml::dataset::{DigitBatcher, DigitDataset};
use crate::ml::ml_model::DigitClassifier;
use crate::model::config::TrainingSettings;

/// 1エポック分の評価値
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub valid_loss: f64,
    pub valid_accuracy: f64,
}

/// 学習履歴（各系列の長さ = 完了したエポック数）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub train_loss: Vec<f64>,
    pub train_accuracy: Vec<f64>,
    pub valid_loss: Vec<f64>,
    pub valid_accuracy: Vec<f64>,
}

impl TrainingHistory {
    pub fn push(&mut self, metrics: EpochMetrics) {
        self.train_loss.push(metrics.train_loss);
        self.train_accuracy.push(metrics.train_accuracy);
        self.valid_loss.push(metrics.valid_loss);
        self.valid_accuracy.push(metrics.valid_accuracy);
    }

    pub fn len(&self) -> usize {
        self.train_loss.len()
    }

    pub fn is_empty(&self) -> bool {
        self.train_loss.is_empty()
    }

    /// 0始まりのエポック番号で評価値を取得
    pub fn epoch(&self, index: usize) -> Option<EpochMetrics> {
        Some(EpochMetrics {
            train_loss: *self.train_loss.get(index)?,
            train_accuracy: *self.train_accuracy.get(index)?,
            valid_loss: *self.valid_loss.get(index)?,
            valid_accuracy: *self.valid_accuracy.get(index)?,
        })
    }

    pub fn last(&self) -> Option<EpochMetrics> {
        self.len().checked_sub(1).and_then(|i| self.epoch(i))
    }
}

/// バッチサイズで重み付けした損失・正解数の集計
#[derive(Debug, Default)]
struct RunningStats {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl RunningStats {
    fn add(&mut self, loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += loss * batch_size as f64;
        self.correct += correct;
        self.samples += batch_size;
    }

    fn loss(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.loss_sum / self.samples as f64
        }
    }

    fn accuracy(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.correct as f64 / self.samples as f64
        }
    }
}

/// 学習器
///
/// 呼び出し側のモデルをその場で更新します。発散で中断した場合、
/// モデルは最後に更新された状態のまま残ります。
pub struct Trainer<B: AutodiffBackend> {
    settings: TrainingSettings,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// 設定を検証して学習器を作成
    pub fn new(settings: TrainingSettings, device: B::Device) -> Result<Self> {
        settings.validate()?;
        Ok(Self { settings, device })
    }

    pub fn settings(&self) -> &TrainingSettings {
        &self.settings
    }

    /// 学習を実行
    ///
    /// # エラー
    /// - 学習・テストデータが空なら `DigitError::Dataset`
    /// - 損失が有限値でなくなったら `DigitError::TrainingDiverged`
    pub fn train(
        &self,
        model: &mut DigitClassifier<B>,
        train_set: DigitDataset,
        test_set: DigitDataset,
    ) -> Result<TrainingHistory> {
        if train_set.is_empty() {
            return Err(DigitError::dataset("training set is empty"));
        }
        if test_set.is_empty() {
            return Err(DigitError::dataset("test set is empty"));
        }

        let settings = &self.settings;
        log::info!(
            "学習を開始します: 学習 {} 枚, テスト {} 枚, エポック数 {}, バッチサイズ {}, 学習率 {}",
            train_set.len(),
            test_set.len(),
            settings.num_epochs,
            settings.batch_size,
            settings.learning_rate
        );

        // ワーカースレッドは使わない（同期実行）
        let loader_train = DataLoaderBuilder::new(DigitBatcher::<B>::new(self.device.clone()))
            .batch_size(settings.batch_size)
            .shuffle(settings.seed)
            .num_workers(0)
            .build(train_set);
        let loader_valid =
            DataLoaderBuilder::new(DigitBatcher::<B::InnerBackend>::new(self.device.clone()))
                .batch_size(settings.batch_size)
                .num_workers(0)
                .build(test_set);

        let mut optimizer = AdamConfig::new().init::<B, DigitClassifier<B>>();
        let mut history = TrainingHistory::default();

        for epoch in 1..=settings.num_epochs {
            let mut train_stats = RunningStats::default();

            for (index, batch) in loader_train.iter().enumerate() {
                let batch_size = batch.images.dims()[0];
                let (loss, logits) = model.forward_loss(batch.images, batch.targets);

                let loss_value = loss.clone().into_scalar().elem::<f64>();
                if !loss_value.is_finite() {
                    log::error!("損失が発散しました: epoch {epoch}, batch {}", index + 1);
                    return Err(DigitError::training_diverged(epoch, index + 1, loss_value));
                }

                let correct = count_correct(logits, batch.labels);
                train_stats.add(loss_value, correct, batch_size);

                let grads = GradientsParams::from_grads(loss.backward(), &*model);
                *model = optimizer.step(settings.learning_rate, model.clone(), grads);

                log::debug!(
                    "[Epoch {epoch}] batch {}: loss {loss_value:.4}, acc {:.4}",
                    index + 1,
                    correct as f64 / batch_size as f64
                );
            }

            // 検証（勾配なし）
            let model_valid = model.valid();
            let mut valid_stats = RunningStats::default();
            for batch in loader_valid.iter() {
                let batch_size = batch.images.dims()[0];
                let (loss, logits) = model_valid.forward_loss(batch.images, batch.targets);

                let loss_value = loss.into_scalar().elem::<f64>();
                if !loss_value.is_finite() {
                    return Err(DigitError::training_diverged(epoch, 0, loss_value));
                }
                valid_stats.add(loss_value, count_correct(logits, batch.labels), batch_size);
            }

            let metrics = EpochMetrics {
                train_loss: train_stats.loss(),
                train_accuracy: train_stats.accuracy(),
                valid_loss: valid_stats.loss(),
                valid_accuracy: valid_stats.accuracy(),
            };
            log::info!(
                "[Epoch {epoch}/{}] train loss {:.4}, acc {:.2}% | valid loss {:.4}, acc {:.2}%",
                settings.num_epochs,
                metrics.train_loss,
                metrics.train_accuracy * 100.0,
                metrics.valid_loss,
                metrics.valid_accuracy * 100.0
            );
            history.push(metrics);
        }

        Ok(history)
    }
}

/// ロジットの argmax がラベルと一致した数
fn count_correct<B: Backend>(logits: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = logits.dims();
    let correct = logits
        .argmax(1)
        .reshape([batch_size])
        .equal(labels)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>();
    correct.max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CpuBackend, CpuDevice, CpuTrainBackend};
    use crate::ml::dataset::DigitItem;
    use crate::ml::ml_model::ClassifierConfig;
    use crate::ml::normalize::ImageTensor;

    fn metrics(value: f64) -> EpochMetrics {
        EpochMetrics {
            train_loss: value,
            train_accuracy: value / 10.0,
            valid_loss: value * 2.0,
            valid_accuracy: value / 20.0,
        }
    }

    fn tiny_dataset(count: usize) -> DigitDataset {
        DigitDataset::new(
            (0..count)
                .map(|i| {
                    let image = ImageTensor::uniform((i % 10) as f32 / 10.0);
                    DigitItem::new(image, (i % 10) as i64).unwrap()
                })
                .collect(),
        )
    }

    #[test]
    fn test_history_push_and_last() {
        let mut history = TrainingHistory::default();
        assert!(history.is_empty());
        assert!(history.last().is_none());

        history.push(metrics(1.0));
        history.push(metrics(0.5));
        assert_eq!(history.len(), 2);
        assert_eq!(history.epoch(0), Some(metrics(1.0)));
        assert_eq!(history.last(), Some(metrics(0.5)));
        assert!(history.epoch(2).is_none());
    }

    #[test]
    fn test_running_stats_weighted_by_batch_size() {
        let mut stats = RunningStats::default();
        stats.add(1.0, 3, 4);
        stats.add(4.0, 1, 1);
        assert!((stats.loss() - 1.6).abs() < 1e-12);
        assert!((stats.accuracy() - 0.8).abs() < 1e-12);
        assert_eq!(RunningStats::default().loss(), 0.0);
    }

    #[test]
    fn test_count_correct() {
        let device = CpuDevice::default();
        let logits = Tensor::<CpuBackend, 2>::from_floats(
            [
                [0.0, 5.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
                [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 3.0],
                [2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            ],
            &device,
        );
        let labels = Tensor::<CpuBackend, 1, Int>::from_ints([1, 9, 4], &device);
        assert_eq!(count_correct(logits, labels), 2);
    }

    #[test]
    fn test_trainer_rejects_zero_epochs() {
        let settings = TrainingSettings {
            num_epochs: 0,
            ..TrainingSettings::default()
        };
        let result = Trainer::<CpuTrainBackend>::new(settings, CpuDevice::default());
        assert!(matches!(result, Err(DigitError::InvalidConfig(_))));
    }

    #[test]
    fn test_trainer_rejects_empty_sets() {
        let device = CpuDevice::default();
        let trainer = Trainer::<CpuTrainBackend>::new(TrainingSettings::default(), device.clone())
            .unwrap();
        let mut model = ClassifierConfig::new().init::<CpuTrainBackend>(&device);

        let err = trainer
            .train(&mut model, DigitDataset::default(), tiny_dataset(10))
            .unwrap_err();
        assert!(matches!(err, DigitError::Dataset(_)));

        let err = trainer
            .train(&mut model, tiny_dataset(10), DigitDataset::default())
            .unwrap_err();
        assert!(matches!(err, DigitError::Dataset(_)));
    }

    #[test]
    fn test_train_two_epochs_small_batches() {
        let device = CpuDevice::default();
        let settings = TrainingSettings {
            num_epochs: 2,
            batch_size: 8,
            ..TrainingSettings::default()
        };
        let trainer = Trainer::<CpuTrainBackend>::new(settings, device.clone()).unwrap();
        let mut model = ClassifierConfig::new().init::<CpuTrainBackend>(&device);

        let history = trainer
            .train(&mut model, tiny_dataset(20), tiny_dataset(10))
            .unwrap();
        assert_eq!(history.len(), 2);
        for i in 0..2 {
            let m = history.epoch(i).unwrap();
            assert!(m.train_loss.is_finite() && m.train_loss >= 0.0);
            assert!(m.valid_loss.is_finite() && m.valid_loss >= 0.0);
            assert!((0.0..=1.0).contains(&m.train_accuracy));
            assert!((0.0..=1.0).contains(&m.valid_accuracy));
        }
    }

    #[test]
    fn test_huge_learning_rate_diverges() {
        let device = CpuDevice::default();
        let settings = TrainingSettings {
            num_epochs: 3,
            batch_size: 2,
            learning_rate: 1e30,
            ..TrainingSettings::default()
        };
        let trainer = Trainer::<CpuTrainBackend>::new(settings, device.clone()).unwrap();
        let mut model = ClassifierConfig::new().init::<CpuTrainBackend>(&device);

        let err = trainer
            .train(&mut model, tiny_dataset(10), tiny_dataset(10))
            .unwrap_err();
        match err {
            DigitError::TrainingDiverged { epoch, loss, .. } => {
                assert!((1..=3).contains(&epoch));
                assert!(!loss.is_finite());
            }
            other => panic!("unexpected error: {other}"),
        }

        // 中断後もモデルはそのまま使える
        let input = Tensor::<CpuBackend, 4>::zeros([1, 1, 28, 28], &device);
        assert_eq!(model.valid().forward(input).dims(), [1, 10]);
    }
}
