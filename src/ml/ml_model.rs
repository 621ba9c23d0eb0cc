//! 機械学習モデルの共通定義
//!
//! 手書き数字分類用のCNNモデルと関連する設定を提供します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    tensor::{
        activation::{log_softmax, softmax},
        backend::Backend,
        Tensor,
    },
};

/// クラス数（数字 0～9）
pub const NUM_CLASSES: usize = 10;

/// 画像サイズ（28x28、MNISTと同じ）
pub const IMAGE_SIZE: usize = 28;

/// クラス名の定義（インデックス = 数字）
pub const CLASS_NAMES: [&str; NUM_CLASSES] = ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"];

/// モデル設定
///
/// アーキテクチャはアーティファクト互換性のため固定です。
/// この設定はアーティファクトに保存され、読み込み時に照合されます。
#[derive(Config, Debug, PartialEq)]
pub struct ClassifierConfig {
    /// 分類クラス数
    #[config(default = 10)]
    pub num_classes: usize,
    /// 入力画像サイズ（正方形、1チャネル）
    #[config(default = 28)]
    pub image_size: usize,
    /// Conv1のフィルタ数
    #[config(default = 16)]
    pub conv1_filters: usize,
    /// Conv2のフィルタ数
    #[config(default = 36)]
    pub conv2_filters: usize,
    /// 畳み込みカーネルサイズ
    #[config(default = 5)]
    pub kernel_size: usize,
    /// 全結合層のユニット数
    #[config(default = 128)]
    pub hidden_units: usize,
}

impl ClassifierConfig {
    /// 2回目のプーリング後の特徴マップサイズ
    ///
    /// Conv (padding無し): size -> size - (k - 1)
    /// Pool (2x2, stride 2): size -> size / 2 (切り捨て)
    pub fn feature_map_size(&self) -> usize {
        let shrink = self.kernel_size.saturating_sub(1);
        let after_conv1 = self.image_size.saturating_sub(shrink);
        let after_pool1 = after_conv1 / 2;
        let after_conv2 = after_pool1.saturating_sub(shrink);
        after_conv2 / 2
    }

    /// Flatten後の特徴次元
    pub fn flattened_features(&self) -> usize {
        let size = self.feature_map_size();
        self.conv2_filters * size * size
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> DigitClassifier<B> {
        let d = self.flattened_features();
        log::debug!(
            "[Model] 入力 1x{0}x{0} -> 特徴マップ {1}x{2}x{2} -> FC {3} -> {4} -> {5}",
            self.image_size,
            self.conv2_filters,
            self.feature_map_size(),
            d,
            self.hidden_units,
            self.num_classes
        );

        let kernel = [self.kernel_size, self.kernel_size];

        DigitClassifier {
            // Conv1: 5x5 (no padding, stride 1)
            conv1: Conv2dConfig::new([1, self.conv1_filters], kernel).init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),

            // Conv2: 5x5 (no padding, stride 1)
            conv2: Conv2dConfig::new([self.conv1_filters, self.conv2_filters], kernel)
                .init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),

            fc1: LinearConfig::new(d, self.hidden_units).init(device),
            fc2: LinearConfig::new(self.hidden_units, self.num_classes).init(device),

            activation: Relu::new(),
        }
    }
}

/// 手書き数字分類用CNNモデル
///
/// # アーキテクチャ
/// - Conv 5x5 (16) + ReLU + MaxPool 2x2
/// - Conv 5x5 (36) + ReLU + MaxPool 2x2
/// - Flatten (36 * 4 * 4 = 576)
/// - FC: 576 -> 128 + ReLU
/// - FC: 128 -> 10
/// - Softmax (確率出力時)
#[derive(Module, Debug)]
pub struct DigitClassifier<B: Backend> {
    conv1: Conv2d<B>, // 1 -> 16
    pool1: MaxPool2d,
    conv2: Conv2d<B>, // 16 -> 36
    pool2: MaxPool2d,

    // 全結合層
    fc1: Linear<B>, // 576 -> 128
    fc2: Linear<B>, // 128 -> 10

    activation: Relu,
}

impl<B: Backend> DigitClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 1, 28, 28]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        // Flatten
        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);

        self.fc2.forward(x)
    }

    /// 確率ベクトルを出力（Softmax）
    pub fn forward_probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習用）
    ///
    /// one-hotターゲットとのクロスエントロピーを計算します。
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 1, 28, 28]
    /// - `targets`: one-hotターゲット [batch_size, num_classes]
    ///
    /// # 戻り値
    /// - (平均損失 [1], ロジット [batch_size, num_classes])
    pub fn forward_loss(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 2>,
    ) -> (Tensor<B, 1>, Tensor<B, 2>) {
        let logits = self.forward(images);
        let log_probs = log_softmax(logits.clone(), 1);
        let loss = (log_probs * targets).sum_dim(1).mean().neg();

        (loss, logits)
    }

    /// 出力層を0で初期化したモデル（常に一様分布を出力する）
    #[cfg(test)]
    pub(crate) fn with_zeroed_output(mut self, device: &B::Device) -> Self {
        let [d_input, d_output] = self.fc2.weight.val().dims();
        self.fc2 = LinearConfig::new(d_input, d_output)
            .with_initializer(burn::nn::Initializer::Zeros)
            .init(device);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CpuBackend, CpuDevice};

    #[test]
    fn test_feature_map_size() {
        let config = ClassifierConfig::new();
        assert_eq!(config.feature_map_size(), 4);
        assert_eq!(config.flattened_features(), 576);
    }

    #[test]
    fn test_forward_shape() {
        let device = CpuDevice::default();
        let model = ClassifierConfig::new().init::<CpuBackend>(&device);
        let images = Tensor::<CpuBackend, 4>::zeros([3, 1, IMAGE_SIZE, IMAGE_SIZE], &device);

        let logits = model.forward(images);
        assert_eq!(logits.dims(), [3, NUM_CLASSES]);
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let device = CpuDevice::default();
        let model = ClassifierConfig::new().init::<CpuBackend>(&device);
        let images = Tensor::<CpuBackend, 4>::ones([2, 1, IMAGE_SIZE, IMAGE_SIZE], &device);

        let probs = model.forward_probabilities(images);
        let sums: Vec<f32> = probs.sum_dim(1).into_data().iter::<f32>().collect();
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-4, "sum = {sum}");
        }
    }

    #[test]
    fn test_forward_loss_is_non_negative() {
        let device = CpuDevice::default();
        let model = ClassifierConfig::new().init::<CpuBackend>(&device);
        let images = Tensor::<CpuBackend, 4>::ones([2, 1, IMAGE_SIZE, IMAGE_SIZE], &device);
        let targets = Tensor::<CpuBackend, 2>::from_floats(
            [
                [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
                [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            ],
            &device,
        );

        let (loss, logits) = model.forward_loss(images, targets);
        let loss: f32 = loss.into_data().iter::<f32>().next().unwrap_or(f32::NAN);
        assert!(loss.is_finite());
        assert!(loss >= 0.0);
        assert_eq!(logits.dims(), [2, NUM_CLASSES]);
    }

    #[test]
    fn test_zeroed_output_is_uniform() {
        let device = CpuDevice::default();
        let model = ClassifierConfig::new()
            .init::<CpuBackend>(&device)
            .with_zeroed_output(&device);
        let images = Tensor::<CpuBackend, 4>::ones([1, 1, IMAGE_SIZE, IMAGE_SIZE], &device);

        let probs: Vec<f32> = model
            .forward_probabilities(images)
            .into_data()
            .iter::<f32>()
            .collect();
        for p in probs {
            assert!((p - 0.1).abs() < 1e-6);
        }
    }
}
