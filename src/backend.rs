//! バックエンド型の定義
//!
//! CPU (NdArray) を既定とし、`wgpu` フィーチャ有効時のみGPUバックエンドを提供します。

use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;

/// 推論用CPUバックエンド
pub type CpuBackend = NdArray<f32>;

/// 学習用CPUバックエンド（自動微分付き）
pub type CpuTrainBackend = Autodiff<CpuBackend>;

/// CPUデバイス
pub type CpuDevice = burn_ndarray::NdArrayDevice;

/// 推論用GPUバックエンド
#[cfg(feature = "wgpu")]
pub type GpuBackend = burn_wgpu::Wgpu;

/// 学習用GPUバックエンド（自動微分付き）
#[cfg(feature = "wgpu")]
pub type GpuTrainBackend = Autodiff<GpuBackend>;

/// GPUデバイス
#[cfg(feature = "wgpu")]
pub type GpuDevice = burn_wgpu::WgpuDevice;
