use async_trait::async_trait;
use url::Url;

use crate::device::ExecutionDevice;
use crate::errors::Result;
use crate::fetcher::SourceImage;
use crate::postprocess::MaskImage;
use crate::preprocess::ModelInput;
use crate::runtime::RawPrediction;
use crate::store::ArtifactReference;

/// ロード済みセグメンテーションモデルの抽象化
///
/// リクエスト間で読み取り専用に共有される。デバイス上で並行実行できない処理は実装側で直列化する
pub trait SegmentationModel: Send + Sync {
    /// モデルが受け取る正方形（パディング後）入力の一辺
    fn input_size(&self) -> u32;

    fn device(&self) -> ExecutionDevice;

    /// 検証済み入力で推論し、マスクのロジットを返す
    fn predict(&self, input: &ModelInput) -> Result<RawPrediction>;

    /// 推論後に保持しているデバイスのキャッシュを解放
    fn release_caches(&self);
}

/// 入力画像の取得元の抽象化
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<SourceImage>;
}

/// 生成マスクの保存先の抽象化
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// マスクを保存し、保存完了後にその参照を返す
    async fn store(&self, mask: &MaskImage) -> Result<ArtifactReference>;
}
