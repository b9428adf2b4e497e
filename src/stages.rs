//! ステージアクティビティ（Avatar / Scene / Animation）と補償アクティビティ。
//!
//! 3つのステージは同じ手順（processing 化 → 生成依頼 → ポーリング → 保存 → 公開）を
//! [`runner`] で共有し、各モジュールは入力の検証とパラメータの組み立てだけを持つ。

pub mod animation;
pub mod avatar;
pub mod compensation;
pub(crate) mod runner;
pub mod scene;

use std::{sync::Arc, time::Duration};

use crate::{
    clients::{OutputFetcher, ProviderAdapter},
    config::Config,
    observability::metrics::Metrics,
    storage::{AssetStore, keys::extract_key_from_url},
    store::{dao::JobDao, models::JobKind},
    util::clock::MonotonicClock,
};

pub use self::animation::{AnimationInput, AnimationOutput, NarrativeParameters};
pub use self::avatar::{AvatarInput, AvatarOutput};
pub use self::compensation::{DeleteAssetInput, MarkFailedInput, RecordRef, StagedAssetInput};
pub use self::scene::{SceneInput, SceneOutput};

/// ステージごとのプロバイダアダプタ。
#[derive(Clone)]
pub struct ProviderSet {
    pub avatar: Arc<dyn ProviderAdapter>,
    pub scene: Arc<dyn ProviderAdapter>,
    pub animation: Arc<dyn ProviderAdapter>,
}

impl ProviderSet {
    #[must_use]
    pub fn for_kind(&self, kind: JobKind) -> &Arc<dyn ProviderAdapter> {
        match kind {
            JobKind::Avatar => &self.avatar,
            JobKind::Scene => &self.scene,
            JobKind::Animation => &self.animation,
        }
    }
}

/// ポーリング間隔と壁時計上限。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTiming {
    pub poll_interval: Duration,
    pub ceiling: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimings {
    pub avatar: StageTiming,
    pub scene: StageTiming,
    pub animation: StageTiming,
}

impl StageTimings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            avatar: StageTiming {
                poll_interval: config.avatar_poll_interval(),
                ceiling: config.avatar_timeout(),
            },
            scene: StageTiming {
                poll_interval: config.scene_poll_interval(),
                ceiling: config.scene_timeout(),
            },
            animation: StageTiming {
                poll_interval: config.animation_poll_interval(),
                ceiling: config.animation_timeout(),
            },
        }
    }

    #[must_use]
    pub fn for_kind(&self, kind: JobKind) -> StageTiming {
        match kind {
            JobKind::Avatar => self.avatar,
            JobKind::Scene => self.scene,
            JobKind::Animation => self.animation,
        }
    }
}

impl Default for StageTimings {
    fn default() -> Self {
        let image = StageTiming {
            poll_interval: Duration::from_secs(3),
            ceiling: Duration::from_secs(5 * 60),
        };
        Self {
            avatar: image,
            scene: image,
            animation: StageTiming {
                poll_interval: Duration::from_secs(5),
                ceiling: Duration::from_secs(10 * 60),
            },
        }
    }
}

/// アクティビティ実装が共有する依存関係。
#[derive(Clone)]
pub struct Activities {
    jobs: Arc<dyn JobDao>,
    assets: Arc<dyn AssetStore>,
    fetcher: Arc<dyn OutputFetcher>,
    providers: ProviderSet,
    timings: StageTimings,
    metrics: Arc<Metrics>,
    clock: MonotonicClock,
}

impl Activities {
    #[must_use]
    pub fn new(
        jobs: Arc<dyn JobDao>,
        assets: Arc<dyn AssetStore>,
        fetcher: Arc<dyn OutputFetcher>,
        providers: ProviderSet,
        timings: StageTimings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            jobs,
            assets,
            fetcher,
            providers,
            timings,
            metrics,
            clock: MonotonicClock::new(),
        }
    }

    #[must_use]
    pub fn jobs(&self) -> &Arc<dyn JobDao> {
        &self.jobs
    }

    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// 公開URLから削除対象のキーを復元する。復元できなければ `None`。
    #[must_use]
    pub fn asset_key_for(&self, url: &str) -> Option<String> {
        extract_key_from_url(url, self.assets.bucket())
    }
}
