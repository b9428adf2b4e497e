pub mod fetcher;
pub mod provider;
pub mod replicate;

pub use self::fetcher::{FetchedAsset, HttpFetcher, OutputFetcher, Progress};
pub use self::provider::{PollOutcome, ProviderAdapter, ProviderError, StageParams};
pub use self::replicate::{ReplicateAdapter, ReplicateClient};
