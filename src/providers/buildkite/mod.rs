mod cache;
mod client;
mod fetcher;
mod provider;
mod store;
pub mod types;

pub use fetcher::FetchSummary;
pub use provider::BuildkiteProvider;
pub use store::{BuildStore, MergeStats};
pub use types::Build;
