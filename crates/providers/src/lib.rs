//! Provider side of the acquisition pipeline.
//!
//! Free-form chat text is turned into [`ClassifiedLink`]s by the
//! [`LinkClassifier`]; each link is dispatched through the
//! [`AdapterRegistry`] to a [`ProviderAdapter`] that produces a
//! [`MediaArtifact`] or a [`FetchError`].

pub mod adapter;
pub mod adapters;
pub mod artifact;
pub mod classifier;
pub mod error;
pub mod media_files;
pub mod provider;
pub mod registry;
pub mod retry;

pub use adapter::{FetchRequest, ProviderAdapter};
pub use artifact::{ArtifactKind, MediaArtifact, MediaItem, MediaKind};
pub use classifier::{ClassifiedLink, ClassifierError, LinkClassifier, LinkRuleConfig};
pub use error::{FailureKind, FetchError};
pub use provider::ProviderTag;
pub use registry::AdapterRegistry;
pub use retry::{RetryConfig, RetryOutcome, fetch_with_retry};
