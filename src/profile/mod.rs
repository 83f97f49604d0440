//! Reuse-time profiling and profiled cache wrappers.

pub mod aet;
pub mod profiled;

pub use aet::SamplingAetProfiler;
pub use profiled::{ProfiledCache, ProfiledLruCache, ProfiledShardedLruCache};
