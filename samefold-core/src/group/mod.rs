mod cluster;
mod similarity;

pub use cluster::{GroupCounters, GrouperOptions, build_groups};
pub use similarity::weighted_jaccard;
