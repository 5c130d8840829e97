//! Identity resolution - is this record a paper we already know?

mod normalize;
mod resolver;

pub use normalize::{normalize_title, title_similarity};
pub use resolver::{IdentityConflict, IdentityResolver, MatchBasis, Resolution};
