mod merge;

pub use merge::{MergeEngine, MergeReport, UserRemoval};
