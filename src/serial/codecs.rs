/// Codec for line-delimited text frames.
pub mod lines;
