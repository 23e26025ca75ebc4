pub mod normalizer;

pub use normalizer::{normalize, normalize_file, normalize_with_format, sniff_format, IMAGE_SIZE, NUM_FEATURES};
