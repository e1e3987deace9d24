//! Record intake: cleaning and windowing

pub mod preprocess;
pub mod window;

pub use preprocess::{Cleaned, Preprocessor, SERIES_KEY};
pub use window::{Window, WindowSnapshot, WindowStats};
