//! Terminal UI pieces

pub mod progress;

pub use progress::{SpinnerProgress, create_spinner};
