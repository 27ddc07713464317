pub mod common;
pub mod completions;
pub mod product;
pub mod sale;
pub mod sync;
pub mod watch;
