pub mod naming;

pub use naming::{is_clean_name, sanitize_name};
