pub mod upload_loader;

pub use upload_loader::{load_all_uploads, load_upload};
