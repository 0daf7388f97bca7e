pub mod backend;
pub mod cancel;
pub mod converter;
pub mod error;
pub mod locator;
pub mod stream;
pub mod toc;
pub mod tool;
pub mod untar;

// Re-exports for easy access
pub use backend::{Backend, BackendConfig, BlobDescriptor, LocalStore, MultipartStore, OssStore, Uploader};
pub use cancel::CancelToken;
pub use converter::{ConvertOptions, ConvertStream, Layer, MergeOptions, NydusConverter};
pub use stream::ReaderAt;
pub use tool::{FsVersion, NydusImage, NydusTool};
