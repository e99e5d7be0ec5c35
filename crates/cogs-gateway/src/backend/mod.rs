pub mod adapter;
pub mod descriptor;
pub mod http_adapter;
pub mod router;

pub use adapter::{BackendAdapter, GenerateTextOutput, GenerateTextParams, SearchResult, SynthesizeParams};
pub use descriptor::{BackendDescriptor, SelectionPolicy};
pub use http_adapter::{adapters_from_config, HttpAdapter};
pub use router::BackendRouter;
