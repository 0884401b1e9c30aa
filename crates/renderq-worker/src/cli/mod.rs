//! Pieces of the `renderq` command-line client.

pub mod download;
pub mod listener;
pub mod paths;
pub mod submit;

pub use download::ArtifactDownloader;
pub use listener::{lookup_result, wait_for_completion};
pub use paths::{resolve_output_path, sanitize_filename};
pub use submit::{parse_job, receipt};
