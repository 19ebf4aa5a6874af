use crate::android::zip::ApkZipError;
use crate::tools::ToolError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for the patch pipeline.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Why a single DEX image did not end up patched.
///
/// `ClassNotFound` and `MethodNotFound` are the expected outcome for every image except the one
/// holding the target; the tool failures exclude the image but never stop the search.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ImageFailure {
    #[error("target class not found")]
    ClassNotFound,
    #[error("target method not found")]
    MethodNotFound,
    #[error("disassembly failed: {0}")]
    Disassembly(String),
    #[error("reassembly failed: {0}")]
    Reassembly(String),
}

impl ImageFailure {
    /// True for the not-found outcomes that simply mean "try the next image".
    pub fn is_benign(&self) -> bool {
        matches!(self, ImageFailure::ClassNotFound | ImageFailure::MethodNotFound)
    }
}

/// One DEX entry that was tried and skipped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedImage {
    pub entry: String,
    pub failure: ImageFailure,
}

/// Terminal failures of a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no classes*.dex images found in the APK")]
    NoCandidateImages,

    #[error("target method not found in any DEX image ({} tried)", attempts.len())]
    TargetNotFound { attempts: Vec<SkippedImage> },

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("APK error: {0}")]
    Archive(#[from] ApkZipError),

    /// The unsigned APK was built but the signer rejected it. `unsigned_archive` is set when the
    /// caller asked for the unsigned output to be kept for diagnosis.
    #[error("signing failed: {source}")]
    Signing {
        unsigned_archive: Option<PathBuf>,
        #[source]
        source: ToolError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        PipelineError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Attach a short description of the step being performed to an I/O error.
pub(crate) trait IoContext<T> {
    fn context(self, context: impl FnOnce() -> String) -> PipelineResult<T>;
}

impl<T> IoContext<T> for Result<T, io::Error> {
    fn context(self, context: impl FnOnce() -> String) -> PipelineResult<T> {
        self.map_err(|source| PipelineError::io(context(), source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_failures_describe_themselves() {
        assert_eq!(ImageFailure::MethodNotFound.to_string(), "target method not found");
        let failure = ImageFailure::Reassembly("bad label".to_string());
        assert_eq!(failure.to_string(), "reassembly failed: bad label");
        assert!(!failure.is_benign());
        assert!(ImageFailure::ClassNotFound.is_benign());

        let err = PipelineError::TargetNotFound {
            attempts: vec![SkippedImage {
                entry: "classes.dex".to_string(),
                failure: ImageFailure::ClassNotFound,
            }],
        };
        assert_eq!(err.to_string(), "target method not found in any DEX image (1 tried)");
    }
}
