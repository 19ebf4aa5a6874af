//! # dexpatch
//!
//! Replace one smali method inside an APK and produce a re-signed APK.
//!
//! The APK's `classes*.dex` images are tried from the highest number down. Each image is
//! extracted, disassembled to smali, searched for the target class and method, and if found the
//! method is spliced out for the replacement body and the image reassembled. The first image
//! that patches cleanly is written back into a fresh copy of the APK, with the old signature
//! files stripped, and the result is handed to the signer.
//!
//! ```no_run
//!  use dexpatch::config::{PatchSpec, PipelineConfig};
//!  use dexpatch::pipeline::Pipeline;
//!  use dexpatch::tools::SignerConfig;
//!  use std::path::{Path, PathBuf};
//!
//!  let mut config = PipelineConfig::default();
//!  config.patch = PatchSpec::new(
//!      "com/scottyab/rootbeer/RootBeer",
//!      ".method public isRooted()Z",
//!      ".method public isRooted()Z\n    .registers 2\n    const/4 v0, 0x0\n    return v0\n.end method",
//!  );
//!  let signers = vec![SignerConfig {
//!      name: "debug".into(),
//!      private_key: PathBuf::from("debug.pk8"),
//!      certificates: vec![PathBuf::from("debug.x509.pem")],
//!  }];
//!  let pipeline = Pipeline::with_command_tools(config);
//!  let mut progress = |status: &str| println!("{status}");
//!  pipeline
//!      .run(Path::new("app.apk"), Path::new("app-patched.apk"), &signers, &mut progress)
//!      .unwrap();
//! ```

pub mod android;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod smali_patch;
#[cfg(test)]
mod tests;
pub mod tools;

pub use config::{PatchSpec, PipelineConfig};
pub use error::{ImageFailure, PipelineError, PipelineResult};
pub use pipeline::{PatchReport, Pipeline, ProgressSink};
