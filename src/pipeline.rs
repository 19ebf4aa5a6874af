use crate::android::images::select_dex_images;
use crate::android::zip::ApkArchive;
use crate::config::PipelineConfig;
use crate::error::{IoContext, PipelineError, PipelineResult, SkippedImage};
use crate::orchestrator::{move_file, AttemptOutcome, PatchOrchestrator};
use crate::tools::{
    ApkSigner, ApkSignerCommand, Assembler, Baksmali, Disassembler, SignerMaterial,
    SmaliAssembler,
};
use log::{debug, error, info, warn};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use tempfile::TempDir;

/// Receives human-readable status lines as the pipeline runs.
///
/// Lines are advisory and arrive in order. Implementations must not block.
pub trait ProgressSink {
    fn report(&mut self, status: &str);
}

impl<F: FnMut(&str)> ProgressSink for F {
    fn report(&mut self, status: &str) {
        self(status)
    }
}

impl ProgressSink for mpsc::Sender<String> {
    fn report(&mut self, status: &str) {
        // A dropped receiver only means nobody is watching any more.
        let _ = self.send(status.to_string());
    }
}

impl ProgressSink for Vec<String> {
    fn report(&mut self, status: &str) {
        self.push(status.to_string());
    }
}

/// Outcome of a successful run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchReport {
    /// The signed APK.
    pub output: PathBuf,
    /// DEX entry that held the target method.
    pub patched_entry: String,
    /// Higher-priority images tried before the patched one.
    pub skipped: Vec<SkippedImage>,
    /// Signature files left out of the rebuilt APK.
    pub dropped_signing: Vec<String>,
}

/// Drives one APK through extraction, patching, rebuilding and signing.
///
/// # Examples
///
/// ```no_run
///  use dexpatch::config::PipelineConfig;
///  use dexpatch::pipeline::Pipeline;
///  use dexpatch::tools::SignerConfig;
///  use std::path::{Path, PathBuf};
///
///  let pipeline = Pipeline::with_command_tools(PipelineConfig::default());
///  let signers = vec![SignerConfig {
///      name: "release".into(),
///      private_key: PathBuf::from("release.pk8"),
///      certificates: vec![PathBuf::from("release.x509.pem")],
///  }];
///  let mut progress = |status: &str| println!("{status}");
///  let report = pipeline
///      .run(Path::new("in.apk"), Path::new("out.apk"), &signers, &mut progress)
///      .unwrap();
///  println!("patched {}", report.patched_entry);
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    disassembler: Box<dyn Disassembler + Send + Sync>,
    assembler: Box<dyn Assembler + Send + Sync>,
    signer: Box<dyn ApkSigner + Send + Sync>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        disassembler: Box<dyn Disassembler + Send + Sync>,
        assembler: Box<dyn Assembler + Send + Sync>,
        signer: Box<dyn ApkSigner + Send + Sync>,
    ) -> Self {
        Pipeline {
            config,
            disassembler,
            assembler,
            signer,
        }
    }

    /// Pipeline backed by the baksmali/smali/apksigner command lines from `config.tools`.
    pub fn with_command_tools(config: PipelineConfig) -> Self {
        let disassembler = Baksmali::new(config.tools.baksmali.clone(), config.jobs());
        let assembler = SmaliAssembler {
            command: config.tools.smali.clone(),
        };
        let signer = ApkSignerCommand {
            command: config.tools.apksigner.clone(),
        };
        Pipeline::new(
            config,
            Box::new(disassembler),
            Box::new(assembler),
            Box::new(signer),
        )
    }

    /// Patch the APK at `input` and write the signed result to `output`.
    pub fn run(
        &self,
        input: &Path,
        output: &Path,
        signers: &SignerMaterial,
        progress: &mut dyn ProgressSink,
    ) -> PipelineResult<PatchReport> {
        let result = File::open(input)
            .context(|| format!("opening {}", input.display()))
            .and_then(|file| self.process(file, output, signers, &mut *progress));
        report_failure(result, progress)
    }

    /// Like [`Pipeline::run`], reading the APK from any byte stream.
    pub fn run_from_reader<R: Read>(
        &self,
        input: R,
        output: &Path,
        signers: &SignerMaterial,
        progress: &mut dyn ProgressSink,
    ) -> PipelineResult<PatchReport> {
        let result = self.process(input, output, signers, progress);
        report_failure(result, progress)
    }

    /// Run on a background thread. Progress lines arrive on the handle's receiver; the
    /// receiver disconnects once the run is over and [`PipelineHandle::join`] yields the result.
    pub fn spawn(
        self,
        input: PathBuf,
        output: PathBuf,
        signers: SignerMaterial,
    ) -> PipelineResult<PipelineHandle> {
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("dexpatch-worker".to_string())
            .spawn(move || {
                let mut tx = tx;
                self.run(&input, &output, &signers, &mut tx)
            })
            .context(|| "spawning pipeline worker".to_string())?;
        Ok(PipelineHandle {
            progress: rx,
            worker,
        })
    }

    fn process<R: Read>(
        &self,
        mut input: R,
        output: &Path,
        signers: &SignerMaterial,
        progress: &mut dyn ProgressSink,
    ) -> PipelineResult<PatchReport> {
        self.config.patch.validate()?;
        let root = self.temp_root()?;
        info!("Working in {}", root.path().display());

        progress.report("Copying input APK");
        let input_apk = root.path().join("input.apk");
        copy_stream(&mut input, &input_apk).context(|| "copying input APK".to_string())?;
        let mut archive = ApkArchive::open(&input_apk)?;

        progress.report("Getting sorted DEX file list (highest to lowest)");
        let images = select_dex_images(archive.entry_names())?;
        info!("{} DEX images to try", images.len());

        let orchestrator = PatchOrchestrator::new(
            &self.config.patch,
            self.disassembler.as_ref(),
            self.assembler.as_ref(),
        );
        let mut skipped = Vec::new();
        let promoted = images
            .iter()
            .find_map(|image| {
                progress.report(&format!("Attempting to find method in: {}", image.entry));
                match orchestrator.attempt(&mut archive, image, root.path(), &mut *progress) {
                    Ok(AttemptOutcome::Patched(promoted)) => Some(Ok(promoted)),
                    Ok(AttemptOutcome::Failed { stage, failure }) => {
                        if failure.is_benign() {
                            info!("{} skipped after {stage}: {failure}", image.entry);
                        } else {
                            warn!("{} excluded after {stage}: {failure}", image.entry);
                        }
                        progress.report(&format!(
                            "Method not found or modification failed in: {}. Trying next DEX if available.",
                            image.entry
                        ));
                        skipped.push(SkippedImage {
                            entry: image.entry.clone(),
                            failure,
                        });
                        None
                    }
                    Err(err) => Some(Err(err)),
                }
            })
            .transpose()?;

        let Some(promoted) = promoted else {
            return Err(PipelineError::TargetNotFound { attempts: skipped });
        };
        debug!("Patched image staged in {}", promoted.scratch_dir().display());
        progress.report(&format!("Method found and modified in: {}", promoted.entry));

        progress.report(&format!("Updating APK with modified {}", promoted.entry));
        let patched_bytes = fs::read(&promoted.path)
            .context(|| format!("reading {}", promoted.path.display()))?;
        let unsigned = root.path().join("unsigned_modified.apk");
        let summary = archive.rebuild(&promoted.entry, patched_bytes, &unsigned)?;

        progress.report("Signing modified APK");
        let signed = root.path().join("signed.apk");
        if let Err(source) =
            self.signer
                .sign(&unsigned, &signed, signers, self.config.min_sdk_version)
        {
            let unsigned_archive = if self.config.keep_unsigned_on_signing_failure {
                match keep_unsigned(&unsigned, output) {
                    Ok(kept) => Some(kept),
                    Err(err) => {
                        warn!("Could not keep unsigned APK: {err}");
                        None
                    }
                }
            } else {
                None
            };
            return Err(PipelineError::Signing {
                unsigned_archive,
                source,
            });
        }

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context(|| format!("creating {}", parent.display()))?;
        }
        move_file(&signed, output).context(|| format!("writing {}", output.display()))?;

        let output_name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        progress.report(&format!("APK processing complete: {output_name}"));

        let report = PatchReport {
            output: output.to_path_buf(),
            patched_entry: promoted.entry.clone(),
            skipped,
            dropped_signing: summary.dropped_signing,
        };
        drop(promoted);
        release(root);
        Ok(report)
    }

    fn temp_root(&self) -> PipelineResult<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("apk_processing_");
        match &self.config.work_dir {
            Some(dir) => builder
                .tempdir_in(dir)
                .context(|| format!("creating working directory in {}", dir.display())),
            None => builder
                .tempdir()
                .context(|| "creating working directory".to_string()),
        }
    }
}

/// A pipeline running on a worker thread.
pub struct PipelineHandle {
    progress: mpsc::Receiver<String>,
    worker: thread::JoinHandle<PipelineResult<PatchReport>>,
}

impl PipelineHandle {
    /// Progress lines; iteration ends when the worker finishes.
    pub fn progress(&self) -> &mpsc::Receiver<String> {
        &self.progress
    }

    /// Wait for the final result. A panic on the worker is resumed on the caller.
    pub fn join(self) -> PipelineResult<PatchReport> {
        match self.worker.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn report_failure(
    result: PipelineResult<PatchReport>,
    progress: &mut dyn ProgressSink,
) -> PipelineResult<PatchReport> {
    if let Err(err) = &result {
        match err {
            PipelineError::TargetNotFound { .. } => info!("{err}"),
            _ => error!("Error processing APK: {err}"),
        }
        progress.report(&format!("Error: {err}"));
    }
    result
}

fn copy_stream<R: Read>(input: &mut R, dest: &Path) -> io::Result<u64> {
    let mut out = BufWriter::new(File::create(dest)?);
    let copied = io::copy(input, &mut out)?;
    out.flush()?;
    Ok(copied)
}

/// Copy the unsigned APK to `<output stem>.unsigned.apk` beside `output`.
fn keep_unsigned(unsigned: &Path, output: &Path) -> PipelineResult<PathBuf> {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let kept = output.with_file_name(format!("{stem}.unsigned.apk"));
    if let Some(parent) = kept.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context(|| format!("creating {}", parent.display()))?;
    }
    fs::copy(unsigned, &kept).context(|| format!("keeping unsigned APK at {}", kept.display()))?;
    warn!("Signing failed; unsigned APK kept at {}", kept.display());
    Ok(kept)
}

fn release(root: TempDir) {
    let dir = root.path().display().to_string();
    if let Err(err) = root.close() {
        warn!("Failed to delete working directory {dir}: {err}");
    }
}
