use crate::android::images::DexImageRef;
use crate::android::zip::ApkArchive;
use crate::config::PatchSpec;
use crate::error::{ImageFailure, IoContext, PipelineResult};
use crate::pipeline::ProgressSink;
use crate::smali_patch::{locate_class, replace_method};
use crate::tools::{Assembler, Disassembler};
use log::{debug, info, warn};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// How far an attempt on one DEX image got.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptStage {
    Extracted,
    Disassembled,
    ClassLocated,
    MethodLocated,
    Reassembled,
    Promoted,
}

impl fmt::Display for AttemptStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptStage::Extracted => "extracted",
            AttemptStage::Disassembled => "disassembled",
            AttemptStage::ClassLocated => "class located",
            AttemptStage::MethodLocated => "method located",
            AttemptStage::Reassembled => "reassembled",
            AttemptStage::Promoted => "promoted",
        };
        f.write_str(name)
    }
}

/// A patched DEX image, still living in its attempt directory.
///
/// The attempt directory is removed when this value is dropped.
#[derive(Debug)]
pub struct PromotedImage {
    pub entry: String,
    pub path: PathBuf,
    scratch: TempDir,
}

impl PromotedImage {
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }
}

/// Result of one attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    Patched(PromotedImage),
    /// `stage` is the last stage reached before `failure`.
    Failed {
        stage: AttemptStage,
        failure: ImageFailure,
    },
}

/// Runs extract → disassemble → patch → reassemble → promote for one image at a time.
///
/// Expected misses and tool failures come back as [`AttemptOutcome::Failed`]; only I/O and
/// archive errors are returned as `Err`.
pub struct PatchOrchestrator<'a> {
    patch: &'a PatchSpec,
    disassembler: &'a dyn Disassembler,
    assembler: &'a dyn Assembler,
}

impl<'a> PatchOrchestrator<'a> {
    pub fn new(
        patch: &'a PatchSpec,
        disassembler: &'a dyn Disassembler,
        assembler: &'a dyn Assembler,
    ) -> Self {
        PatchOrchestrator {
            patch,
            disassembler,
            assembler,
        }
    }

    /// Try to patch `image` inside a fresh `dex_attempt_*` directory under `work_root`.
    pub fn attempt(
        &self,
        archive: &mut ApkArchive,
        image: &DexImageRef,
        work_root: &Path,
        progress: &mut dyn ProgressSink,
    ) -> PipelineResult<AttemptOutcome> {
        let scratch = tempfile::Builder::new()
            .prefix(&format!("dex_attempt_{}_", image.stem()))
            .tempdir_in(work_root)
            .context(|| format!("creating attempt directory for {}", image.entry))?;

        let extracted = scratch.path().join(&image.entry);
        let size = archive.extract(&image.entry, &extracted)?;
        debug!("Extracted {} ({size} bytes)", image.entry);

        match self.run_stages(&image.entry, &extracted, scratch.path(), progress)? {
            Ok(()) => Ok(AttemptOutcome::Patched(PromotedImage {
                entry: image.entry.clone(),
                path: extracted,
                scratch,
            })),
            Err((stage, failure)) => {
                let dir = scratch.path().display().to_string();
                if let Err(err) = scratch.close() {
                    warn!("Failed to delete attempt directory {dir}: {err}");
                }
                Ok(AttemptOutcome::Failed { stage, failure })
            }
        }
    }

    fn run_stages(
        &self,
        entry: &str,
        extracted: &Path,
        scratch: &Path,
        progress: &mut dyn ProgressSink,
    ) -> PipelineResult<Result<(), (AttemptStage, ImageFailure)>> {
        let mut stage = AttemptStage::Extracted;
        progress.report(&format!("Modifying {entry}"));

        // Dropped on every return below, so the smali never outlives the attempt.
        let tree = tempfile::Builder::new()
            .prefix("smali_output")
            .tempdir_in(scratch)
            .context(|| format!("creating smali output directory in {}", scratch.display()))?;

        progress.report(&format!("Disassembling {entry} to smali"));
        if let Err(err) = self.disassembler.disassemble(extracted, tree.path()) {
            warn!("Error disassembling {entry}: {err}");
            progress.report(&format!("Error disassembling {entry}: {err}"));
            return Ok(Err((stage, ImageFailure::Disassembly(err.to_string()))));
        }
        stage = AttemptStage::Disassembled;

        let Some(class_file) = locate_class(tree.path(), &self.patch.target_class) else {
            info!(
                "Target class {} not found in {entry}",
                self.patch.target_class
            );
            progress.report(&format!("Target class not found in {entry}"));
            return Ok(Err((stage, ImageFailure::ClassNotFound)));
        };
        stage = AttemptStage::ClassLocated;
        let class_name = file_name(&class_file);
        progress.report(&format!("Found target class file: {class_name}"));

        if !replace_method(
            &class_file,
            &self.patch.target_signature,
            &self.patch.replacement_body,
        )? {
            info!(
                "Target method '{}' not found in {}",
                self.patch.target_signature.trim(),
                class_file.display()
            );
            progress.report(&format!("Target method not found in class {class_name}"));
            return Ok(Err((stage, ImageFailure::MethodNotFound)));
        }
        stage = AttemptStage::MethodLocated;
        progress.report(&format!("Method replaced successfully in {class_name}"));

        let modified = scratch.join(format!("modified_{}", file_name(extracted)));
        progress.report(&format!("Reassembling smali to {}", file_name(&modified)));
        if let Err(err) = self.assembler.assemble(tree.path(), &modified) {
            warn!("Error reassembling smali for {entry}: {err}");
            progress.report(&format!("Error reassembling smali: {err}"));
            return Ok(Err((stage, ImageFailure::Reassembly(err.to_string()))));
        }
        stage = AttemptStage::Reassembled;
        debug!("{entry} reached stage {stage}");

        move_file(&modified, extracted)
            .context(|| format!("replacing {} with {}", extracted.display(), modified.display()))?;
        progress.report(&format!("{} successfully modified.", file_name(extracted)));
        info!("{entry} reached stage {}", AttemptStage::Promoted);
        Ok(Ok(()))
    }
}

/// Move `from` onto `to`, replacing it. Falls back to copy-then-delete when a rename is not
/// possible (e.g. across filesystems).
pub(crate) fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!(
                "Rename {} -> {} failed ({err}); copying instead",
                from.display(),
                to.display()
            );
            fs::copy(from, to)?;
            if let Err(err) = fs::remove_file(from) {
                warn!("Could not delete {} after copy: {err}", from.display());
            }
            Ok(())
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_file_replaces_destination() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("modified_classes.dex");
        let to = dir.path().join("classes.dex");
        fs::write(&from, b"patched").unwrap();
        fs::write(&to, b"original").unwrap();

        move_file(&from, &to).unwrap();
        assert_eq!(fs::read(&to).unwrap(), b"patched");
        assert!(!from.exists());
    }

    #[cfg(unix)]
    #[test]
    fn move_file_copies_across_filesystems() {
        use std::os::unix::fs::MetadataExt;

        let shm = Path::new("/dev/shm");
        if !shm.is_dir() {
            return;
        }
        let Ok(source_dir) = TempDir::new_in(shm) else {
            return;
        };
        let dest_dir = TempDir::new().unwrap();
        let source_dev = fs::metadata(source_dir.path()).unwrap().dev();
        let dest_dev = fs::metadata(dest_dir.path()).unwrap().dev();
        if source_dev == dest_dev {
            // Same mount, so rename would succeed and the fallback is not reached.
            return;
        }

        let from = source_dir.path().join("modified_classes2.dex");
        let to = dest_dir.path().join("classes2.dex");
        fs::write(&from, b"patched").unwrap();
        fs::write(&to, b"original").unwrap();

        move_file(&from, &to).unwrap();
        assert_eq!(fs::read(&to).unwrap(), b"patched");
        assert!(!from.exists());
    }

    #[test]
    fn move_file_reports_missing_source() {
        let dir = TempDir::new().unwrap();
        let err = move_file(&dir.path().join("gone.dex"), &dir.path().join("classes.dex"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
