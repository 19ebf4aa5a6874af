//! The external programs the pipeline leans on: a DEX disassembler, a smali assembler and an
//! APK signer. Each sits behind a trait so the pipeline can be driven by any implementation; the
//! `*Command` types shell out to the usual command-line tools.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use thiserror::Error;

/// Failure reported by an external tool.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

/// Turns a DEX image into a tree of smali files, one per class, laid out by package.
pub trait Disassembler {
    fn disassemble(&self, image: &Path, output_dir: &Path) -> Result<(), ToolError>;
}

/// Turns a tree of smali files back into a single DEX image at `output_image`.
pub trait Assembler {
    fn assemble(&self, source_dir: &Path, output_image: &Path) -> Result<(), ToolError>;
}

/// Signs an unsigned APK, writing the result to `signed`.
pub trait ApkSigner {
    fn sign(
        &self,
        unsigned: &Path,
        signed: &Path,
        signers: &SignerMaterial,
        min_sdk_version: u32,
    ) -> Result<(), ToolError>;
}

/// One signing identity: a private key and its certificate chain.
///
/// The pipeline never reads these files; they are only handed to the [`ApkSigner`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerConfig {
    pub name: String,
    pub private_key: PathBuf,
    pub certificates: Vec<PathBuf>,
}

/// Ordered list of signers, forwarded as-is.
pub type SignerMaterial = Vec<SignerConfig>;

/// A program plus fixed leading arguments, e.g. `java -jar baksmali.jar`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        ToolCommand {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Run with `extra` appended to the fixed arguments, returning stdout on success.
    pub fn run(&self, extra: &[OsString]) -> Result<String, ToolError> {
        debug!("Running {} {:?} {:?}", self.program, self.args, extra);
        let output = Command::new(&self.program)
            .args(&self.args)
            .args(extra)
            .output()
            .map_err(|source| ToolError::Launch {
                program: self.program.clone(),
                source,
            })?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                "{} {:?} {:?} exited with {}: {}",
                self.program, self.args, extra, output.status, stderr
            );
            Err(ToolError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr,
            })
        }
    }
}

/// `baksmali d <image> -o <dir> -j <jobs>`
#[derive(Clone, Debug)]
pub struct Baksmali {
    pub command: ToolCommand,
    pub jobs: usize,
}

impl Baksmali {
    pub fn new(command: ToolCommand, jobs: usize) -> Self {
        Baksmali {
            command,
            jobs: jobs.max(1),
        }
    }
}

impl Disassembler for Baksmali {
    fn disassemble(&self, image: &Path, output_dir: &Path) -> Result<(), ToolError> {
        self.command.run(&[
            "d".into(),
            image.into(),
            "-o".into(),
            output_dir.into(),
            "-j".into(),
            self.jobs.to_string().into(),
        ])?;
        Ok(())
    }
}

/// `smali a <dir> -o <image>`
#[derive(Clone, Debug)]
pub struct SmaliAssembler {
    pub command: ToolCommand,
}

impl Assembler for SmaliAssembler {
    fn assemble(&self, source_dir: &Path, output_image: &Path) -> Result<(), ToolError> {
        self.command.run(&[
            "a".into(),
            source_dir.into(),
            "-o".into(),
            output_image.into(),
        ])?;
        if !output_image.is_file() {
            return Err(ToolError::Other(format!(
                "{} reported success but wrote no {}",
                self.command.program,
                output_image.display()
            )));
        }
        Ok(())
    }
}

/// `apksigner sign --min-sdk-version <n> --key k --cert c [--next-signer …] --out <signed> <unsigned>`
#[derive(Clone, Debug)]
pub struct ApkSignerCommand {
    pub command: ToolCommand,
}

impl ApkSignerCommand {
    fn signer_args(signers: &SignerMaterial) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        for (idx, signer) in signers.iter().enumerate() {
            if idx > 0 {
                args.push("--next-signer".into());
            }
            if !signer.name.is_empty() {
                args.push("--v1-signer-name".into());
                args.push(signer.name.clone().into());
            }
            args.push("--key".into());
            args.push(signer.private_key.clone().into());
            for cert in &signer.certificates {
                args.push("--cert".into());
                args.push(cert.clone().into());
            }
        }
        args
    }
}

impl ApkSigner for ApkSignerCommand {
    fn sign(
        &self,
        unsigned: &Path,
        signed: &Path,
        signers: &SignerMaterial,
        min_sdk_version: u32,
    ) -> Result<(), ToolError> {
        if signers.is_empty() {
            return Err(ToolError::Other("no signers configured".to_string()));
        }
        let mut args: Vec<OsString> = vec![
            "sign".into(),
            "--min-sdk-version".into(),
            min_sdk_version.to_string().into(),
        ];
        args.extend(Self::signer_args(signers));
        args.push("--out".into());
        args.push(signed.into());
        args.push(unsigned.into());
        self.command.run(&args)?;
        Ok(())
    }
}
