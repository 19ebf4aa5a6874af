use crate::error::{IoContext, PipelineError, PipelineResult};
use crate::smali_patch::END_METHOD;
use crate::tools::ToolCommand;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Class patched when no configuration overrides it.
pub const DEFAULT_TARGET_CLASS: &str = "com/applisto/appcloner/classes/DefaultProvider";

/// Signature line of the method patched by default.
pub const DEFAULT_TARGET_SIGNATURE: &str = ".method public onCreate(Landroid/content/Context;)Z";

/// Default replacement: run the two-context `onCreate` at most once and report success.
pub const DEFAULT_REPLACEMENT_BODY: &str = r#".method public onCreate(Landroid/content/Context;)Z
    .registers 3

    if-eqz p1, :cond_e

    sget-boolean v0, Lcom/applisto/appcloner/classes/DefaultProvider;->sCreated:Z

    if-nez v0, :cond_c

    const/4 v0, 0x1

    sput-boolean v0, Lcom/applisto/appcloner/classes/DefaultProvider;->sCreated:Z

    invoke-virtual {p0, p1, p1}, Lcom/applisto/appcloner/classes/DefaultProvider;->onCreate(Landroid/content/Context;Landroid/content/Context;)V

    :cond_c

    const/4 v0, 0x1

    return v0

    :cond_e

    const/4 v0, 0x0

    return v0
.end method"#;

/// Minimum SDK level handed to the signer unless configured otherwise (Android 5.0).
pub const DEFAULT_MIN_SDK_VERSION: u32 = 21;

/// Which method to replace, and with what.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSpec {
    /// Class path, slash- or dot-separated, without the `.smali` extension.
    pub target_class: String,
    /// The method's `.method …` line, matched against trimmed file lines.
    pub target_signature: String,
    /// Complete replacement method, `.method` through `.end method`.
    pub replacement_body: String,
}

impl Default for PatchSpec {
    fn default() -> Self {
        PatchSpec {
            target_class: DEFAULT_TARGET_CLASS.to_string(),
            target_signature: DEFAULT_TARGET_SIGNATURE.to_string(),
            replacement_body: DEFAULT_REPLACEMENT_BODY.to_string(),
        }
    }
}

impl PatchSpec {
    pub fn new(
        target_class: impl Into<String>,
        target_signature: impl Into<String>,
        replacement_body: impl Into<String>,
    ) -> Self {
        PatchSpec {
            target_class: target_class.into(),
            target_signature: target_signature.into(),
            replacement_body: replacement_body.into(),
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.target_class.trim().is_empty() {
            return Err(PipelineError::Config("targetClass is empty".to_string()));
        }
        let signature = self.target_signature.trim();
        if !signature.starts_with(".method ") {
            return Err(PipelineError::Config(format!(
                "targetSignature must be a .method line, got '{signature}'"
            )));
        }
        let mut body = self
            .replacement_body
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty());
        match body.next() {
            Some(first) if first.starts_with(".method ") => {}
            _ => {
                return Err(PipelineError::Config(
                    "replacementBody must start with a .method line".to_string(),
                ))
            }
        }
        if body.last() != Some(END_METHOD) {
            return Err(PipelineError::Config(format!(
                "replacementBody must end with '{END_METHOD}'"
            )));
        }
        Ok(())
    }
}

/// Command lines for the three external tools.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub baksmali: ToolCommand,
    pub smali: ToolCommand,
    pub apksigner: ToolCommand,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        ToolsConfig {
            baksmali: ToolCommand::new("baksmali"),
            smali: ToolCommand::new("smali"),
            apksigner: ToolCommand::new("apksigner"),
        }
    }
}

/// Everything a pipeline run needs besides the input, output and signers.
///
/// # Examples
///
/// ```
///  use dexpatch::config::PipelineConfig;
///
///  let config = PipelineConfig::from_json(r#"{ "minSdkVersion": 24 }"#).unwrap();
///  assert_eq!(config.min_sdk_version, 24);
///  assert!(config.patch.target_class.ends_with("DefaultProvider"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub patch: PatchSpec,
    pub min_sdk_version: u32,
    pub tools: ToolsConfig,
    /// Threads for the disassembler; `None` uses every available core.
    pub disassembler_jobs: Option<usize>,
    /// Directory the temporary working root is created in; `None` uses the system temp dir.
    pub work_dir: Option<PathBuf>,
    /// Copy the unsigned APK next to the output when signing fails.
    pub keep_unsigned_on_signing_failure: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            patch: PatchSpec::default(),
            min_sdk_version: DEFAULT_MIN_SDK_VERSION,
            tools: ToolsConfig::default(),
            disassembler_jobs: None,
            work_dir: None,
            keep_unsigned_on_signing_failure: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> PipelineResult<Self> {
        let config: PipelineConfig =
            serde_json::from_str(json).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.patch.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> PipelineResult<Self> {
        let json = fs::read_to_string(path).context(|| format!("reading {}", path.display()))?;
        Self::from_json(&json)
    }

    pub fn jobs(&self) -> usize {
        self.disassembler_jobs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}
