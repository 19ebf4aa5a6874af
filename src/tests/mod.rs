mod archive_tests;

use crate::android::zip::{ApkCompression, ApkEntry, ApkWriter};
use crate::config::PatchSpec;
use crate::tools::{ApkSigner, Assembler, Disassembler, SignerMaterial, ToolError};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) const GATE_CLASS: &str = "com/example/Gate";
pub(crate) const GATE_FILE: &str = "com/example/Gate.smali";
pub(crate) const IS_OPEN: &str = ".method public isOpen()Z";

pub(crate) const GATE_SMALI: &str = r#".class public Lcom/example/Gate;
.super Ljava/lang/Object;
.source "Gate.java"


# virtual methods
.method public isOpen()Z
    .registers 2

    const/4 v0, 0x0

    return v0
.end method

.method public toString()Ljava/lang/String;
    .registers 2

    const-string v0, "gate"

    return-object v0
.end method
"#;

/// Same class, but without `isOpen()`.
pub(crate) const GATE_WITHOUT_METHOD: &str = r#".class public Lcom/example/Gate;
.super Ljava/lang/Object;


# virtual methods
.method public toString()Ljava/lang/String;
    .registers 2

    const-string v0, "gate"

    return-object v0
.end method
"#;

pub(crate) const OTHER_SMALI: &str = r#".class public Lcom/example/Other;
.super Ljava/lang/Object;
"#;

pub(crate) const OPEN_BODY: &str = ".method public isOpen()Z
    .registers 2

    const/4 v0, 0x1

    return v0
.end method";

pub(crate) fn gate_patch() -> PatchSpec {
    PatchSpec::new(GATE_CLASS, IS_OPEN, OPEN_BODY)
}

/// A fake DEX image: JSON map of smali path to smali text.
pub(crate) fn fake_image(files: &[(&str, &str)]) -> Vec<u8> {
    let map: BTreeMap<&str, &str> = files.iter().copied().collect();
    serde_json::to_vec(&map).unwrap()
}

pub(crate) fn read_fake_image(bytes: &[u8]) -> BTreeMap<String, String> {
    serde_json::from_slice(bytes).unwrap()
}

/// Write an APK holding `entries` in the given order.
pub(crate) fn write_apk(path: &Path, entries: &[(&str, Vec<u8>, Option<ApkCompression>)]) {
    let mut writer = ApkWriter::new(BufWriter::new(File::create(path).unwrap()));
    for (name, data, compression) in entries {
        if name.ends_with('/') {
            writer.add_directory(name).unwrap();
        } else {
            let entry = ApkEntry::new(data.clone()).with_compression(*compression);
            writer.add_entry(name, &entry).unwrap();
        }
    }
    writer.finish().unwrap();
}

/// Name → bytes of every entry, read back with the zip crate.
pub(crate) fn read_apk(path: &Path) -> Vec<(String, Vec<u8>)> {
    use std::io::Read;
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .map(|idx| {
            let mut entry = archive.by_index(idx).unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            (entry.name().to_string(), data)
        })
        .collect()
}

/// Shared call log for the fake tools.
#[derive(Default)]
pub(crate) struct Calls {
    pub disassembled: Mutex<Vec<String>>,
    pub assembled: AtomicUsize,
    pub signed: AtomicUsize,
    pub min_sdk: AtomicU32,
    pub signers: AtomicUsize,
}

impl Calls {
    pub fn disassembled(&self) -> Vec<String> {
        self.disassembled.lock().unwrap().clone()
    }

    pub fn total(&self) -> usize {
        self.disassembled().len()
            + self.assembled.load(Ordering::SeqCst)
            + self.signed.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeDisassembler {
    pub calls: Arc<Calls>,
    /// Image file names that fail to disassemble.
    pub broken: Vec<String>,
}

impl Disassembler for FakeDisassembler {
    fn disassemble(&self, image: &Path, output_dir: &Path) -> Result<(), ToolError> {
        let name = image.file_name().unwrap().to_string_lossy().into_owned();
        self.calls.disassembled.lock().unwrap().push(name.clone());
        if self.broken.contains(&name) {
            return Err(ToolError::Other(format!("corrupt image {name}")));
        }
        let bytes = fs::read(image)?;
        let files: BTreeMap<String, String> =
            serde_json::from_slice(&bytes).map_err(|e| ToolError::Other(e.to_string()))?;
        for (rel, text) in files {
            let path = output_dir.join(&rel);
            fs::create_dir_all(path.parent().unwrap())?;
            fs::write(path, text)?;
        }
        Ok(())
    }
}

pub(crate) struct FakeAssembler {
    pub calls: Arc<Calls>,
    pub broken: bool,
}

impl Assembler for FakeAssembler {
    fn assemble(&self, source_dir: &Path, output_image: &Path) -> Result<(), ToolError> {
        self.calls.assembled.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            return Err(ToolError::Other("syntax error at line 1".to_string()));
        }
        let mut files = BTreeMap::new();
        gather(source_dir, source_dir, &mut files)?;
        let bytes = serde_json::to_vec(&files).map_err(|e| ToolError::Other(e.to_string()))?;
        fs::write(output_image, bytes)?;
        Ok(())
    }
}

fn gather(root: &Path, dir: &Path, files: &mut BTreeMap<String, String>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            gather(root, &path, files)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .unwrap()
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            files.insert(rel, fs::read_to_string(&path)?);
        }
    }
    Ok(())
}

pub(crate) struct FakeSigner {
    pub calls: Arc<Calls>,
    pub broken: bool,
}

impl ApkSigner for FakeSigner {
    fn sign(
        &self,
        unsigned: &Path,
        signed: &Path,
        signers: &SignerMaterial,
        min_sdk_version: u32,
    ) -> Result<(), ToolError> {
        self.calls.signed.fetch_add(1, Ordering::SeqCst);
        self.calls.min_sdk.store(min_sdk_version, Ordering::SeqCst);
        self.calls.signers.store(signers.len(), Ordering::SeqCst);
        if self.broken {
            return Err(ToolError::Other("keystore locked".to_string()));
        }
        fs::copy(unsigned, signed)?;
        Ok(())
    }
}
