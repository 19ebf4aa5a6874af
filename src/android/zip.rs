use crc32fast::Hasher as Crc32;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use log::{debug, info};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use zip::read::ZipArchive;
use zip::result::ZipError;

/// Result alias for APK (ZIP) operations.
pub type ApkZipResult<T> = Result<T, ApkZipError>;

/// Errors surfaced by the APK reading/rebuilding helpers.
#[derive(Debug, Error)]
pub enum ApkZipError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("ZIP error: {0}")]
    Zip(ZipError),
    #[error("entry not found in APK: {0}")]
    EntryNotFound(String),
    #[error("{0}")]
    InvalidInput(String),
}

impl From<ZipError> for ApkZipError {
    fn from(value: ZipError) -> Self {
        match value {
            ZipError::Io(err) => ApkZipError::Io(err),
            other => ApkZipError::Zip(other),
        }
    }
}

/// Compression preference for an APK entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApkCompression {
    Stored,
    Deflated,
}

impl ApkCompression {
    fn method(self) -> u16 {
        match self {
            ApkCompression::Stored => 0,
            ApkCompression::Deflated => 8,
        }
    }
}

/// A single file entry, as read from or written to an APK.
#[derive(Clone, Debug)]
pub struct ApkEntry {
    pub data: Vec<u8>,
    pub unix_mode: Option<u32>,
    pub compression: Option<ApkCompression>,
}

impl ApkEntry {
    pub fn new(data: Vec<u8>) -> Self {
        ApkEntry {
            data,
            unix_mode: None,
            compression: None,
        }
    }

    pub fn with_mode(mut self, mode: Option<u32>) -> Self {
        self.unix_mode = mode;
        self
    }

    pub fn with_compression(mut self, compression: Option<ApkCompression>) -> Self {
        self.compression = compression;
        self
    }
}

/// Read-only index over an APK on disk.
///
/// Entry names are kept in central directory order, so callers that enumerate and then rebuild
/// see the same ordering the original archive had. The source file is never modified.
///
/// # Examples
///
/// ```no_run
///  use dexpatch::android::zip::ApkArchive;
///  use std::path::Path;
///
///  let mut apk = ApkArchive::open("app.apk").unwrap();
///  for name in apk.entry_names() {
///      println!("{name}");
///  }
///  let written = apk.extract("classes.dex", Path::new("/tmp/classes.dex")).unwrap();
///  println!("{written} bytes extracted");
/// ```
pub struct ApkArchive {
    path: PathBuf,
    archive: ZipArchive<BufReader<File>>,
    names: Vec<String>,
}

impl ApkArchive {
    /// Open an APK and index its entries.
    pub fn open(path: impl AsRef<Path>) -> ApkZipResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(BufReader::new(file))?;
        let mut names = Vec::with_capacity(archive.len());
        for idx in 0..archive.len() {
            let entry = archive.by_index_raw(idx)?;
            names.push(entry.name().to_string());
        }
        debug!("Indexed {} entries in {}", names.len(), path.display());
        Ok(ApkArchive {
            path: path.to_path_buf(),
            archive,
            names,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Entry names in archive order, directories included.
    pub fn entry_names(&self) -> &[String] {
        &self.names
    }

    /// Copy one entry's uncompressed bytes to `dest`, returning the number of bytes written.
    pub fn extract(&mut self, name: &str, dest: &Path) -> ApkZipResult<u64> {
        let mut entry = match self.archive.by_name(name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => {
                return Err(ApkZipError::EntryNotFound(name.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let mut out = BufWriter::new(File::create(dest)?);
        let written = io::copy(&mut entry, &mut out)?;
        out.flush()?;
        debug!("Extracted {name} ({written} bytes) to {}", dest.display());
        Ok(written)
    }

    /// Write a fresh APK at `output` holding every entry of this archive except the one named
    /// `replaced_entry` and any prior signing metadata, followed by `replacement` stored under
    /// `replaced_entry`.
    ///
    /// Retained entries keep their bytes, compression method and unix mode. The replacement
    /// inherits the compression of the entry it replaces.
    ///
    /// # Examples
    ///
    /// ```no_run
    ///  use dexpatch::android::zip::ApkArchive;
    ///  use std::path::Path;
    ///
    ///  let mut apk = ApkArchive::open("app.apk").unwrap();
    ///  let patched = std::fs::read("classes2.dex").unwrap();
    ///  let summary = apk.rebuild("classes2.dex", patched, Path::new("unsigned.apk")).unwrap();
    ///  println!("dropped {:?}", summary.dropped_signing);
    /// ```
    pub fn rebuild(
        &mut self,
        replaced_entry: &str,
        replacement: Vec<u8>,
        output: &Path,
    ) -> ApkZipResult<RebuildSummary> {
        let replaced_entry = normalize_entry_name(replaced_entry)?;
        let mut writer = ApkWriter::new(BufWriter::new(File::create(output)?));
        let mut summary = RebuildSummary::default();
        let mut replacement_compression = None;

        for idx in 0..self.archive.len() {
            let mut entry = self.archive.by_index(idx)?;
            let name = entry.name().to_string();

            if name == replaced_entry {
                replacement_compression = known_compression(entry.compression());
                summary.replaced_original = true;
                continue;
            }
            if is_signing_metadata(&name) {
                debug!("Dropping signing metadata {name}");
                summary.dropped_signing.push(name);
                continue;
            }
            if entry.is_dir() {
                writer.add_directory(&name)?;
                summary.retained += 1;
                continue;
            }

            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            let apk_entry = ApkEntry::new(data)
                .with_mode(entry.unix_mode())
                .with_compression(known_compression(entry.compression()));
            writer.add_entry(&name, &apk_entry)?;
            summary.retained += 1;
        }

        debug!(
            "Appending {replaced_entry} ({} bytes) to {}",
            replacement.len(),
            output.display()
        );
        let replacement =
            ApkEntry::new(replacement).with_compression(replacement_compression);
        writer.add_entry(&replaced_entry, &replacement)?;
        writer.finish()?.flush()?;

        info!(
            "Rebuilt {} -> {} ({} retained, {} signing entries dropped)",
            self.path.display(),
            output.display(),
            summary.retained,
            summary.dropped_signing.len()
        );
        Ok(summary)
    }
}

/// What [`ApkArchive::rebuild`] did with the original entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    /// Entries copied across unchanged (directories included).
    pub retained: usize,
    /// Whether the original archive held an entry under the replaced name.
    pub replaced_original: bool,
    /// Prior signature files that were left out.
    pub dropped_signing: Vec<String>,
}

impl RebuildSummary {
    /// Number of entries in the rebuilt archive.
    pub fn output_entries(&self) -> usize {
        self.retained + 1
    }
}

/// True for v1 signing artifacts that a re-sign regenerates: `META-INF/MANIFEST.MF` and the
/// `.SF`/`.RSA`/`.DSA`/`.EC`/`SIG-*` files beside it.
pub fn is_signing_metadata(name: &str) -> bool {
    let Some(file) = name.strip_prefix("META-INF/") else {
        return false;
    };
    if file.is_empty() || file.contains('/') {
        return false;
    }
    let upper = file.to_ascii_uppercase();
    upper == "MANIFEST.MF"
        || upper.starts_with("SIG-")
        || [".SF", ".RSA", ".DSA", ".EC"]
            .iter()
            .any(|ext| upper.ends_with(ext))
}

fn known_compression(method: zip::CompressionMethod) -> Option<ApkCompression> {
    match method {
        zip::CompressionMethod::Stored => Some(ApkCompression::Stored),
        zip::CompressionMethod::Deflated => Some(ApkCompression::Deflated),
        _ => None,
    }
}

/// Streaming ZIP writer laying entries out the way zipalign expects.
///
/// Entries are written in the order they are added. Stored entries are padded to a 4-byte
/// boundary (16 KiB for native libraries) through the local header's extra field.
pub struct ApkWriter<W: Write> {
    out: W,
    offset: u64,
    central_records: Vec<CentralDirectoryRecord>,
    names: HashSet<String>,
}

impl<W: Write> ApkWriter<W> {
    pub fn new(out: W) -> Self {
        ApkWriter {
            out,
            offset: 0,
            central_records: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Append a file entry.
    pub fn add_entry(&mut self, name: &str, entry: &ApkEntry) -> ApkZipResult<()> {
        self.claim_name(name)?;
        let plan = plan_entry(name, entry);
        let offset = self.local_offset()?;
        let extra_len = match plan.alignment {
            Some(align) => alignment_padding(offset, name.len(), align),
            None => 0,
        };

        let compressed = match plan.compression {
            ApkCompression::Stored => None,
            ApkCompression::Deflated => Some(deflate_bytes(&entry.data)?),
        };
        let payload = compressed.as_deref().unwrap_or(&entry.data);

        let mut crc = Crc32::new();
        crc.update(&entry.data);
        let record = CentralDirectoryRecord {
            file_name: name.as_bytes().to_vec(),
            compression: plan.compression,
            crc32: crc.finalize(),
            compressed_size: size_u32(payload.len(), name)?,
            uncompressed_size: size_u32(entry.data.len(), name)?,
            local_header_offset: offset,
            external_attrs: entry.unix_mode.unwrap_or(0o644) << 16,
            is_directory: false,
        };

        let mut header = Vec::with_capacity(30 + name.len() + extra_len as usize);
        write_local_header(&mut header, &record, 20, extra_len as u16);
        header.extend(std::iter::repeat(0u8).take(extra_len as usize));
        self.emit(&header)?;
        self.emit(payload)?;
        self.central_records.push(record);
        Ok(())
    }

    /// Append an explicit directory entry (`name` must end with `/`).
    pub fn add_directory(&mut self, name: &str) -> ApkZipResult<()> {
        if !name.ends_with('/') {
            return Err(ApkZipError::InvalidInput(format!(
                "directory entry {name} must end with '/'"
            )));
        }
        self.claim_name(name)?;
        let record = CentralDirectoryRecord {
            file_name: name.as_bytes().to_vec(),
            compression: ApkCompression::Stored,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            local_header_offset: self.local_offset()?,
            external_attrs: (0o755u32 << 16) | 0x10,
            is_directory: true,
        };
        let mut header = Vec::with_capacity(30 + name.len());
        write_local_header(&mut header, &record, 10, 0);
        self.emit(&header)?;
        self.central_records.push(record);
        Ok(())
    }

    /// Write the central directory and hand back the underlying writer.
    pub fn finish(mut self) -> ApkZipResult<W> {
        if self.central_records.len() > u16::MAX as usize {
            return Err(ApkZipError::InvalidInput(format!(
                "{} entries exceed the ZIP limit of {}",
                self.central_records.len(),
                u16::MAX
            )));
        }
        let central_start = self.local_offset()?;
        let mut central = Vec::new();
        for record in &self.central_records {
            write_central_directory_entry(&mut central, record);
        }
        let central_size = size_u32(central.len(), "central directory")?;
        write_end_of_central_directory(
            &mut central,
            self.central_records.len(),
            central_size,
            central_start,
        );
        self.emit(&central)?;
        Ok(self.out)
    }

    fn claim_name(&mut self, name: &str) -> ApkZipResult<()> {
        if name.is_empty() {
            return Err(ApkZipError::InvalidInput(
                "entry name must not be empty".to_string(),
            ));
        }
        if !self.names.insert(name.to_string()) {
            return Err(ApkZipError::InvalidInput(format!(
                "duplicate entry name {name}"
            )));
        }
        Ok(())
    }

    fn local_offset(&self) -> ApkZipResult<u32> {
        u32::try_from(self.offset).map_err(|_| {
            ApkZipError::InvalidInput("APK exceeds 4 GiB; ZIP64 output is not supported".into())
        })
    }

    fn emit(&mut self, bytes: &[u8]) -> ApkZipResult<()> {
        self.out.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct EntryPlan {
    compression: ApkCompression,
    alignment: Option<u32>,
}

#[derive(Clone)]
struct CentralDirectoryRecord {
    file_name: Vec<u8>,
    compression: ApkCompression,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    local_header_offset: u32,
    external_attrs: u32,
    is_directory: bool,
}

impl CentralDirectoryRecord {
    fn flags(&self) -> u16 {
        // Bit 11: file name is UTF-8.
        if self.file_name.is_ascii() {
            0
        } else {
            0x0800
        }
    }
}

// 1980-01-01 00:00:00, the earliest valid DOS timestamp.
const DOS_TIME: u16 = 0;
const DOS_DATE: u16 = (1 << 5) | 1;

fn plan_entry(name: &str, entry: &ApkEntry) -> EntryPlan {
    let mut plan = classify_entry(name);
    if let Some(preferred) = entry.compression {
        plan.compression = preferred;
    }
    match plan.compression {
        ApkCompression::Deflated => plan.alignment = None,
        ApkCompression::Stored if plan.alignment.is_none() => plan.alignment = Some(4),
        ApkCompression::Stored => {}
    }
    plan
}

fn write_local_header(
    buf: &mut Vec<u8>,
    record: &CentralDirectoryRecord,
    version_needed: u16,
    extra_len: u16,
) {
    write_u32(buf, 0x04034b50);
    write_u16(buf, version_needed);
    write_u16(buf, record.flags());
    write_u16(buf, record.compression.method());
    write_u16(buf, DOS_TIME);
    write_u16(buf, DOS_DATE);
    write_u32(buf, record.crc32);
    write_u32(buf, record.compressed_size);
    write_u32(buf, record.uncompressed_size);
    write_u16(buf, record.file_name.len() as u16);
    write_u16(buf, extra_len);
    buf.extend_from_slice(&record.file_name);
}

fn write_central_directory_entry(buf: &mut Vec<u8>, record: &CentralDirectoryRecord) {
    write_u32(buf, 0x02014b50);
    write_u16(buf, 0x031E);
    write_u16(buf, if record.is_directory { 10 } else { 20 });
    write_u16(buf, record.flags());
    write_u16(buf, record.compression.method());
    write_u16(buf, DOS_TIME);
    write_u16(buf, DOS_DATE);
    write_u32(buf, record.crc32);
    write_u32(buf, record.compressed_size);
    write_u32(buf, record.uncompressed_size);
    write_u16(buf, record.file_name.len() as u16);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, if record.is_directory { 0x10 } else { 0 });
    write_u32(buf, record.external_attrs);
    write_u32(buf, record.local_header_offset);
    buf.extend_from_slice(&record.file_name);
}

fn write_end_of_central_directory(
    buf: &mut Vec<u8>,
    entry_count: usize,
    central_size: u32,
    central_offset: u32,
) {
    write_u32(buf, 0x06054b50);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, entry_count as u16);
    write_u16(buf, entry_count as u16);
    write_u32(buf, central_size);
    write_u32(buf, central_offset);
    write_u16(buf, 0);
}

fn deflate_bytes(data: &[u8]) -> ApkZipResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn size_u32(len: usize, what: &str) -> ApkZipResult<u32> {
    u32::try_from(len).map_err(|_| {
        ApkZipError::InvalidInput(format!(
            "{what} is larger than 4 GiB; ZIP64 output is not supported"
        ))
    })
}

fn path_to_entry_name(path: &Path) -> ApkZipResult<String> {
    let mut components = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(part) => components.push(part.to_string_lossy().replace('\\', "/")),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(ApkZipError::InvalidInput(format!(
                    "invalid entry path component in {}",
                    path.display()
                )));
            }
            Component::ParentDir => {
                return Err(ApkZipError::InvalidInput(
                    "entry paths may not contain parent components".to_string(),
                ));
            }
        }
    }
    if components.is_empty() {
        return Err(ApkZipError::InvalidInput(
            "entry name must not be empty".to_string(),
        ));
    }
    Ok(components.join("/"))
}

fn normalize_entry_name(name: &str) -> ApkZipResult<String> {
    path_to_entry_name(Path::new(name))
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn alignment_padding(offset: u32, name_len: usize, alignment: u32) -> u32 {
    if alignment <= 1 {
        return 0;
    }
    let base = offset as u64 + 30 + name_len as u64;
    let align = alignment as u64;
    ((align - (base % align)) % align) as u32
}

fn classify_entry(name: &str) -> EntryPlan {
    let lower = name.to_ascii_lowercase();
    let compression = if should_store_uncompressed(&lower) {
        ApkCompression::Stored
    } else {
        ApkCompression::Deflated
    };
    let alignment = if lower.starts_with("lib/") && lower.ends_with(".so") {
        Some(16 * 1024)
    } else {
        None
    };
    EntryPlan {
        compression,
        alignment,
    }
}

fn should_store_uncompressed(name: &str) -> bool {
    name.ends_with(".arsc")
        || name.ends_with(".dex")
        || name.ends_with(".so")
        || matches!(
            name.rsplit('.').next(),
            Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "mp3" | "ogg" | "wav" | "mp4")
        )
}
