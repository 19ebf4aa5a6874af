use super::{read_apk, write_apk};
use crate::android::zip::{is_signing_metadata, ApkArchive, ApkCompression, ApkZipError};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::Path;
use tempfile::TempDir;

fn sample_apk(path: &Path) {
    write_apk(
        path,
        &[
            ("AndroidManifest.xml", b"<manifest/>".to_vec(), None),
            ("META-INF/", Vec::new(), None),
            ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\n".to_vec(), None),
            ("META-INF/CERT.SF", b"Signature-Version: 1.0\n".to_vec(), None),
            ("META-INF/CERT.RSA", vec![0x30, 0x82, 0x01], None),
            ("META-INF/services/x.Y", b"impl.Z\n".to_vec(), None),
            ("classes.dex", b"dex\n035\0first".to_vec(), Some(ApkCompression::Stored)),
            ("classes2.dex", b"dex\n035\0second".to_vec(), Some(ApkCompression::Deflated)),
            ("res/", Vec::new(), None),
            ("res/raw/data.bin", vec![0u8; 4096], Some(ApkCompression::Deflated)),
            ("res/drawable/icon.png", vec![0x89, b'P', b'N', b'G'], None),
            ("resources.arsc", vec![2u8; 100], Some(ApkCompression::Stored)),
        ],
    );
}

fn compression_by_name(path: &Path) -> BTreeMap<String, zip::CompressionMethod> {
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .map(|idx| {
            let entry = archive.by_index(idx).unwrap();
            (entry.name().to_string(), entry.compression())
        })
        .collect()
}

#[test]
fn lists_entries_in_archive_order() {
    let dir = TempDir::new().unwrap();
    let apk = dir.path().join("in.apk");
    sample_apk(&apk);
    let archive = ApkArchive::open(&apk).unwrap();
    let expected: Vec<String> = read_apk(&apk).into_iter().map(|(n, _)| n).collect();
    assert_eq!(archive.entry_names(), expected.as_slice());
    assert_eq!(archive.entry_names()[0], "AndroidManifest.xml");
    assert_eq!(archive.len(), 12);
    assert!(archive.entry_names().iter().any(|n| n == "classes2.dex"));
    assert!(!archive.entry_names().iter().any(|n| n == "classes3.dex"));
}

#[test]
fn extracts_one_entry() {
    let dir = TempDir::new().unwrap();
    let apk = dir.path().join("in.apk");
    sample_apk(&apk);
    let before = fs::read(&apk).unwrap();

    let mut archive = ApkArchive::open(&apk).unwrap();
    let dest = dir.path().join("classes2.dex");
    let written = archive.extract("classes2.dex", &dest).unwrap();
    assert_eq!(written, 14);
    assert_eq!(fs::read(&dest).unwrap(), b"dex\n035\0second");
    assert_eq!(fs::read(&apk).unwrap(), before);
}

#[test]
fn extracting_a_missing_entry_fails() {
    let dir = TempDir::new().unwrap();
    let apk = dir.path().join("in.apk");
    sample_apk(&apk);
    let mut archive = ApkArchive::open(&apk).unwrap();
    let dest = dir.path().join("classes9.dex");
    match archive.extract("classes9.dex", &dest) {
        Err(ApkZipError::EntryNotFound(name)) => assert_eq!(name, "classes9.dex"),
        other => panic!("unexpected result {other:?}"),
    }
    assert!(!dest.exists());
}

#[test]
fn opening_garbage_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("not.apk");
    fs::write(&path, b"definitely not a zip").unwrap();
    assert!(ApkArchive::open(&path).is_err());
    assert!(matches!(
        ApkArchive::open(dir.path().join("missing.apk")),
        Err(ApkZipError::Io(_))
    ));
}

#[test]
fn rebuild_replaces_one_entry_and_drops_signatures() {
    let dir = TempDir::new().unwrap();
    let apk = dir.path().join("in.apk");
    let out = dir.path().join("out.apk");
    sample_apk(&apk);
    let source_bytes = fs::read(&apk).unwrap();
    let original = read_apk(&apk);

    let mut archive = ApkArchive::open(&apk).unwrap();
    let summary = archive
        .rebuild("classes.dex", b"dex\n035\0patched".to_vec(), &out)
        .unwrap();

    let signing: Vec<String> = original
        .iter()
        .map(|(n, _)| n.clone())
        .filter(|n| is_signing_metadata(n))
        .collect();
    assert_eq!(signing.len(), 3);
    assert_eq!(summary.dropped_signing, signing);
    assert!(summary.replaced_original);

    let rebuilt = read_apk(&out);
    assert_eq!(rebuilt.len(), original.len() - (1 + signing.len()) + 1);
    assert_eq!(rebuilt.len(), summary.output_entries());

    let mut expected: Vec<(String, Vec<u8>)> = original
        .iter()
        .filter(|(n, _)| n != "classes.dex" && !is_signing_metadata(n))
        .cloned()
        .collect();
    expected.push(("classes.dex".to_string(), b"dex\n035\0patched".to_vec()));
    assert_eq!(rebuilt, expected);

    assert_eq!(fs::read(&apk).unwrap(), source_bytes);
}

#[test]
fn rebuild_keeps_compression_methods() {
    let dir = TempDir::new().unwrap();
    let apk = dir.path().join("in.apk");
    let out = dir.path().join("out.apk");
    sample_apk(&apk);

    let mut archive = ApkArchive::open(&apk).unwrap();
    archive
        .rebuild("classes2.dex", b"dex\n035\0patched2".to_vec(), &out)
        .unwrap();

    let before = compression_by_name(&apk);
    let after = compression_by_name(&out);
    for (name, method) in &after {
        assert_eq!(before.get(name), Some(method), "{name}");
    }
    assert_eq!(after["classes2.dex"], zip::CompressionMethod::Deflated);
    assert_eq!(after["classes.dex"], zip::CompressionMethod::Stored);
    assert_eq!(after["res/raw/data.bin"], zip::CompressionMethod::Deflated);
}

#[test]
fn rebuild_appends_entries_missing_from_the_original() {
    let dir = TempDir::new().unwrap();
    let apk = dir.path().join("in.apk");
    let out = dir.path().join("out.apk");
    write_apk(
        &apk,
        &[
            ("AndroidManifest.xml", b"<manifest/>".to_vec(), None),
            ("classes.dex", b"one".to_vec(), None),
        ],
    );

    let mut archive = ApkArchive::open(&apk).unwrap();
    let summary = archive.rebuild("classes2.dex", b"two".to_vec(), &out).unwrap();
    assert!(!summary.replaced_original);
    assert_eq!(summary.retained, 2);

    let names: Vec<String> = read_apk(&out).into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, ["AndroidManifest.xml", "classes.dex", "classes2.dex"]);
}

#[test]
fn rebuild_rejects_escaping_entry_names() {
    let dir = TempDir::new().unwrap();
    let apk = dir.path().join("in.apk");
    write_apk(&apk, &[("classes.dex", b"one".to_vec(), None)]);
    let mut archive = ApkArchive::open(&apk).unwrap();
    let err = archive
        .rebuild("../classes.dex", Vec::new(), &dir.path().join("out.apk"))
        .unwrap_err();
    assert!(matches!(err, ApkZipError::InvalidInput(_)));
}
