//! Line-level surgery on a single method of a disassembled smali class.

use crate::error::{IoContext, PipelineResult};
use log::{debug, info};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Line closing every smali method body.
pub const END_METHOD: &str = ".end method";

/// Line span `[start, end]` of a method, both inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodBlock {
    pub start: usize,
    pub end: usize,
}

impl MethodBlock {
    pub fn line_count(&self) -> usize {
        self.end - self.start + 1
    }
}

/// Resolve a class (`com/example/Foo` or `com.example.Foo`) to its smali file under a
/// disassembly tree, if the disassembler produced one.
///
/// # Examples
///
/// ```no_run
///  use dexpatch::smali_patch::locate_class;
///  use std::path::Path;
///
///  match locate_class(Path::new("smali_output"), "com/example/Foo") {
///      Some(p) => println!("class file at {}", p.display()),
///      None => println!("not in this image"),
///  }
/// ```
pub fn locate_class(tree: &Path, class_path: &str) -> Option<PathBuf> {
    let relative = class_path.trim().replace('.', "/");
    if relative.is_empty() {
        return None;
    }
    let mut path = tree.to_path_buf();
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        path.push(segment);
    }
    path.set_extension("smali");
    path.is_file().then_some(path)
}

/// Find the first method whose signature line, trimmed, equals `signature`, and the first
/// `.end method` after it.
///
/// An `.end method` line inside the body (which valid smali never has) would end the block early.
pub fn find_method_block<S: AsRef<str>>(lines: &[S], signature: &str) -> Option<MethodBlock> {
    let signature = signature.trim();
    let start = lines
        .iter()
        .position(|line| line.as_ref().trim() == signature)?;
    let end = lines[start + 1..]
        .iter()
        .position(|line| line.as_ref().trim() == END_METHOD)?
        + start
        + 1;
    Some(MethodBlock { start, end })
}

/// Splice `replacement` over `block`, re-indenting it to match the original signature line.
///
/// Non-empty replacement lines lose their own leading whitespace and take the signature's;
/// blank replacement lines stay blank.
pub fn splice_method<S: AsRef<str>>(
    lines: &[S],
    block: MethodBlock,
    replacement: &str,
) -> Vec<String> {
    let signature_line = lines[block.start].as_ref();
    let indentation: String = signature_line
        .chars()
        .take_while(|c| c.is_whitespace())
        .collect();

    let mut out = Vec::with_capacity(lines.len() - block.line_count() + replacement.lines().count());
    out.extend(lines[..block.start].iter().map(|l| l.as_ref().to_string()));
    out.extend(reindent(replacement, &indentation));
    out.extend(lines[block.end + 1..].iter().map(|l| l.as_ref().to_string()));
    out
}

fn reindent<'a>(replacement: &'a str, indentation: &'a str) -> impl Iterator<Item = String> + 'a {
    replacement.lines().map(move |line| {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{indentation}{trimmed}")
        }
    })
}

/// Line content without its terminator, and the terminator itself.
fn split_ending(segment: &str) -> (&str, &str) {
    if let Some(body) = segment.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = segment.strip_suffix('\n') {
        (body, "\n")
    } else {
        (segment, "")
    }
}

/// Replace the method starting with `signature` in a smali file by `replacement`.
///
/// Returns `Ok(false)` without touching the file when the signature or its `.end method` is
/// missing. Otherwise the new text is written to a sibling temp file and renamed over the
/// original.
///
/// # Examples
///
/// ```no_run
///  use dexpatch::smali_patch::replace_method;
///  use std::path::Path;
///
///  let replaced = replace_method(
///      Path::new("smali_output/com/example/Foo.smali"),
///      ".method public isRooted()Z",
///      ".method public isRooted()Z\n    .registers 1\n    const/4 v0, 0x0\n    return v0\n.end method",
///  ).unwrap();
///  assert!(replaced);
/// ```
pub fn replace_method(file: &Path, signature: &str, replacement: &str) -> PipelineResult<bool> {
    let text = fs::read_to_string(file).context(|| format!("reading {}", file.display()))?;
    // Lines outside the block keep their own terminators.
    let segments: Vec<(&str, &str)> = text.split_inclusive('\n').map(split_ending).collect();
    let lines: Vec<&str> = segments.iter().map(|(line, _)| *line).collect();

    let Some(block) = find_method_block(&lines, signature) else {
        debug!(
            "Method block '{}' not found in {}",
            signature.trim(),
            file.display()
        );
        return Ok(false);
    };
    debug!(
        "Method '{}' spans lines {}..={} of {}",
        signature.trim(),
        block.start,
        block.end,
        file.display()
    );

    let (signature_line, newline) = segments[block.start];
    let indentation: String = signature_line
        .chars()
        .take_while(|c| c.is_whitespace())
        .collect();
    let (_, block_ending) = segments[block.end];

    let mut patched = String::with_capacity(text.len() + replacement.len());
    for (line, ending) in &segments[..block.start] {
        patched.push_str(line);
        patched.push_str(ending);
    }
    let body: Vec<String> = reindent(replacement, &indentation).collect();
    for (idx, line) in body.iter().enumerate() {
        patched.push_str(line);
        patched.push_str(if idx + 1 == body.len() { block_ending } else { newline });
    }
    for (line, ending) in &segments[block.end + 1..] {
        patched.push_str(line);
        patched.push_str(ending);
    }
    write_atomically(file, patched.as_bytes())?;

    info!("Method '{}' replaced in {}", signature.trim(), file.display());
    Ok(true)
}

fn write_atomically(file: &Path, contents: &[u8]) -> PipelineResult<()> {
    let dir = file.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp =
        NamedTempFile::new_in(dir).context(|| format!("creating temp file in {}", dir.display()))?;
    tmp.write_all(contents)
        .and_then(|_| tmp.as_file().sync_all())
        .context(|| format!("writing {}", tmp.path().display()))?;
    tmp.persist(file)
        .map_err(|e| e.error)
        .context(|| format!("replacing {}", file.display()))?;
    Ok(())
}
