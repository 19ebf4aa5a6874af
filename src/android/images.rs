use crate::error::{PipelineError, PipelineResult};
use log::debug;
use nom::bytes::complete::tag;
use nom::character::complete::digit0;
use nom::combinator::eof;
use nom::sequence::{pair, preceded, terminated};
use nom::IResult;

/// Base name shared by every DEX image in an APK.
pub const DEX_BASE_NAME: &str = "classes";
/// Extension of a DEX image entry.
pub const DEX_EXTENSION: &str = ".dex";

/// A DEX image inside the APK and the priority derived from its name.
///
/// `classes.dex` has priority 1, `classesN.dex` has priority N.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DexImageRef {
    pub entry: String,
    pub priority: u32,
}

impl DexImageRef {
    /// Parse an entry name, returning `None` for anything that is not a top-level DEX image.
    ///
    /// # Examples
    ///
    /// ```
    ///  use dexpatch::android::images::DexImageRef;
    ///
    ///  assert_eq!(DexImageRef::parse("classes.dex").unwrap().priority, 1);
    ///  assert_eq!(DexImageRef::parse("classes12.dex").unwrap().priority, 12);
    ///  assert!(DexImageRef::parse("classes0.dex").is_none());
    ///  assert!(DexImageRef::parse("lib/classes.dex").is_none());
    /// ```
    pub fn parse(entry: &str) -> Option<DexImageRef> {
        let (_, digits) = dex_image_name(entry).ok()?;
        let priority = if digits.is_empty() {
            1
        } else {
            match digits.parse::<u32>() {
                Ok(0) | Err(_) => return None,
                Ok(n) => n,
            }
        };
        Some(DexImageRef {
            entry: entry.to_string(),
            priority,
        })
    }

    /// File stem of the entry, e.g. `classes2` for `classes2.dex`.
    pub fn stem(&self) -> &str {
        self.entry
            .strip_suffix(DEX_EXTENSION)
            .unwrap_or(&self.entry)
    }
}

// classes<digits>.dex, anchored at both ends
fn dex_image_name(input: &str) -> IResult<&str, &str> {
    terminated(
        preceded(tag(DEX_BASE_NAME), digit0),
        pair(tag(DEX_EXTENSION), eof),
    )(input)
}

/// Pick the DEX images out of an APK listing, highest priority first.
///
/// Equal priorities (`classes.dex` next to `classes1.dex`) keep their listing order.
pub fn select_dex_images<S: AsRef<str>>(entries: &[S]) -> PipelineResult<Vec<DexImageRef>> {
    let mut images: Vec<DexImageRef> = entries
        .iter()
        .filter_map(|name| DexImageRef::parse(name.as_ref()))
        .collect();
    if images.is_empty() {
        return Err(PipelineError::NoCandidateImages);
    }
    images.sort_by(|a, b| b.priority.cmp(&a.priority));
    debug!(
        "Sorted DEX images (highest to lowest): {:?}",
        images.iter().map(|i| i.entry.as_str()).collect::<Vec<_>>()
    );
    Ok(images)
}
