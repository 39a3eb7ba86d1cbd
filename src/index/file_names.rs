//! Naming rules for index files.
//!
//! Commit files are `segments_<gen>` with the generation in base 36. Files
//! belonging to a segment start with the segment name (`_<counter>`), and
//! generation-stamped per-segment files insert `_<gen>` before the
//! extension: `_4_2.liv` is generation 2 of segment `_4`'s live docs.

use crate::error::{GalleyError, Result};

/// Prefix of commit files.
pub const SEGMENTS: &str = "segments";

/// The side-pointer file recording the latest generation.
pub const SEGMENTS_GEN: &str = "segments.gen";

/// Name of the writer's advisory lock.
pub const WRITE_LOCK_NAME: &str = "write.lock";

pub const SEGMENT_INFO_EXTENSION: &str = "si";
pub const DATA_EXTENSION: &str = "dat";
pub const LIVE_DOCS_EXTENSION: &str = "liv";
pub const FIELD_UPDATES_EXTENSION: &str = "upd";

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Format a non-negative number in base 36.
pub fn to_radix36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Parse a base-36 number.
pub fn parse_radix36(text: &str) -> Option<u64> {
    if text.is_empty() {
        return None;
    }
    u64::from_str_radix(text, 36).ok()
}

/// `base` + (`_<gen>` unless gen is 0) + `.ext`; `None` for generation -1.
pub fn file_name_from_generation(base: &str, ext: &str, generation: i64) -> Option<String> {
    let ext = if ext.is_empty() {
        String::new()
    } else {
        format!(".{ext}")
    };
    match generation {
        -1 => None,
        0 => Some(format!("{base}{ext}")),
        g if g > 0 => Some(format!("{base}_{}{ext}", to_radix36(g as u64))),
        _ => None,
    }
}

/// Name of the commit file for a generation.
pub fn segments_file_name(generation: i64) -> Option<String> {
    file_name_from_generation(SEGMENTS, "", generation)
}

/// Generation encoded in a commit file name.
pub fn generation_from_segments_file_name(name: &str) -> Result<i64> {
    if name == SEGMENTS {
        return Ok(0);
    }
    name.strip_prefix("segments_")
        .and_then(parse_radix36)
        .map(|g| g as i64)
        .ok_or_else(|| {
            GalleyError::invalid_argument(format!("fileName \"{name}\" is not a segments file"))
        })
}

/// Whether `name` is a commit file (not the side-pointer).
pub fn is_segments_file(name: &str) -> bool {
    name.starts_with(SEGMENTS) && name != SEGMENTS_GEN
}

/// Highest commit generation among `files`, or -1.
pub fn max_segments_generation<S: AsRef<str>>(files: &[S]) -> i64 {
    files
        .iter()
        .map(|f| f.as_ref())
        .filter(|f| is_segments_file(f))
        .filter_map(|f| generation_from_segments_file_name(f).ok())
        .max()
        .unwrap_or(-1)
}

/// `<segment>[_<suffix>].<ext>`
pub fn segment_file_name(segment: &str, suffix: &str, ext: &str) -> String {
    if suffix.is_empty() {
        format!("{segment}.{ext}")
    } else {
        format!("{segment}_{suffix}.{ext}")
    }
}

/// The segment a file belongs to: everything before the first `.` or the
/// second `_`.
pub fn parse_segment_name(file: &str) -> &str {
    let end = file
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '.' || *c == '_')
        .map(|(i, _)| i)
        .unwrap_or(file.len());
    &file[..end]
}

/// Name of a new segment allocated from the catalog counter.
pub fn segment_name(counter: u64) -> String {
    format!("_{}", to_radix36(counter))
}

/// Counter value a segment name was allocated from.
pub fn segment_counter(name: &str) -> Option<u64> {
    name.strip_prefix('_').and_then(parse_radix36)
}

/// Whether a file is owned by the index (and thus subject to deletion).
pub fn is_index_file(name: &str) -> bool {
    (name.starts_with('_') || is_segments_file(name)) && name != WRITE_LOCK_NAME
}
