//! Index file naming.
//!
//! ```text
//! segments_<gen>          commit manifest, gen in radix 36
//! pending_segments_<gen>  prepared but not yet committed manifest
//! segments.gen            advisory pointer to the latest generation
//! snapshots_<gen>         persisted snapshot registry
//! _<seg>.<ext>            per-segment codec file
//! _<seg>_<gen>.<ext>      generation-numbered live-docs / doc-values file
//! write.lock              the writer lock
//! ```

use lazy_static::lazy_static;
use regex::Regex;

/// Prefix of commit manifests.
pub const SEGMENTS: &str = "segments";

/// Prefix of prepared manifests.
pub const PENDING_SEGMENTS: &str = "pending_segments";

/// The advisory latest-generation pointer.
pub const SEGMENTS_GEN: &str = "segments.gen";

/// Prefix of snapshot store files.
pub const SNAPSHOTS_PREFIX: &str = "snapshots_";

/// The writer lock.
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// Extension of live-docs files.
pub const LIVE_DOCS_EXTENSION: &str = "del";

/// Extension of numeric doc-values update files.
pub const DOC_VALUES_EXTENSION: &str = "dvu";

lazy_static! {
    static ref CODEC_FILE_PATTERN: Regex =
        Regex::new(r"^_[a-z0-9]+(_[a-z0-9]+)?\.[a-z0-9]+$").expect("codec file pattern");
}

/// Render `value` in radix 36, lowercase.
pub fn to_radix36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        let d = (value % 36) as u32;
        digits.push(std::char::from_digit(d, 36).unwrap_or('0'));
        value /= 36;
    }
    digits.iter().rev().collect()
}

/// Parse a radix-36 number written with `[0-9a-z]` only.
pub fn from_radix36(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase()) {
        return None;
    }
    u64::from_str_radix(s, 36).ok()
}

/// `base` if `generation` is 0, else `base_<gen>`, plus `.ext` if given.
pub fn file_name_from_generation(base: &str, ext: &str, generation: u64) -> String {
    let mut name = if generation == 0 {
        base.to_string()
    } else {
        format!("{base}_{}", to_radix36(generation))
    };
    if !ext.is_empty() {
        name.push('.');
        name.push_str(ext);
    }
    name
}

/// `segments_<gen>`.
pub fn segments_file_name(generation: u64) -> String {
    file_name_from_generation(SEGMENTS, "", generation)
}

/// `pending_segments_<gen>`.
pub fn pending_segments_file_name(generation: u64) -> String {
    file_name_from_generation(PENDING_SEGMENTS, "", generation)
}

/// `snapshots_<gen>`.
pub fn snapshots_file_name(generation: u64) -> String {
    format!("{SNAPSHOTS_PREFIX}{}", to_radix36(generation))
}

/// Segment name for a counter value: `_<radix36>`.
pub fn segment_name(counter: u64) -> String {
    format!("_{}", to_radix36(counter))
}

/// Per-segment codec file name: `_<seg>.<ext>`.
pub fn segment_file_name(segment: &str, ext: &str) -> String {
    format!("{segment}.{ext}")
}

/// Generation of a `segments_N`, `pending_segments_N` or `snapshots_N` file
/// name, if `name` is one.
pub fn parse_generation(name: &str) -> Option<u64> {
    if name == SEGMENTS_GEN {
        return None;
    }
    let rest = name
        .strip_prefix("segments_")
        .or_else(|| name.strip_prefix("pending_segments_"))
        .or_else(|| name.strip_prefix(SNAPSHOTS_PREFIX))?;
    from_radix36(rest)
}

/// Whether `name` is a committed manifest `segments_N`.
pub fn is_segments_file(name: &str) -> bool {
    name.strip_prefix("segments_").and_then(from_radix36).is_some()
}

/// Whether `name` is a prepared manifest `pending_segments_N`.
pub fn is_pending_segments_file(name: &str) -> bool {
    name.strip_prefix("pending_segments_")
        .and_then(from_radix36)
        .is_some()
}

/// Whether `name` is a snapshot store file `snapshots_N`.
pub fn is_snapshots_file(name: &str) -> bool {
    name.strip_prefix(SNAPSHOTS_PREFIX)
        .and_then(from_radix36)
        .is_some()
}

/// Whether `name` is a per-segment file `_seg.ext` or `_seg_gen.ext`.
pub fn is_segment_file(name: &str) -> bool {
    CODEC_FILE_PATTERN.is_match(name)
}

/// Whether the file deleter may manage (and so delete) `name`.
///
/// `segments.gen`, `write.lock`, snapshot stores and unknown files are never
/// deleter-managed.
pub fn is_index_file(name: &str) -> bool {
    is_segments_file(name) || is_pending_segments_file(name) || is_segment_file(name)
}

/// Segment name of a per-segment file: `_3_a.del` -> `_3`, `_3.fdt` -> `_3`.
pub fn parse_segment_name(name: &str) -> Option<&str> {
    if !name.starts_with('_') {
        return None;
    }
    let stem = &name[1..];
    let end = stem.find(['_', '.']).map_or(name.len(), |i| i + 1);
    Some(&name[..end])
}

/// Generation embedded in a `_seg_gen.ext` file name, if any.
pub fn parse_file_generation(name: &str) -> Option<u64> {
    let stem = name.strip_prefix('_')?;
    let stem = stem.split('.').next()?;
    let (_, generation) = stem.split_once('_')?;
    from_radix36(generation)
}

/// Extension of a file name, without the dot.
pub fn file_extension(name: &str) -> Option<&str> {
    name.rsplit_once('.').map(|(_, ext)| ext)
}
