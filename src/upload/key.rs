//! Object key naming and public URLs
//!
//! Single-output uploads are stored as `destination/filename`. Variants are
//! stored as `[prefix-]filename-suffix[.ext]`, where `ext` is the extension of
//! the original file name.
//!
//! The destination applies to variants as well: with destination `avatars`
//! the `sm` variant of `cat.png` is `avatars/cat-sm.png`, not `cat-sm.png`.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters left as-is in the public path: RFC 3986 unreserved plus `/`
const OBJECT_PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

fn join(destination: Option<&str>, name: &str) -> String {
    match destination.map(|d| d.trim_end_matches('/')) {
        Some(dir) if !dir.is_empty() => format!("{}/{}", dir, name),
        _ => name.to_string(),
    }
}

/// Key of a single-output upload
pub fn single_key(destination: Option<&str>, filename: &str) -> String {
    join(destination, filename)
}

/// Key of one variant
pub fn variant_key(
    destination: Option<&str>,
    prefix: Option<&str>,
    filename: &str,
    suffix: &str,
    extension: Option<&str>,
) -> String {
    let mut name = String::new();
    if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
        name.push_str(prefix);
        name.push('-');
    }
    name.push_str(filename);
    name.push('-');
    name.push_str(suffix);
    if let Some(ext) = extension {
        name.push('.');
        name.push_str(ext);
    }
    join(destination, &name)
}

/// Key of a previously stored file
///
/// Recorded filenames that already carry the destination are used unchanged.
pub fn stored_key(destination: Option<&str>, filename: &str) -> String {
    match destination.map(|d| d.trim_end_matches('/')) {
        Some(dir) if !dir.is_empty() && filename.starts_with(&format!("{}/", dir)) => {
            filename.to_string()
        }
        _ => join(destination, filename),
    }
}

/// Public URL of `bucket/key` under `base`
pub fn public_url(base: &str, bucket: &str, key: &str) -> String {
    let object_path = format!("{}/{}", bucket, key);
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        utf8_percent_encode(&object_path, OBJECT_PATH)
    )
}
