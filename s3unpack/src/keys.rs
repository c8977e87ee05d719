//! Derive the object key and content type for an archive entry.

/// The object key for the entry at `path` when uploading under `prefix`.
///
/// The key is `prefix/path` normalized the way a POSIX path normalizer would: repeated `/`
/// collapse to one, `.` segments disappear and `..` removes the preceding segment.  S3 keys never
/// start with `/`, so a leading separator is dropped.
pub fn build_key(prefix: &str, path: &str) -> String {
    let joined = format!("{prefix}/{path}");
    let normalized = normalize(&joined);

    normalized.trim_start_matches('/').to_string()
}

/// The MIME type implied by the extension of `path`, if the extension is a known one
pub fn infer_content_type(path: &str) -> Option<String> {
    let file_name = path.rsplit('/').next().unwrap_or(path);

    // A dot at the start of the name marks a hidden file, not an extension
    let (stem, extension) = file_name.rsplit_once('.')?;
    if stem.is_empty() || extension.is_empty() {
        return None;
    }

    mime_guess::from_ext(extension)
        .first()
        .map(|mime| mime.essence_str().to_string())
}

/// Lexically normalize a `/`-separated path.
///
/// Relative paths keep any `..` that would climb above their start; absolute paths clamp at the
/// root.  A trailing `/` is preserved, even when nothing else is left (`./` stays `./`).
fn normalize(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let absolute = path.starts_with('/');
    let trailing_slash = path.ends_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                _ if absolute => {}
                _ => segments.push(".."),
            },
            segment => segments.push(segment),
        }
    }

    let mut normalized = segments.join("/");

    if absolute {
        normalized.insert(0, '/');
    }

    if normalized.is_empty() {
        normalized.push('.');
    }

    if trailing_slash && !normalized.ends_with('/') {
        normalized.push('/');
    }

    normalized
}
