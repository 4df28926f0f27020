/// File extensions accepted for upload, compared case-insensitively.
pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "bmp", "tif"];

/// Name used when sanitization leaves nothing behind.
pub const UNTITLED: &str = "untitled";

/// Prefix the storage bucket puts in front of object keys.
pub const STORAGE_PREFIX: &str = "privateuploads/";

pub fn is_image_file(name: &str) -> bool {
    let name = name.to_lowercase();
    IMAGE_EXTENSIONS
        .iter()
        .any(|ext| name.strip_suffix(ext).is_some_and(|rest| rest.ends_with('.')))
}

/// Replaces spaces with underscores, drops everything outside `[A-Za-z0-9_-]`
/// and trims underscores from both ends. Returns `None` if nothing is left.
pub fn clean_dataset_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    let cleaned = cleaned.trim_matches('_');
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

/// Like [`clean_dataset_name`] but never empty.
pub fn sanitize_dataset_name(name: &str) -> String {
    clean_dataset_name(name).unwrap_or_else(|| UNTITLED.to_string())
}

/// Last path segment of a remote file URL with the query string removed.
///
/// `https://bucket/privateuploads/images/3151-fce3/DJI_0024.JPG?Signature=x` gives `DJI_0024.JPG`.
pub fn original_filename(url: &str) -> &str {
    let path = url.split('?').next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

pub fn strip_storage_prefix(key: &str) -> &str {
    key.strip_prefix(STORAGE_PREFIX).unwrap_or(key)
}

const LINK_PREFIXES: [&str; 4] = ["https://", "http://", "ftp://", "www"];

fn is_link_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '/' | '-' | '&' | '?' | '=' | '%' | '.')
}

fn link_prefix_len(rest: &[char]) -> Option<usize> {
    LINK_PREFIXES.iter().find_map(|prefix| {
        let len = prefix.chars().count();
        (rest.len() >= len && rest.iter().take(len).copied().eq(prefix.chars())).then_some(len)
    })
}

/// A link needs a dot that is neither first nor last and comes before any `&`.
fn has_inner_dot(body: &[char]) -> bool {
    let amp = body.iter().position(|c| *c == '&').unwrap_or(body.len());
    body.iter()
        .enumerate()
        .any(|(i, c)| *c == '.' && i >= 1 && i < amp && i + 1 < body.len())
}

/// Wraps bare `http(s)://`, `ftp://` and `www` links in angle brackets so they
/// render as clickable markdown. Trailing periods stay outside the brackets and
/// links already preceded by `<` are left alone.
pub fn clickable_link(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut i = 0;
    while i < chars.len() {
        let Some(prefix_len) = link_prefix_len(&chars[i..]) else {
            out.push(chars[i]);
            i += 1;
            continue;
        };
        let body_start = i + prefix_len;
        let end = body_start
            + chars[body_start..]
                .iter()
                .take_while(|c| is_link_char(**c))
                .count();
        if i > 0 && chars[i - 1] == '<' {
            out.extend(&chars[i..end]);
            i = end;
            continue;
        }
        if !has_inner_dot(&chars[body_start..end]) {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        let link: String = chars[i..end].iter().collect();
        let trimmed = link.trim_end_matches('.');
        out.push('<');
        out.push_str(trimmed);
        out.push('>');
        out.push_str(&link[trimmed.len()..]);
        i = end;
    }
    out
}
