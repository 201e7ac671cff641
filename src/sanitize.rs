//! Defensive normalisation of user-supplied filenames and extensions.

const REPLACEMENT: char = '_';
const ILLEGAL_FS_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Replaces path separators with nothing (keeps only the base component),
/// strips null bytes, collapses control characters to a single replacement
/// character, rejects traversal sequences, trims leading dots, truncates to
/// `max_len`, and replaces filesystem-illegal characters.
pub fn sanitise_filename(raw: &str, max_len: usize) -> String {
    // Keep only the base component: split on both separators regardless of
    // host OS so behavior is identical cross-platform.
    let base = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .replace('\0', "");

    // Reject traversal sequences, including a common percent-encoded form.
    let base = base.replace("..", "").replace("%2e%2e", "").replace("%2E%2E", "");

    let mut out = String::with_capacity(base.len());
    let mut last_was_control = false;
    for ch in base.chars() {
        if ch.is_control() {
            if !last_was_control {
                out.push(REPLACEMENT);
            }
            last_was_control = true;
            continue;
        }
        last_was_control = false;
        if ILLEGAL_FS_CHARS.contains(&ch) {
            out.push(REPLACEMENT);
        } else {
            out.push(ch);
        }
    }

    // Trim leading dots to avoid hidden files.
    let trimmed = out.trim_start_matches('.');
    let trimmed = if trimmed.is_empty() && !out.is_empty() {
        // An all-dots name becomes a single replacement character rather
        // than vanishing outright.
        REPLACEMENT.to_string()
    } else {
        trimmed.to_string()
    };

    truncate_chars(&trimmed, max_len)
}

/// Lowercases, keeps only `[a-z0-9]`, truncates to `max_len`.
pub fn sanitise_extension(raw: &str, max_len: usize) -> String {
    let lowered = raw.to_lowercase();
    let kept: String = lowered
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect();
    truncate_chars(&kept, max_len)
}

/// Same as [`sanitise_filename`], plus strips characters that could inject
/// into HTTP header syntax (`"`, `\`, CR, LF).
pub fn sanitise_for_content_disposition(raw: &str, max_len: usize) -> String {
    let base = sanitise_filename(raw, max_len);
    base.chars()
        .filter(|c| !matches!(c, '"' | '\\' | '\r' | '\n'))
        .collect()
}

fn truncate_chars(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        s.chars().take(max_len).collect()
    }
}

/// Splits a raw filename into `(origin_name, extension)` using the last
/// `.`-delimited segment as the extension, both already sanitised. A
/// filename with no extension yields an empty extension string.
pub fn split_name_and_extension(raw: &str, name_max: usize, ext_max: usize) -> (String, String) {
    let sanitised = sanitise_filename(raw, usize::MAX);
    match sanitised.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (
            truncate_chars(stem, name_max),
            sanitise_extension(ext, ext_max),
        ),
        _ => (truncate_chars(&sanitised, name_max), String::new()),
    }
}
