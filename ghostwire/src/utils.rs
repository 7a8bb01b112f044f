/// Normalize a string by removing zero-width characters, folding Unicode whitespace
/// into single spaces, trimming and lowercasing it.
pub fn normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;
    for c in s.chars() {
        if matches!(
            c,
            '\u{200B}' | // zero-width space
            '\u{200C}' | // zero-width non-joiner
            '\u{200D}' | // zero-width joiner
            '\u{FEFF}' // zero-width no-break space
        ) {
            continue;
        }
        // Covers NBSP, narrow NBSP and the other Unicode spaces.
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.extend(c.to_lowercase());
    }
    out
}

/// First `n` characters of `s`, never splitting a character.
pub fn char_prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
