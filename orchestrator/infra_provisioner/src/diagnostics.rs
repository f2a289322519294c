//! Cleanup and classification of tool output.

/// Substrings of destroy output that mean a network resource is still held by
/// something outside this cluster. Such a failure is treated as success: the
/// cluster's own resources are gone and the leftover belongs to someone else.
/// Matched case-insensitively.
pub const DESTROY_CONFLICT_MARKERS: &[&str] = &[
    "securitygroupinuse",
    "subnetinuse",
    "networkinuse",
    "security group in use",
    "subnet in use",
    "network in use",
];

/// True when destroy output carries one of [`DESTROY_CONFLICT_MARKERS`].
pub fn is_destroy_conflict(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    DESTROY_CONFLICT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Remove ANSI escape sequences (colours, cursor movement, OSC titles).
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.next() {
            // CSI: parameters then one final byte in '@'..='~'
            Some('[') => {
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            // OSC: terminated by BEL or ESC '\'
            Some(']') => {
                while let Some(c) = chars.next() {
                    if c == '\u{7}' {
                        break;
                    }
                    if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            // Two-character sequences
            Some(_) | None => {}
        }
    }
    out
}

/// Collapse runs of blank lines into one and trim surrounding whitespace.
pub fn collapse_blank_lines(input: &str) -> String {
    let mut out = Vec::new();
    let mut previous_blank = false;
    for line in input.lines() {
        let line = line.trim_end();
        let blank = line.is_empty();
        if blank && previous_blank {
            continue;
        }
        out.push(line);
        previous_blank = blank;
    }
    out.join("\n").trim().to_string()
}

/// Tool output as it is stored in `status_msg` and progress details.
pub fn clean_output(input: &str) -> String {
    collapse_blank_lines(&strip_ansi(input))
}
