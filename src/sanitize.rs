//! Content sanitizer: strip rules plus fingerprint normalization.
//!
//! Sanitation is pure and deterministic. Markup spans (bold, italic,
//! strikethrough, inline/fenced code, links) are located by delimiter
//! scanning before any character-level rewriting, so mention removal and
//! punctuation normalization never corrupt formatting tokens.
//!
//! Processing order:
//! 1. strip zero-width / invisible characters
//! 2. drop leading lines matching header patterns and trailing lines
//!    matching footer patterns
//! 3. unwrap decorative wrappers (`*** TEXT ***`, `=== TEXT ===`, ...)
//! 4. segment into protected markup spans and plain text
//! 5. normalize plain segments: mentions, punctuation runs, emoji spam,
//!    whitespace runs
//! 6. collapse excess blank lines and trim

use crate::config::CompiledStripRules;
use once_cell::sync::Lazy;
use regex::Regex;

const INVISIBLE_CHARS: &[char] = &['\u{200b}', '\u{200c}', '\u{200d}', '\u{2060}', '\u{feff}'];

static MENTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"@\w+").expect("mention regex"));

static PUNCT_RUNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"!{2,}").expect("punct regex"), "!"),
        (Regex::new(r"\?{2,}").expect("punct regex"), "?"),
        // 4+ dots collapse to an ellipsis; a plain "..." is left alone
        (Regex::new(r"\.{4,}").expect("punct regex"), "..."),
        (Regex::new(r",{2,}").expect("punct regex"), ","),
        (Regex::new(r";{2,}").expect("punct regex"), ";"),
    ]
});

static SPACE_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]{2,}").expect("space regex"));

static BLANK_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*\n([ \t]*\n)+").expect("blank regex"));

static TRAILING_WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+\n").expect("ws regex"));

static DECORATIVE_WRAPPERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\*{3,}\s*(.+?)\s*\*{3,}",
        r"={3,}\s*(.+?)\s*={3,}",
        r"-{3,}\s*(.+?)\s*-{3,}",
        r"#{3,}\s*(.+?)\s*#{3,}",
        r"▪{2,}\s*(.+?)\s*▪{2,}",
        r"•{2,}\s*(.+?)\s*•{2,}",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("wrapper regex"))
    .collect()
});

/// Sanitize message content under a pair's strip rules. Identical input
/// and rules always yield identical output. An empty result means the
/// message should not be delivered at all.
pub fn sanitize(text: &str, rules: &CompiledStripRules) -> String {
    if text.is_empty() {
        return String::new();
    }

    let mut out = strip_invisible(text);
    out = strip_header_footer_lines(&out, rules);
    for wrapper in DECORATIVE_WRAPPERS.iter() {
        out = wrapper.replace_all(&out, "$1").into_owned();
    }

    let mut rebuilt = String::with_capacity(out.len());
    for segment in segment_markup(&out) {
        match segment {
            Segment::Protected(s) => rebuilt.push_str(&s),
            Segment::Plain(s) => rebuilt.push_str(&normalize_plain(&s, rules.remove_mentions)),
        }
    }

    let collapsed = BLANK_RUN_RE.replace_all(&rebuilt, "\n\n").into_owned();
    let collapsed = TRAILING_WS_RE.replace_all(&collapsed, "\n").into_owned();
    collapsed.trim().to_string()
}

fn strip_invisible(text: &str) -> String {
    text.chars().filter(|c| !INVISIBLE_CHARS.contains(c)).collect()
}

/// Drop leading lines matching any header pattern (anchored at line
/// start) and trailing lines matching any footer pattern (searched).
fn strip_header_footer_lines(text: &str, rules: &CompiledStripRules) -> String {
    let lines: Vec<&str> = text.lines().collect();

    let mut start = 0;
    while start < lines.len() {
        let line = lines[start].trim();
        if line.is_empty() {
            start += 1;
            continue;
        }
        if rules.headers.iter().any(|m| m.matches_start(line)) {
            start += 1;
            continue;
        }
        break;
    }

    let mut end = lines.len();
    while end > start {
        let line = lines[end - 1].trim();
        if line.is_empty() {
            end -= 1;
            continue;
        }
        if rules.footers.iter().any(|m| m.matches(line)) {
            end -= 1;
            continue;
        }
        break;
    }

    lines[start..end].join("\n")
}

enum Segment {
    /// Markup span, emitted verbatim.
    Protected(String),
    Plain(String),
}

/// Split text into protected markup spans and plain runs. Unmatched
/// delimiters are treated as plain characters.
fn segment_markup(text: &str) -> Vec<Segment> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut segments = Vec::new();
    let mut plain = String::new();
    let mut i = 0;

    let mut push_protected = |plain: &mut String, segments: &mut Vec<Segment>, span: String| {
        if !plain.is_empty() {
            segments.push(Segment::Plain(std::mem::take(plain)));
        }
        segments.push(Segment::Protected(span));
    };

    while i < len {
        let ch = chars[i];

        // Fenced code block
        if ch == '`' && i + 2 < len && chars[i + 1] == '`' && chars[i + 2] == '`' {
            if let Some(end) = find_seq(&chars, i + 3, &['`', '`', '`']) {
                push_protected(&mut plain, &mut segments, collect(&chars, i, end + 3));
                i = end + 3;
                continue;
            }
        }

        // Inline code
        if ch == '`' {
            if let Some(end) = find_seq(&chars, i + 1, &['`']) {
                push_protected(&mut plain, &mut segments, collect(&chars, i, end + 1));
                i = end + 1;
                continue;
            }
        }

        // Bold **text**
        if ch == '*' && i + 1 < len && chars[i + 1] == '*' {
            if let Some(end) = find_seq(&chars, i + 2, &['*', '*']) {
                push_protected(&mut plain, &mut segments, collect(&chars, i, end + 2));
                i = end + 2;
                continue;
            }
        }

        // Strikethrough ~~text~~
        if ch == '~' && i + 1 < len && chars[i + 1] == '~' {
            if let Some(end) = find_seq(&chars, i + 2, &['~', '~']) {
                push_protected(&mut plain, &mut segments, collect(&chars, i, end + 2));
                i = end + 2;
                continue;
            }
        }

        // Link [text](url)
        if ch == '[' {
            if let Some(end) = parse_link_end(&chars, i) {
                push_protected(&mut plain, &mut segments, collect(&chars, i, end + 1));
                i = end + 1;
                continue;
            }
        }

        // Italic *text* or _text_, closed on the same line. Only a
        // delimiter at a word boundary opens a span; an underscore
        // inside a handle like @some_name is plain text.
        if (ch == '*' || ch == '_')
            && (i == 0 || chars[i - 1].is_whitespace())
            && i + 1 < len
            && !chars[i + 1].is_whitespace()
        {
            if let Some(end) = find_same_line(&chars, i + 1, ch) {
                push_protected(&mut plain, &mut segments, collect(&chars, i, end + 1));
                i = end + 1;
                continue;
            }
        }

        plain.push(ch);
        i += 1;
    }

    if !plain.is_empty() {
        segments.push(Segment::Plain(plain));
    }
    segments
}

fn collect(chars: &[char], start: usize, end: usize) -> String {
    chars[start..end].iter().collect()
}

fn find_seq(chars: &[char], start: usize, seq: &[char]) -> Option<usize> {
    let len = chars.len();
    if seq.len() > len {
        return None;
    }
    (start..=len.saturating_sub(seq.len()))
        .find(|&i| chars[i..i + seq.len()] == *seq)
}

/// Find a closing delimiter before the next newline. Italic spans do not
/// cross line breaks; a lone `*` bullet stays plain text.
fn find_same_line(chars: &[char], start: usize, delim: char) -> Option<usize> {
    for (offset, &c) in chars[start..].iter().enumerate() {
        if c == '\n' {
            return None;
        }
        if c == delim {
            // Reject empty spans like "**" handled elsewhere
            return if offset == 0 { None } else { Some(start + offset) };
        }
    }
    None
}

/// Find the end of a `[text](url)` link, returning the index of `)`.
fn parse_link_end(chars: &[char], start: usize) -> Option<usize> {
    let len = chars.len();
    let mut i = start + 1;
    let mut depth = 1;
    while i < len && depth > 0 {
        match chars[i] {
            '[' => depth += 1,
            ']' => depth -= 1,
            _ => {}
        }
        i += 1;
    }
    if depth != 0 || i >= len || chars[i] != '(' {
        return None;
    }
    let mut depth = 1;
    i += 1;
    while i < len {
        match chars[i] {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Character-level normalization applied only outside markup spans.
fn normalize_plain(text: &str, remove_mentions: bool) -> String {
    let mut out = if remove_mentions {
        MENTION_RE.replace_all(text, "").into_owned()
    } else {
        text.to_string()
    };

    for (re, replacement) in PUNCT_RUNS.iter() {
        out = re.replace_all(&out, *replacement).into_owned();
    }

    out = collapse_emoji_runs(&out);
    SPACE_RUN_RE.replace_all(&out, " ").into_owned()
}

/// Collapse runs of three or more identical emoji to a single instance.
fn collapse_emoji_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run_char: Option<char> = None;
    let mut run_len = 0usize;

    let mut flush = |out: &mut String, c: char, n: usize| {
        let emit = if n >= 3 { 1 } else { n };
        for _ in 0..emit {
            out.push(c);
        }
    };

    for c in text.chars() {
        if Some(c) == run_char {
            run_len += 1;
            continue;
        }
        if let Some(prev) = run_char.take() {
            flush(&mut out, prev, run_len);
        }
        if is_emoji(c) {
            run_char = Some(c);
            run_len = 1;
        } else {
            out.push(c);
        }
    }
    if let Some(prev) = run_char {
        flush(&mut out, prev, run_len);
    }
    out
}

fn is_emoji(c: char) -> bool {
    matches!(c as u32,
        0x1F300..=0x1FAFF  // symbols, pictographs, transport, supplemental
        | 0x1F1E6..=0x1F1FF // regional indicators
        | 0x2600..=0x27BF   // misc symbols, dingbats
        | 0x2B00..=0x2BFF   // arrows, stars
        | 0xFE0F            // variation selector
    )
}
