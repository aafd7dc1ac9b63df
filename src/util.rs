use std::hash::{BuildHasher, Hasher};

/// Compact row counts for the scrollback position label: `1234` becomes
/// `1.2k`, `2_500_000` becomes `2.5m`.
pub fn human_count(n: usize) -> String {
    if n >= 1_000_000 {
        let whole = n / 1_000_000;
        let tenth = (n % 1_000_000) / 100_000;
        if tenth == 0 {
            format!("{}m", whole)
        } else {
            format!("{}.{}m", whole, tenth)
        }
    } else if n >= 1000 {
        let whole = n / 1000;
        let tenth = (n % 1000) / 100;
        if tenth == 0 {
            format!("{}k", whole)
        } else {
            format!("{}.{}k", whole, tenth)
        }
    } else {
        n.to_string()
    }
}

/// Cheap random hex token for temp-file names; seeded from the clock and
/// pid through the stdlib hasher, no RNG dependency needed.
pub fn hex_token() -> String {
    let s = std::collections::hash_map::RandomState::new();
    let mut h = s.build_hasher();
    h.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    h.write_u64(std::process::id() as u64);
    format!("{:08x}", h.finish() as u32)
}

/// Millisecond timestamp as lowercase hex, for the offload temp-file names.
pub fn hex_timestamp() -> String {
    let ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    format!("{:x}", ms)
}

/// Expand the escapes accepted by `pane send --text`: `\n`, `\t` and `\\`.
/// Unknown escapes pass through verbatim.
pub fn unescape_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_count_suffixes() {
        assert_eq!(human_count(999), "999");
        assert_eq!(human_count(1000), "1k");
        assert_eq!(human_count(1234), "1.2k");
        assert_eq!(human_count(1_000_000), "1m");
        assert_eq!(human_count(2_500_000), "2.5m");
    }

    #[test]
    fn unescape_known_sequences() {
        assert_eq!(unescape_text("ls -la\\n"), "ls -la\n");
        assert_eq!(unescape_text("a\\tb"), "a\tb");
        assert_eq!(unescape_text("c:\\\\dir"), "c:\\dir");
        assert_eq!(unescape_text("odd\\q"), "odd\\q");
    }

    #[test]
    fn hex_token_shape() {
        let t = hex_token();
        assert_eq!(t.len(), 8);
        assert!(t.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
