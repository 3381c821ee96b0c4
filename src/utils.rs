//! Small text helpers shared by the synchronizer and submissions.

/// HTML-unescape a title coming from a feed entry or a form.
pub fn unescape(text: &str) -> String {
    html_escape::decode_html_entities(text).into_owned()
}

/// Truncate to at most `max` characters. Postgres varchar limits count
/// characters, not bytes, so this does too.
pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Keep the first `count` whitespace-separated words.
pub fn truncate_words(text: &str, count: usize) -> String {
    text.split_whitespace()
        .take(count)
        .collect::<Vec<_>>()
        .join(" ")
}

/// URL slug: lowercase alphanumerics, runs of anything else collapse to a
/// single hyphen. Capped at 256 bytes to fit the column.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug.truncate(256);
    slug
}

/// Filter free-text tags down to `[A-Za-z0-9_.@]`, keep those between 2 and
/// 20 characters, and join with commas. An empty result is a valid tag list.
pub fn clean_tags<I, S>(tags: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|tag| {
            tag.as_ref()
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@'))
                .collect::<String>()
        })
        .filter(|tag| tag.len() >= 2 && tag.len() <= 20)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Hello,  World!"), "hello-world");
        assert_eq!(slugify("--Rust 2021--"), "rust-2021");
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn truncate_chars_counts_characters() {
        assert_eq!(truncate_chars(&"a".repeat(300), 256).len(), 256);
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 256), "short");
    }

    #[test]
    fn truncate_words_keeps_prefix() {
        assert_eq!(truncate_words("one two three four", 2), "one two");
        assert_eq!(truncate_words("short", 10), "short");
    }

    #[test]
    fn clean_tags_filters_and_joins() {
        let tags = clean_tags(["Rust Lang", "a", "web dev!", "x".repeat(30).as_str()]);
        assert_eq!(tags, "RustLang,webdev");
    }

    #[test]
    fn clean_tags_keeps_dot_and_at() {
        assert_eq!(clean_tags(["node.js", "@hn"]), "node.js,@hn");
    }

    #[test]
    fn clean_tags_empty_is_valid() {
        assert_eq!(clean_tags(Vec::<String>::new()), "");
        assert_eq!(clean_tags(["!", "?"]), "");
    }

    #[test]
    fn unescape_decodes_entities() {
        assert_eq!(unescape("Ben &amp; Jerry&#39;s"), "Ben & Jerry's");
    }
}
