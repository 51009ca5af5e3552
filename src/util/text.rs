use std::borrow::Cow;

/// Marker appended to shortened descriptions
const CONTINUATION: &str = "\n...";

/// Removes control characters from feed-supplied text before it is sent to
/// a chat channel.
///
/// Newlines and tabs survive; `\r\n` and lone `\r` become `\n`. Returns
/// `Cow::Borrowed` when nothing needs removing (the common case).
pub fn sanitize_text(s: &str) -> Cow<'_, str> {
    let needs_cleaning = s.chars().any(|c| c.is_control() && c != '\n' && c != '\t');
    if !needs_cleaning {
        return Cow::Borrowed(s);
    }

    let normalized = s.replace("\r\n", "\n").replace('\r', "\n");
    Cow::Owned(
        normalized
            .chars()
            .filter(|&c| !c.is_control() || c == '\n' || c == '\t')
            .collect(),
    )
}

/// Shortens a description to at most `max_chars` characters of content.
///
/// Long descriptions are replaced by their first paragraph followed by
/// `"\n..."`. If the first paragraph alone is still too long, the text is cut
/// at `max_chars` characters instead. Counts characters, not bytes, so
/// multi-byte text is never split mid-codepoint.
///
/// # Examples
///
/// ```
/// use postwatch::util::truncate_description;
///
/// assert_eq!(truncate_description("short", 500), "short");
/// assert_eq!(truncate_description("intro\nmore text here", 10), "intro\n...");
/// assert_eq!(truncate_description("abcdefghijkl", 5), "abcde\n...");
/// ```
pub fn truncate_description(s: &str, max_chars: usize) -> Cow<'_, str> {
    if s.chars().count() <= max_chars {
        return Cow::Borrowed(s);
    }

    let first_paragraph = s.lines().next().unwrap_or("");
    let shortened = format!("{first_paragraph}{CONTINUATION}");
    if shortened.chars().count() <= max_chars {
        return Cow::Owned(shortened);
    }

    let head: String = s.chars().take(max_chars).collect();
    Cow::Owned(format!("{head}{CONTINUATION}"))
}
