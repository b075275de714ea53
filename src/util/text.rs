use std::borrow::Cow;

use quick_xml::escape::{partial_escape, resolve_html5_entity};

/// Ellipsis string used for truncation
const ELLIPSIS: &str = "...";

/// Longest title (in characters) rendered without truncation.
const MAX_TITLE_CHARS: usize = 50;

/// Escapes text for insertion into Telegram-flavoured HTML.
///
/// Only `<`, `>` and `&` are replaced. Telegram rejects named entities other
/// than `&lt;`, `&gt;`, `&amp;` and `&quot;`, so apostrophes are left alone.
///
/// ```
/// use feedbot::util::escape_html;
///
/// assert_eq!(escape_html("Tom & <Jerry>"), "Tom &amp; &lt;Jerry&gt;");
/// ```
pub fn escape_html(s: &str) -> Cow<'_, str> {
    partial_escape(s)
}

/// Escapes text for use inside a double-quoted HTML attribute.
pub fn escape_html_attr(s: &str) -> Cow<'_, str> {
    let escaped = partial_escape(s);
    if escaped.contains('"') {
        Cow::Owned(escaped.replace('"', "&quot;"))
    } else {
        escaped
    }
}

/// Decodes HTML character references (`&amp;`, `&#8217;`, `&eacute;`, ...).
///
/// Feed titles frequently arrive entity-encoded once more than needed; decoding
/// before re-escaping keeps `&amp;amp;` style artifacts out of chat messages.
/// Each reference is decoded on its own: a bare `&` or an unknown name
/// (`AT&T`, `&bogus;`) is kept literally and the rest of the text still decodes.
pub fn unescape_html(s: &str) -> Cow<'_, str> {
    if !s.contains('&') {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let decoded = after
            .find(';')
            .filter(|&end| end > 0 && end <= MAX_REFERENCE_LEN)
            .and_then(|end| resolve_reference(&after[..end]).map(|text| (text, end)));
        match decoded {
            Some((text, end)) => {
                out.push_str(&text);
                rest = &after[end + 1..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

/// Longest reference body considered between `&` and `;`.
const MAX_REFERENCE_LEN: usize = 32;

/// Resolves the text between `&` and `;` (`amp`, `#8217`, `#x2019`).
fn resolve_reference(name: &str) -> Option<Cow<'static, str>> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse::<u32>().ok()?,
        };
        return char::from_u32(code)
            .filter(|&c| c != '\0')
            .map(|c| Cow::Owned(c.to_string()));
    }
    resolve_html5_entity(name).map(Cow::Borrowed)
}

/// Shortens a feed title for list rendering.
///
/// Titles longer than 50 characters are cut to 47 characters followed by
/// `"..."`. Counting is done in `char`s so multi-byte text is never split.
pub fn truncate_title(title: &str) -> Cow<'_, str> {
    if title.chars().count() <= MAX_TITLE_CHARS {
        return Cow::Borrowed(title);
    }
    let keep = MAX_TITLE_CHARS - ELLIPSIS.len();
    let cut = title
        .char_indices()
        .nth(keep)
        .map(|(idx, _)| idx)
        .unwrap_or(title.len());
    Cow::Owned(format!("{}{}", &title[..cut], ELLIPSIS))
}
