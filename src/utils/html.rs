// src/utils/html.rs

use std::collections::HashSet;

/// Reduces model-generated text to plain text before it is stored.
///
/// Every tag is removed; `<script>` and `<style>` lose their content too. The
/// result is text, not markup, so the escaping done by the HTML serializer is
/// undone and `a < b & c` comes back unchanged.
pub fn clean_html(input: &str) -> String {
    let mut builder = ammonia::Builder::empty();
    builder.clean_content_tags(HashSet::from(["script", "style"]));
    let cleaned = builder.clean(input).to_string();

    // `&amp;` last so escaped entity text is not decoded twice
    cleaned
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", "\u{a0}")
        .replace("&amp;", "&")
}
