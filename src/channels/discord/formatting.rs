//! Discord mention handling.

/// Whether `content` mentions the user with the given ID
pub fn mentions_user(content: &str, user_id: u64) -> bool {
    mention_tokens(user_id)
        .iter()
        .any(|token| content.contains(token.as_str()))
}

/// Remove mentions of `user_id` (`<@id>` and the nickname form `<@!id>`)
/// and trim what remains. Mentions of other users are kept, as is any
/// whitespace that did not surround a removed mention.
pub fn strip_mentions(content: &str, user_id: u64) -> String {
    let tokens = mention_tokens(user_id);
    let mut result = String::with_capacity(content.len());
    let mut rest = content;

    loop {
        let next = tokens
            .iter()
            .filter_map(|token| rest.find(token.as_str()).map(|pos| (pos, token.len())))
            .min();
        let Some((pos, len)) = next else {
            break;
        };
        result.push_str(&rest[..pos]);
        rest = &rest[pos + len..];
        // Close the gap the mention leaves between two words
        if result.ends_with(' ') && rest.starts_with(' ') {
            rest = &rest[1..];
        }
    }
    result.push_str(rest);

    result.trim().to_string()
}

fn mention_tokens(user_id: u64) -> [String; 2] {
    [format!("<@{}>", user_id), format!("<@!{}>", user_id)]
}
