/// エラーテキストの長さ上限（文字数）。
pub(crate) const MAX_ERROR_MESSAGE_LENGTH: usize = 500;

/// Job Record に保存するエラーテキストを上限文字数で切り詰める。
#[must_use]
pub(crate) fn truncate_error_message(msg: &str) -> String {
    let char_count = msg.chars().count();
    if char_count <= MAX_ERROR_MESSAGE_LENGTH {
        return msg.to_string();
    }
    let truncated: String = msg.chars().take(MAX_ERROR_MESSAGE_LENGTH).collect();
    format!("{truncated}... (truncated, {char_count} chars)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_are_kept() {
        assert_eq!(truncate_error_message("nsfw"), "nsfw");
    }

    #[test]
    fn long_messages_are_bounded() {
        let long = "あ".repeat(2_000);
        let truncated = truncate_error_message(&long);
        assert!(truncated.starts_with(&"あ".repeat(MAX_ERROR_MESSAGE_LENGTH)));
        assert!(truncated.ends_with("(truncated, 2000 chars)"));
        assert!(truncated.chars().count() < MAX_ERROR_MESSAGE_LENGTH + 40);
    }
}
