//! Code-unit extraction from supervisor replies.

use std::sync::LazyLock;

use regex::Regex;

static CODE_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```repl\s*\n(.*?)```").unwrap());

/// Return every `repl`-fenced block body in appearance order.
///
/// Matching is non-greedy over the whole reply, so two blocks never merge.
/// A reply without matches is text-only and yields an empty list.
pub fn extract_code_units(reply: &str) -> Vec<String> {
    CODE_BLOCK_RE
        .captures_iter(reply)
        .filter_map(|caps| caps.get(1))
        .map(|body| body.as_str().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_only_reply_has_no_units() {
        assert!(extract_code_units("I think the answer is 4.").is_empty());
    }

    #[test]
    fn extracts_blocks_in_order() {
        let reply = "First:\n```repl\nx = 1\n```\nthen\n```repl\nprint(x)\n```\n";
        assert_eq!(extract_code_units(reply), vec!["x = 1\n", "print(x)\n"]);
    }

    #[test]
    fn ignores_other_fence_tags() {
        let reply = "```python\nx = 1\n```\n```repl\ny = 2\n```";
        assert_eq!(extract_code_units(reply), vec!["y = 2\n"]);
    }

    #[test]
    fn multiline_body_is_kept_verbatim() {
        let reply = "```repl\nfor i in range(3):\n    print(i)\n```";
        assert_eq!(
            extract_code_units(reply),
            vec!["for i in range(3):\n    print(i)\n"]
        );
    }

    #[test]
    fn unterminated_block_is_not_a_unit() {
        assert!(extract_code_units("```repl\nx = 1\n").is_empty());
    }
}
