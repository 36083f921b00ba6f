//! Pulling model code out of generated text.
use tracing::{debug, warn};

const FENCE: &str = "```";

/// Every fenced code block of `text`, in document order.
///
/// The opening fence may follow other text on its line (`Here: ```python`) and may carry a
/// language tag; neither is part of the fragment. A closing fence must start its line, so
/// code that mentions a fence inside a string stays in the fragment. A fence left open at
/// the end of the text runs to the end. Text without any fence is returned whole as the
/// only fragment, so the result is never empty.
pub fn extract_fragments(text: &str) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut current: Option<Vec<&str>> = None;
    for line in text.lines() {
        if let Some(lines) = current.as_mut() {
            if line.trim_start().starts_with(FENCE) {
                fragments.push(lines.join("\n"));
                current = None;
            } else {
                lines.push(line);
            }
        } else if line.contains(FENCE) {
            current = Some(Vec::new());
        }
    }
    if let Some(lines) = current {
        debug!("unterminated code fence, taking the rest of the text");
        fragments.push(lines.join("\n"));
    }
    if fragments.is_empty() {
        warn!("no code blocks found, treating the entire text as code");
        return vec![text.to_string()];
    }
    debug!(fragments = fragments.len(), "extracted code blocks");
    fragments
}

/// The fragment most likely to be the complete model: the longest one, by character count.
/// Ties go to the earliest fragment. Returns `""` for an empty slice.
///
/// This is a heuristic. A long block of sample output can win over a shorter model.
pub fn select_best_fragment(fragments: &[String]) -> &str {
    let mut best: Option<(&str, usize)> = None;
    for fragment in fragments {
        let len = fragment.chars().count();
        match best {
            Some((_, best_len)) if len <= best_len => {}
            _ => best = Some((fragment, len)),
        }
    }
    best.map(|(fragment, _)| fragment).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_blocks_in_order() {
        let text = "Here:\n```python\nimport pulp\n```\nand\n```\nx = 1\ny = 2\n```\n";
        assert_eq!(extract_fragments(text), vec!["import pulp", "x = 1\ny = 2"]);
    }

    #[test]
    fn opening_fence_after_leading_text() {
        let text = "Here is the model: ```python\nimport pulp\nmodel = 1\n```\nDone.";
        assert_eq!(extract_fragments(text), vec!["import pulp\nmodel = 1"]);
    }

    #[test]
    fn fences_inside_code_do_not_close_it() {
        let text = "```python\nprint('``` marks code')\nx = 1\n```\n";
        assert_eq!(extract_fragments(text), vec!["print('``` marks code')\nx = 1"]);
    }

    #[test]
    fn no_fence_gives_the_whole_text() {
        let text = "model = 1";
        assert_eq!(extract_fragments(text), vec![text]);
    }

    #[test]
    fn unterminated_fence_runs_to_the_end() {
        let text = "intro\n```py\na = 1\nb = 2";
        assert_eq!(extract_fragments(text), vec!["a = 1\nb = 2"]);
    }

    #[test]
    fn empty_block_is_kept() {
        assert_eq!(extract_fragments("```\n```"), vec![""]);
    }

    #[test]
    fn longest_wins_and_ties_go_first() {
        let fragments = vec!["ab".to_string(), "abcd".to_string(), "wxyz".to_string()];
        assert_eq!(select_best_fragment(&fragments), "abcd");
        assert_eq!(select_best_fragment(&[]), "");
    }

    #[test]
    fn length_counts_characters() {
        let fragments = vec!["ééé".to_string(), "abcd".to_string()];
        assert_eq!(select_best_fragment(&fragments), "abcd");
    }
}
