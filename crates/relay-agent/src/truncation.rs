use std::collections::HashMap;

const DEFAULT_TOOL_OUTPUT_LIMIT: usize = 20_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TruncationMode {
    HeadTail,
    Tail,
}

/// Command output keeps its end, where errors and exit summaries land.
pub fn default_truncation_mode_for_tool(tool_name: &str) -> TruncationMode {
    match tool_name {
        "exec" | "process" => TruncationMode::Tail,
        _ => TruncationMode::HeadTail,
    }
}

pub fn truncate_tool_output(
    output: &str,
    tool_name: &str,
    limits: &HashMap<String, usize>,
) -> String {
    let max_chars = limits
        .get(tool_name)
        .copied()
        .unwrap_or(DEFAULT_TOOL_OUTPUT_LIMIT);
    truncate_chars(
        output,
        max_chars,
        default_truncation_mode_for_tool(tool_name),
    )
}

pub fn truncate_chars(output: &str, max_chars: usize, mode: TruncationMode) -> String {
    let char_count = output.chars().count();
    if char_count <= max_chars {
        return output.to_string();
    }

    let removed = char_count.saturating_sub(max_chars);
    match mode {
        TruncationMode::HeadTail => {
            let head = max_chars / 2;
            let tail = max_chars.saturating_sub(head);
            format!(
                "{}\n\n[output truncated: {} characters removed from the middle]\n\n{}",
                take_head(output, head),
                removed,
                take_tail(output, tail)
            )
        }
        TruncationMode::Tail => format!(
            "[output truncated: first {} characters removed]\n\n{}",
            removed,
            take_tail(output, max_chars)
        ),
    }
}

fn take_head(input: &str, char_count: usize) -> String {
    input.chars().take(char_count).collect()
}

fn take_tail(input: &str, char_count: usize) -> String {
    let total = input.chars().count();
    input
        .chars()
        .skip(total.saturating_sub(char_count))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_chars_head_tail_keeps_both_ends() {
        let output = truncate_chars("abcdefghij", 6, TruncationMode::HeadTail);
        assert!(output.starts_with("abc"));
        assert!(output.ends_with("hij"));
        assert!(output.contains("4 characters removed"));
    }

    #[test]
    fn exec_output_keeps_the_tail() {
        let limits = HashMap::from([("exec".to_string(), 3)]);
        let output = truncate_tool_output("line1\nline2\nEND", "exec", &limits);
        assert!(output.ends_with("END"));
        assert!(output.starts_with("[output truncated"));
    }

    #[test]
    fn short_output_is_untouched() {
        let output = truncate_tool_output("ok", "read_file", &HashMap::new());
        assert_eq!(output, "ok");
    }
}
