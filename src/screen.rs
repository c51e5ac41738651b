//! Screen extraction from captured pane text.
//!
//! Everything here is pure: captured text in, a string or option list out.
//! The agent UI is recognized by a handful of glyphs (rule lines around
//! dialogs, a bullet in front of each response, a chevron on the input line),
//! so the matchers work line by line against those constants.

use std::sync::LazyLock;

use regex::Regex;

/// Box-drawing glyphs that make up horizontal rules.
pub const RULE_GLYPHS: &[char] = &['─', '━', '╌', '╍', '┄', '┅', '┈', '┉'];
/// Solid rules only; these close a response block.
pub const HEAVY_RULE_GLYPHS: &[char] = &['─', '━'];
pub const RESPONSE_BULLET: char = '●';
pub const PROMPT_GLYPH: char = '❯';
/// Glyphs that may precede the highlighted entry of a numbered menu.
pub const OPTION_MARKERS: &[char] = &['❯', '›', '>'];

const DIALOG_RULE_MIN: usize = 5;
const MESSAGE_RULE_MIN: usize = 10;
const DIALOG_FALLBACK_LINES: usize = 15;
const MESSAGE_FALLBACK_LINES: usize = 10;

const ELLIPSIS: &str = "...\n";

static OPTION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[❯›>]?\s*(\d+)\.\s+(.*)$").expect("option line pattern is valid")
});

/// A numbered menu entry, e.g. `❯ 1. Yes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuOption {
    pub number: u32,
    pub label: String,
}

/// True if the trimmed line starts with at least `min` consecutive glyphs
/// from `glyphs`.
pub fn is_rule_line(line: &str, glyphs: &[char], min: usize) -> bool {
    line.trim()
        .chars()
        .take_while(|c| glyphs.contains(c))
        .count()
        >= min
}

/// The last `n` non-blank lines, in their original order.
pub fn non_empty_tail(lines: &[&str], n: usize) -> String {
    let mut tail: Vec<&str> = lines
        .iter()
        .rev()
        .filter(|line| !line.trim().is_empty())
        .take(n)
        .copied()
        .collect();
    tail.reverse();
    tail.join("\n")
}

/// Pull the dialog out of the bottom of the screen.
///
/// Dialogs are drawn below a rule line, so everything under the last rule
/// is the dialog body. Without a rule (or with nothing under it) the last
/// 15 non-blank lines are returned.
pub fn extract_permission_dialog(screen: &str) -> String {
    let lines: Vec<&str> = screen.split('\n').collect();

    if let Some(rule) = lines
        .iter()
        .rposition(|line| is_rule_line(line, RULE_GLYPHS, DIALOG_RULE_MIN))
    {
        let below = lines[rule + 1..].join("\n");
        let below = below.trim();
        if !below.is_empty() {
            return below.to_string();
        }
    }

    non_empty_tail(&lines, DIALOG_FALLBACK_LINES)
}

/// Pull the most recent agent response (the last `●` block) off the screen.
///
/// The block ends at the next input line or at a long solid rule. Without
/// any bullet line the last 10 non-blank lines are returned.
pub fn extract_last_message(screen: &str) -> String {
    let lines: Vec<&str> = screen.split('\n').collect();

    let Some(start) = lines
        .iter()
        .rposition(|line| line.trim_start().starts_with(RESPONSE_BULLET))
    else {
        return non_empty_tail(&lines, MESSAGE_FALLBACK_LINES);
    };

    let mut block = Vec::new();
    for (offset, line) in lines[start..].iter().enumerate() {
        if offset > 0 && line.trim_start().starts_with(PROMPT_GLYPH) {
            break;
        }
        if is_rule_line(line, HEAVY_RULE_GLYPHS, MESSAGE_RULE_MIN) {
            break;
        }
        block.push(*line);
    }

    block.join("\n").trim().to_string()
}

/// Numbered options found anywhere in `text`, ordered by their number.
///
/// The sort is stable and duplicates are kept, so two menus on one screen
/// interleave rather than overwrite each other.
pub fn extract_options(text: &str) -> Vec<MenuOption> {
    let mut options: Vec<MenuOption> = text
        .lines()
        .filter_map(|line| {
            let caps = OPTION_LINE.captures(line)?;
            let number = caps[1].parse().ok()?;
            Some(MenuOption {
                number,
                label: caps[2].trim_end().to_string(),
            })
        })
        .collect();
    options.sort_by_key(|o| o.number);
    options
}

/// The draft typed after `❯` on an input line, if any.
pub fn draft_input(line: &str) -> Option<&str> {
    let (_, after) = line.split_once(PROMPT_GLYPH)?;
    let draft = after.trim();
    (!draft.is_empty()).then_some(draft)
}

pub fn is_typing(line: &str) -> bool {
    draft_input(line).is_some()
}

/// The lowest input line on screen. Highlighted menu entries (`❯ 1. Yes`)
/// share the glyph but are not input lines and are skipped.
pub fn last_prompt_line(screen: &str) -> Option<&str> {
    screen.lines().rev().find(|line| {
        line.trim_start().starts_with(PROMPT_GLYPH) && !OPTION_LINE.is_match(line)
    })
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Keep the last `max_chars` characters, prefixed with `...\n` when cut.
pub fn tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let skip = total - max_chars;
    let cut = text
        .char_indices()
        .nth(skip)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    format!("{ELLIPSIS}{}", &text[cut..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn dialog_is_text_below_last_rule() {
        let screen = "old output\n─────────\nfirst dialog\n━━━━━━━━━━━━\n  Allow Bash(ls)?\n  1. Yes\n  2. No\n\n";
        assert_eq!(
            extract_permission_dialog(screen),
            "Allow Bash(ls)?\n  1. Yes\n  2. No"
        );
    }

    #[test]
    fn dialog_rule_needs_five_glyphs() {
        let screen = "a\n────\nb";
        assert_eq!(extract_permission_dialog(screen), "a\n────\nb");
    }

    #[test]
    fn dialog_rule_may_be_indented_and_followed_by_text() {
        let screen = "x\n   ┄┄┄┄┄ Bash ┄┄┄┄┄\nRun ls?";
        assert_eq!(extract_permission_dialog(screen), "Run ls?");
    }

    #[test]
    fn dialog_falls_back_when_nothing_below_rule() {
        let screen = "line a\n\nline b\n──────────\n   \n";
        assert_eq!(extract_permission_dialog(screen), "line a\nline b\n──────────");
    }

    #[test]
    fn dialog_fallback_keeps_last_fifteen_non_blank() {
        let lines: Vec<String> = (1..=20).map(|i| format!("line {i}")).collect();
        let screen = lines.join("\n\n");
        let out = extract_permission_dialog(&screen);
        let kept: Vec<&str> = out.lines().collect();
        assert_eq!(kept.len(), 15);
        assert_eq!(kept[0], "line 6");
        assert_eq!(kept[14], "line 20");
    }

    #[test]
    fn last_message_stops_before_prompt() {
        let screen = "● Response text\ndetails here\n  ❯ waiting for input";
        assert_eq!(extract_last_message(screen), "● Response text\ndetails here");
    }

    #[test]
    fn last_message_picks_final_bullet_and_stops_at_heavy_rule() {
        let screen = "● first\nmore\n● second\n  body\n──────────────\n❯ ";
        assert_eq!(extract_last_message(screen), "● second\n  body");
    }

    #[test]
    fn last_message_start_line_may_not_end_block() {
        let screen = "  ● answer ❯ inline\nnext";
        assert_eq!(extract_last_message(screen), "● answer ❯ inline\nnext");
    }

    #[test]
    fn last_message_falls_back_to_ten_lines() {
        let lines: Vec<String> = (1..=12).map(|i| format!("l{i}")).collect();
        let out = extract_last_message(&lines.join("\n"));
        assert_eq!(out.lines().next(), Some("l3"));
        assert_eq!(out.lines().count(), 10);
    }

    #[test]
    fn options_sorted_by_number_with_markers() {
        let text = "Choose:\n  2. No\n❯ 1. Yes, allow once\n  › 3. Always   \nnot 4. an option";
        let options = extract_options(text);
        assert_eq!(
            options,
            vec![
                MenuOption { number: 1, label: "Yes, allow once".into() },
                MenuOption { number: 2, label: "No".into() },
                MenuOption { number: 3, label: "Always".into() },
            ]
        );
    }

    #[test]
    fn options_keep_duplicates() {
        let options = extract_options("1. a\n1. b\n> 2. c");
        let numbers: Vec<u32> = options.iter().map(|o| o.number).collect();
        assert_eq!(numbers, vec![1, 1, 2]);
        assert_eq!(options[0].label, "a");
        assert_eq!(options[1].label, "b");
    }

    #[test]
    fn options_need_whitespace_after_period() {
        assert!(extract_options("1.5 seconds\n2.done").is_empty());
    }

    #[test]
    fn draft_detection() {
        assert_eq!(draft_input("❯ fix the tests"), Some("fix the tests"));
        assert_eq!(draft_input("│ ❯   "), None);
        assert_eq!(draft_input("no prompt here"), None);
        assert!(is_typing("> ❯ hello"));
        assert!(!is_typing("❯"));
    }

    #[test]
    fn last_prompt_line_skips_menu_entries() {
        let screen = "● done\n❯ half typed\n──────\n❯ 1. Yes\n  2. No\n";
        assert_eq!(last_prompt_line(screen), Some("❯ half typed"));
        assert_eq!(last_prompt_line("nothing"), None);
    }

    #[test]
    fn escape_html_handles_markup_chars() {
        assert_eq!(escape_html("a < b && c > d"), "a &lt; b &amp;&amp; c &gt; d");
    }

    #[test]
    fn tail_truncates_on_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("ééééé", 2), "...\néé");
    }

    proptest! {
        #[test]
        fn extractors_never_panic(screen in "\\PC*") {
            let _ = extract_permission_dialog(&screen);
            let _ = extract_last_message(&screen);
            let _ = extract_options(&screen);
            let _ = last_prompt_line(&screen);
        }

        #[test]
        fn extraction_is_deterministic(screen in "[a-z ●❯─\\n0-9.]{0,200}") {
            prop_assert_eq!(extract_permission_dialog(&screen), extract_permission_dialog(&screen));
            prop_assert_eq!(extract_last_message(&screen), extract_last_message(&screen));
        }

        #[test]
        fn options_are_sorted(screen in "([0-9]{1,3}\\. [a-z]{1,5}\\n){0,12}") {
            let options = extract_options(&screen);
            prop_assert!(options.windows(2).all(|w| w[0].number <= w[1].number));
            prop_assert_eq!(options.len(), screen.lines().count());
        }

        #[test]
        fn tail_respects_limit(text in "\\PC{0,300}", max in 1usize..100) {
            let out = tail(&text, max);
            if text.chars().count() <= max {
                prop_assert_eq!(out, text);
            } else {
                prop_assert!(out.starts_with("...\n"));
                prop_assert_eq!(out.chars().count(), max + 4);
                prop_assert!(text.ends_with(&out[4..]));
            }
        }

        #[test]
        fn escaped_text_has_no_raw_markup(text in "\\PC{0,100}") {
            let escaped = escape_html(&text);
            prop_assert!(!escaped.contains('<'));
            prop_assert!(!escaped.contains('>'));
        }
    }
}
