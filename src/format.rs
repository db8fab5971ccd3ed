use std::sync::OnceLock;

use regex::Regex;

/// One rendered block of an assistant response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBlock {
    Heading(String),
    Paragraph(String),
    Bullets(Vec<String>),
    Numbered(Vec<String>),
}

/// Splits an assistant response into renderable blocks. Lines ending in a
/// colon that start with a capital and carry no sentence punctuation become
/// headings, `•`/`-` lines become bullet items, `1.`-style lines become
/// numbered items, and everything else is a paragraph. Consecutive items of
/// the same kind are grouped into one list.
pub fn format_response(text: &str) -> Vec<ResponseBlock> {
    let mut blocks: Vec<ResponseBlock> = Vec::new();
    let mut bullets: Vec<String> = Vec::new();
    let mut numbered: Vec<String> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(item) = bullet_item(trimmed) {
            flush_numbered(&mut blocks, &mut numbered);
            bullets.push(item.to_string());
        } else if let Some(item) = numbered_item(trimmed) {
            flush_bullets(&mut blocks, &mut bullets);
            numbered.push(item.to_string());
        } else if is_heading(trimmed) {
            flush_bullets(&mut blocks, &mut bullets);
            flush_numbered(&mut blocks, &mut numbered);
            blocks.push(ResponseBlock::Heading(trimmed.to_string()));
        } else {
            flush_bullets(&mut blocks, &mut bullets);
            flush_numbered(&mut blocks, &mut numbered);
            blocks.push(ResponseBlock::Paragraph(trimmed.to_string()));
        }
    }
    flush_bullets(&mut blocks, &mut bullets);
    flush_numbered(&mut blocks, &mut numbered);

    if blocks.is_empty() {
        blocks.push(ResponseBlock::Paragraph(text.to_string()));
    }
    blocks
}

/// Flattens blocks back to plain text, for the one-shot CLI output.
pub fn render_plain(blocks: &[ResponseBlock]) -> String {
    let mut lines: Vec<String> = Vec::new();
    for block in blocks {
        match block {
            ResponseBlock::Heading(text) | ResponseBlock::Paragraph(text) => {
                lines.push(text.clone());
            }
            ResponseBlock::Bullets(items) => {
                lines.extend(items.iter().map(|item| format!("  • {item}")));
            }
            ResponseBlock::Numbered(items) => {
                lines.extend(
                    items
                        .iter()
                        .enumerate()
                        .map(|(index, item)| format!("  {}. {item}", index + 1)),
                );
            }
        }
    }
    lines.join("\n")
}

fn flush_bullets(blocks: &mut Vec<ResponseBlock>, bullets: &mut Vec<String>) {
    if !bullets.is_empty() {
        blocks.push(ResponseBlock::Bullets(std::mem::take(bullets)));
    }
}

fn flush_numbered(blocks: &mut Vec<ResponseBlock>, numbered: &mut Vec<String>) {
    if !numbered.is_empty() {
        blocks.push(ResponseBlock::Numbered(std::mem::take(numbered)));
    }
}

fn bullet_item(line: &str) -> Option<&str> {
    line.strip_prefix('•')
        .or_else(|| line.strip_prefix('-'))
        .map(str::trim_start)
}

fn numbered_item(line: &str) -> Option<&str> {
    static NUMBERED_RE: OnceLock<Regex> = OnceLock::new();
    let regex = NUMBERED_RE.get_or_init(|| Regex::new(r"^\d+\.").unwrap());
    regex.find(line).map(|m| line[m.end()..].trim_start())
}

fn is_heading(line: &str) -> bool {
    static HEADING_RE: OnceLock<Regex> = OnceLock::new();
    let regex = HEADING_RE.get_or_init(|| Regex::new(r"^[A-Z][^.!?]*:$").unwrap());
    regex.is_match(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heading_followed_by_bullets() {
        let blocks = format_response("Step one:\n• Plug it in\n• Turn it on");
        assert_eq!(
            blocks,
            vec![
                ResponseBlock::Heading("Step one:".to_string()),
                ResponseBlock::Bullets(vec![
                    "Plug it in".to_string(),
                    "Turn it on".to_string()
                ]),
            ]
        );
    }

    #[test]
    fn dash_markers_count_as_bullets() {
        let blocks = format_response("- one\n- two");
        assert_eq!(
            blocks,
            vec![ResponseBlock::Bullets(vec![
                "one".to_string(),
                "two".to_string()
            ])]
        );
    }

    #[test]
    fn numbered_lines_strip_their_prefix() {
        let blocks = format_response("1. first\n2.  second\n10.third");
        assert_eq!(
            blocks,
            vec![ResponseBlock::Numbered(vec![
                "first".to_string(),
                "second".to_string(),
                "third".to_string()
            ])]
        );
    }

    #[test]
    fn paragraph_closes_an_open_list() {
        let blocks = format_response("• a\nAnd then a sentence.\n• b");
        assert_eq!(
            blocks,
            vec![
                ResponseBlock::Bullets(vec!["a".to_string()]),
                ResponseBlock::Paragraph("And then a sentence.".to_string()),
                ResponseBlock::Bullets(vec!["b".to_string()]),
            ]
        );
    }

    #[test]
    fn switching_list_kind_starts_a_new_list() {
        let blocks = format_response("• a\n1. b");
        assert_eq!(
            blocks,
            vec![
                ResponseBlock::Bullets(vec!["a".to_string()]),
                ResponseBlock::Numbered(vec!["b".to_string()]),
            ]
        );
    }

    #[test]
    fn sentence_with_colon_is_not_a_heading() {
        let blocks = format_response("Note. Here it is:");
        assert_eq!(
            blocks,
            vec![ResponseBlock::Paragraph("Note. Here it is:".to_string())]
        );
    }

    #[test]
    fn lowercase_lead_is_not_a_heading() {
        let blocks = format_response("settings:");
        assert_eq!(
            blocks,
            vec![ResponseBlock::Paragraph("settings:".to_string())]
        );
    }

    #[test]
    fn blank_lines_are_skipped() {
        let blocks = format_response("one\n\n   \ntwo");
        assert_eq!(
            blocks,
            vec![
                ResponseBlock::Paragraph("one".to_string()),
                ResponseBlock::Paragraph("two".to_string()),
            ]
        );
    }

    #[test]
    fn empty_input_falls_back_to_one_paragraph() {
        let blocks = format_response("   ");
        assert_eq!(blocks, vec![ResponseBlock::Paragraph("   ".to_string())]);
    }

    #[test]
    fn plain_rendering_numbers_items() {
        let blocks = format_response("Steps:\n1. alpha\n2. beta");
        let plain = render_plain(&blocks);
        assert_eq!(plain, "Steps:\n  1. alpha\n  2. beta");
    }
}
