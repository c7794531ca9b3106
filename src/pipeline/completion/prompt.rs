use crate::config::SectionRange;
use crate::pipeline::types::TextUnit;

/// Longest unit text quoted in a repair prompt.
const REPAIR_UNIT_CHARS: usize = 200;

pub const SCAN_SYSTEM_PROMPT: &str = r#"
You locate numbered section headers in OCR text from a gamebook. A header is a
line holding only the section number, possibly garbled by OCR ("8O" for 80,
"l2" for 12). Numbers inside sentences ("turn to 80", "roll 2 dice") are NOT
headers. Page numbers are NOT headers.

RULES:
1. Use only element ids that appear in the input.
2. Never invent a header that is not in the text.
3. Output valid JSON only, no commentary.
"#;

pub const REPAIR_SYSTEM_PROMPT: &str = r#"
You find one missing numbered section header in OCR text from a gamebook.
The header may be garbled by OCR, merged into the first line of the section,
or split across lines. Answer with the element id of the line where the
section starts, or null when it is not in the text.

RULES:
1. Use only element ids that appear in the input.
2. Do not choose a line that merely refers to the section ("turn to 80").
3. Output valid JSON only, no commentary.
"#;

fn render_units(units: &[&TextUnit], max_chars: usize) -> String {
    let mut out = String::new();
    for unit in units {
        let text: String = unit.text.trim().chars().take(max_chars).collect();
        out.push_str(&format!("[{}] (p{}) {}\n", unit.element_id, unit.page, text));
    }
    out
}

/// Ask for every header in a batch of pages.
pub fn build_scan_prompt(units: &[&TextUnit], range: SectionRange) -> String {
    format!(
        r#"Section numbers run from {min} to {max}.

<lines>
{lines}</lines>

List every line that is a section header.

```json
{{"headers": [{{"element_id": "id from the input", "section_id": 0}}]}}
```"#,
        min = range.min,
        max = range.max,
        lines = render_units(units, usize::MAX),
    )
}

/// Ask where section `section_id` starts between its neighbours.
pub fn build_repair_prompt(
    section_id: u32,
    previous: Option<u32>,
    next: Option<u32>,
    units: &[&TextUnit],
) -> String {
    let bounds = match (previous, next) {
        (Some(p), Some(n)) => format!("It comes after section {p} and before section {n}."),
        (Some(p), None) => format!("It comes after section {p}."),
        (None, Some(n)) => format!("It comes before section {n}."),
        (None, None) => String::new(),
    };

    format!(
        r#"Section {section_id} is missing. {bounds}

<lines>
{lines}</lines>

Which line starts section {section_id}?

```json
{{"element_id": "id from the input or null", "section_id": {section_id}}}
```"#,
        lines = render_units(units, REPAIR_UNIT_CHARS),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_prompt_lists_units_with_ids() {
        let a = TextUnit::new("p3-0", 3, 0, "12");
        let b = TextUnit::new("p3-1", 3, 1, "You run.");
        let prompt = build_scan_prompt(&[&a, &b], SectionRange { min: 1, max: 350 });
        assert!(prompt.contains("from 1 to 350"));
        assert!(prompt.contains("[p3-0] (p3) 12"));
        assert!(prompt.contains("\"headers\""));
    }

    #[test]
    fn repair_prompt_names_neighbours_and_truncates() {
        let long = TextUnit::new("x", 9, 0, "a".repeat(500));
        let prompt = build_repair_prompt(80, Some(79), Some(81), &[&long]);
        assert!(prompt.contains("Section 80 is missing"));
        assert!(prompt.contains("after section 79 and before section 81"));
        assert!(!prompt.contains(&"a".repeat(201)));
    }
}
