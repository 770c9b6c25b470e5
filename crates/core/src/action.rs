//! Parsing of raw model output into action records.
//!
//! The model speaks a flat tag protocol: each turn's output is expected to
//! be one `<tag>content</tag>` element. This parser scans top-level
//! elements in document order and applies two fallbacks for untagged
//! output: trivially short output means "end", anything else is treated as
//! plain assistant speech.

/// Untagged output shorter than this many characters is treated as
/// termination rather than speech.
const SHORT_OUTPUT_THRESHOLD: usize = 5;

/// One parsed action from the model's output. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRecord {
    pub tag: String,
    pub content: String,
}

/// Parse raw model output into an ordered list of action records.
///
/// - no top-level tags and fewer than 5 characters → a single synthetic
///   `end` action with empty content;
/// - no top-level tags otherwise → a single synthetic `assistant` action
///   carrying the entire raw text;
/// - one or more tags → all of them, in document order (the orchestrator
///   consumes only the first).
pub fn parse_output(raw: &str) -> Vec<ActionRecord> {
    let actions = scan_top_level(raw);
    if !actions.is_empty() {
        return actions;
    }

    if raw.chars().count() < SHORT_OUTPUT_THRESHOLD {
        vec![ActionRecord {
            tag: "end".to_string(),
            content: String::new(),
        }]
    } else {
        vec![ActionRecord {
            tag: "assistant".to_string(),
            content: raw.to_string(),
        }]
    }
}

/// Scan `raw` for top-level `<name>...</name>` elements.
///
/// Text between elements is ignored. Markup nested inside an element is
/// stripped from its content. An element with no closing tag runs to the
/// end of the input (lenient, like an HTML parser auto-closing at EOF).
fn scan_top_level(raw: &str) -> Vec<ActionRecord> {
    let mut records = Vec::new();
    let mut pos = 0;

    while let Some(rel) = raw[pos..].find('<') {
        let open = pos + rel;
        let Some((name, body_start)) = parse_open_tag(&raw[open..]) else {
            pos = open + 1;
            continue;
        };
        let body_start = open + body_start;

        let close = format!("</{name}>");
        let (inner, next) = match raw[body_start..].find(&close) {
            Some(rel) => (
                &raw[body_start..body_start + rel],
                body_start + rel + close.len(),
            ),
            None => (&raw[body_start..], raw.len()),
        };

        records.push(ActionRecord {
            tag: name,
            content: strip_markup(inner).trim().to_string(),
        });
        pos = next;
    }

    records
}

/// Parse `<name>` at the start of `s`. Returns the tag name and the byte
/// offset just past the `>`.
fn parse_open_tag(s: &str) -> Option<(String, usize)> {
    let rest = s.strip_prefix('<')?;
    let mut name_len = 0;
    for (i, c) in rest.char_indices() {
        if c == '>' {
            name_len = i;
            break;
        }
        let valid = if i == 0 {
            c.is_ascii_alphabetic() || c == '_'
        } else {
            c.is_ascii_alphanumeric() || c == '_' || c == '-'
        };
        if !valid {
            return None;
        }
    }
    if name_len == 0 {
        return None;
    }
    Some((rest[..name_len].to_string(), 1 + name_len + 1))
}

/// Remove any `<...>` spans from `s`, keeping the text between them.
fn strip_markup(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tag: &str, content: &str) -> ActionRecord {
        ActionRecord {
            tag: tag.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn single_tagged_action() {
        assert_eq!(
            parse_output("<assistant>hi</assistant>"),
            vec![record("assistant", "hi")]
        );
    }

    #[test]
    fn inner_whitespace_is_trimmed() {
        assert_eq!(
            parse_output("<assistant>\n  hello there \n</assistant>"),
            vec![record("assistant", "hello there")]
        );
    }

    #[test]
    fn short_untagged_output_becomes_end() {
        assert_eq!(parse_output("ok"), vec![record("end", "")]);
        assert_eq!(parse_output(""), vec![record("end", "")]);
    }

    #[test]
    fn long_untagged_output_becomes_assistant() {
        assert_eq!(
            parse_output("okay then"),
            vec![record("assistant", "okay then")]
        );
    }

    #[test]
    fn multiple_top_level_tags_kept_in_order() {
        let actions = parse_output("<a>1</a><b>2</b>");
        assert_eq!(actions, vec![record("a", "1"), record("b", "2")]);
    }

    #[test]
    fn text_between_elements_is_ignored() {
        let actions = parse_output("noise <tool>{}</tool> trailing");
        assert_eq!(actions, vec![record("tool", "{}")]);
    }

    #[test]
    fn nested_markup_is_stripped_from_content() {
        let actions = parse_output("<assistant>one <em>two</em> three</assistant>");
        assert_eq!(actions, vec![record("assistant", "one two three")]);
    }

    #[test]
    fn unclosed_tag_runs_to_end_of_input() {
        let actions = parse_output("<assistant>hi there");
        assert_eq!(actions, vec![record("assistant", "hi there")]);
    }

    #[test]
    fn stray_angle_bracket_is_not_a_tag() {
        assert_eq!(
            parse_output("2 < 3 is true, clearly"),
            vec![record("assistant", "2 < 3 is true, clearly")]
        );
    }

    #[test]
    fn tool_call_body_survives_parsing() {
        let body = r#"{"module": "clock", "function": "create_timer", "args": {"duration": 1, "unit": "seconds"}}"#;
        let actions = parse_output(&format!("<tool>{body}</tool>"));
        assert_eq!(actions, vec![record("tool", body)]);
    }
}
