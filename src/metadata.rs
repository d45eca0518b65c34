//! Structured `[key:value]` annotations embedded in the remote's free-text
//! note field (spec §6 "Transfer metadata encoding on the remote", §9
//! "Structured metadata embedded in free text"). This is the only reliable
//! channel for extending the remote's schema without a migration, so both
//! the transfer-pair fields (`paired`, `suspect_reason`) and the rule
//! engine's `metadata:` transform share this grammar.

use regex::Regex;

use crate::model::TransactionId;

/// Matches one `[key:value]` token, tolerant of surrounding whitespace.
fn tag_pattern() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*\[([a-z_][a-z0-9_]*):([^\]]*)\]").expect("static pattern"))
}

/// Splits `note` into its free user text (with every `[key:value]` token
/// stripped out) and the ordered list of tags found, in the order they
/// appeared (§9: "parser must tolerate interleaving with user text").
pub fn parse_tags(note: &str) -> (String, Vec<(String, String)>) {
    let re = tag_pattern();
    let mut tags = Vec::new();
    for caps in re.captures_iter(note) {
        tags.push((caps[1].to_string(), caps[2].to_string()));
    }
    let user_text = re.replace_all(note, "").trim().to_string();
    (user_text, tags)
}

/// Appends `tags` to `user_text` in the order given, producing the stable
/// `"<note> [key:value] [key:value]"` grammar from §6.
pub fn append_tags(user_text: &str, tags: &[(&str, String)]) -> String {
    let mut out = user_text.trim().to_string();
    for (key, value) in tags {
        out.push_str(&format!(" [{key}:{value}]"));
    }
    out.trim().to_string()
}

/// Parses the transfer-specific tags (`paired`, `suspect_reason`) out of a
/// remote note, returning `(narration, paired_id, suspect_reason)`.
pub fn parse_note(note: &str) -> (String, Option<TransactionId>, Option<String>) {
    let (user_text, tags) = parse_tags(note);
    let mut paired_id = None;
    let mut suspect_reason = None;
    for (key, value) in tags {
        match key.as_str() {
            "paired" => paired_id = value.parse::<TransactionId>().ok(),
            "suspect_reason" => suspect_reason = Some(value),
            _ => {}
        }
    }
    (user_text, paired_id, suspect_reason)
}

/// Writes the transfer-specific tags back onto a note, in the stable
/// order the spec requires: `paired` before `suspect_reason` (§6).
pub fn write_note(user_text: &str, paired_id: Option<TransactionId>, suspect_reason: Option<&str>) -> String {
    let mut tags: Vec<(&str, String)> = Vec::new();
    if let Some(id) = paired_id {
        tags.push(("paired", id.to_string()));
    }
    if let Some(reason) = suspect_reason {
        tags.push(("suspect_reason", reason.to_string()));
    }
    append_tags(user_text, &tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tags_interleaved_with_user_text() {
        let (text, paired, reason) =
            parse_note("User note [paired:12345] [suspect_reason:date-delay-3d]");
        assert_eq!(text, "User note");
        assert_eq!(paired, Some(12345));
        assert_eq!(reason.as_deref(), Some("date-delay-3d"));
    }

    #[test]
    fn tag_order_is_tolerant_on_parse_but_stable_on_write() {
        let (text, paired, reason) =
            parse_note("[suspect_reason:same-direction] User note [paired:7]");
        assert_eq!(text, "User note");
        assert_eq!(paired, Some(7));
        assert_eq!(reason.as_deref(), Some("same-direction"));

        let written = write_note("User note", paired, reason.as_deref());
        assert_eq!(written, "User note [paired:7] [suspect_reason:same-direction]");
    }

    #[test]
    fn note_with_no_tags_round_trips_as_plain_text() {
        let (text, paired, reason) = parse_note("just a memo");
        assert_eq!(text, "just a memo");
        assert!(paired.is_none());
        assert!(reason.is_none());
    }
}
