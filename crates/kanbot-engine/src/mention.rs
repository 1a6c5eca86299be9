//! `@agent-name` extraction from comment text.
//!
//! A mention token is the same shape the agent directory accepts as a key:
//! ASCII alphanumerics joined by `-` or `_`. Multi-word agents are written
//! hyphenated (`@UX-Manager`); `@UX Manager` yields the token `UX`.

use std::sync::LazyLock;

use regex::Regex;

use kanbot_core::{AgentDirectory, AgentId};

static MENTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z0-9][A-Za-z0-9_-]*)").unwrap());

/// Mention tokens in order of appearance, without duplicates.
///
/// Skips fenced code blocks, inline code, and `@` preceded by a word
/// character (so `dev@example.com` is not a mention).
pub fn extract_mentions(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut in_code_block = false;

    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_code_block = !in_code_block;
            continue;
        }
        if in_code_block {
            continue;
        }

        for cap in MENTION_PATTERN.captures_iter(line) {
            let (Some(whole), Some(name)) = (cap.get(0), cap.get(1)) else {
                continue;
            };

            if let Some(prev) = line[..whole.start()].chars().next_back() {
                if prev.is_alphanumeric() || prev == '_' || prev == '`' || prev == '@' {
                    continue;
                }
            }
            let backticks = line[..whole.start()].chars().filter(|&c| c == '`').count();
            if backticks % 2 != 0 {
                continue;
            }

            // Sentence punctuation like "@Architect-" is not part of the name.
            let name = name.as_str().trim_end_matches('-');
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }

    names
}

/// The first mention (in text order) that the directory knows, with the
/// unresolved tokens seen before it.
pub fn first_known_mention<'d>(
    text: &str,
    directory: &'d AgentDirectory,
) -> MentionScan<'d> {
    let mut unknown = Vec::new();
    for name in extract_mentions(text) {
        match directory.resolve(&name) {
            Some(agent_id) => {
                return MentionScan {
                    resolved: Some((name, agent_id)),
                    unknown,
                }
            }
            None => unknown.push(name),
        }
    }
    MentionScan {
        resolved: None,
        unknown,
    }
}

#[derive(Debug)]
pub struct MentionScan<'d> {
    pub resolved: Option<(String, &'d AgentId)>,
    pub unknown: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kanbot_settings::KanbotSettings;

    fn directory() -> AgentDirectory {
        AgentDirectory::new(KanbotSettings::default().agents).unwrap()
    }

    #[test]
    fn extracts_in_order() {
        assert_eq!(
            extract_mentions("@Architect draft it, then @QA-Engineer verify"),
            vec!["Architect", "QA-Engineer"]
        );
    }

    #[test]
    fn space_separated_name_yields_first_word() {
        assert_eq!(extract_mentions("ping @UX Manager please"), vec!["UX"]);
    }

    #[test]
    fn trailing_punctuation_is_dropped() {
        assert_eq!(
            extract_mentions("thanks @Developer. Also @DevOps-, and (@UX-Manager)"),
            vec!["Developer", "DevOps", "UX-Manager"]
        );
    }

    #[test]
    fn emails_and_code_are_ignored() {
        let text = "mail dev@Architect.io\n`@Developer` is inline\n```\n@QA-Engineer\n```\n@@DevOps";
        assert!(extract_mentions(text).is_empty());
    }

    #[test]
    fn duplicates_collapse() {
        assert_eq!(extract_mentions("@Developer @Developer"), vec!["Developer"]);
    }

    #[test]
    fn every_directory_name_round_trips() {
        let dir = directory();
        for name in dir.names() {
            let text = format!("Could @{name}, take this one?");
            assert_eq!(extract_mentions(&text), vec![name.to_string()], "{name}");
            assert!(first_known_mention(&text, &dir).resolved.is_some(), "{name}");
        }
    }

    #[test]
    fn first_resolvable_token_wins() {
        let dir = directory();
        let scan = first_known_mention("@Nobody @UX then @Developer and @Architect", &dir);
        let (name, agent_id) = scan.resolved.unwrap();
        assert_eq!(name, "Developer");
        assert_eq!(agent_id.as_str(), "developer");
        assert_eq!(scan.unknown, vec!["Nobody", "UX"]);
    }

    #[test]
    fn no_known_mention() {
        let dir = directory();
        let scan = first_known_mention("@UX Manager help", &dir);
        assert!(scan.resolved.is_none());
        assert_eq!(scan.unknown, vec!["UX"]);
    }
}
