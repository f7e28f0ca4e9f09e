//! Tolerant extraction of (answer, rationale) from free-text completions.
//!
//! Model output drifts in format, so each field is read by an ordered chain
//! of small rules, each returning `Option`; the first hit wins and a miss on
//! every rule degrades to an empty string. Extraction never fails.

use crate::models::{ExtractionConfig, Result, SurveyorError};
use regex::{Regex, RegexBuilder};

/// Fields extracted from one completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub answer: String,
    pub rationale: String,
}

/// Parses raw completion text into an [`Extraction`].
#[derive(Debug, Clone)]
pub struct ResponseExtractor {
    /// Lowercase line prefixes introducing the answer
    answer_labels: Vec<String>,
    /// Case-insensitive markers introducing the rationale
    reasoning_labels: Vec<Regex>,
    digits: Regex,
}

impl ResponseExtractor {
    /// Build an extractor for the configured labels.
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let answer_labels = config
            .answer_labels
            .iter()
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
            .collect();

        let reasoning_labels = config
            .reasoning_labels
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .map(|l| {
                RegexBuilder::new(&regex::escape(l))
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| SurveyorError::Internal(format!("Invalid label {l:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let digits = Regex::new(r"\d+")
            .map_err(|e| SurveyorError::Internal(format!("Invalid digit pattern: {e}")))?;

        Ok(Self {
            answer_labels,
            reasoning_labels,
            digits,
        })
    }

    /// Extract the answer and, when requested, the rationale.
    pub fn extract(&self, text: &str, want_rationale: bool) -> Extraction {
        let lines: Vec<&str> = text.lines().collect();

        let answer = self
            .labeled_answer(&lines)
            .or_else(|| {
                if want_rationale {
                    None
                } else {
                    Self::bare_number_line(&lines).or_else(|| self.first_digit_run(text))
                }
            })
            .unwrap_or_default();

        let rationale = if want_rationale {
            self.labeled_rationale(&lines)
                .or_else(|| self.inline_rationale(text))
                .unwrap_or_default()
        } else {
            String::new()
        };

        Extraction { answer, rationale }
    }

    /// First line starting with an answer label; the text after its first colon.
    fn labeled_answer(&self, lines: &[&str]) -> Option<String> {
        lines.iter().find_map(|line| {
            let line = line.trim();
            let lower = line.to_lowercase();
            if !self.answer_labels.iter().any(|l| lower.starts_with(l.as_str())) {
                return None;
            }
            let value = match line.split_once(':') {
                Some((_, rest)) => rest,
                None => "",
            };
            Some(value.trim().to_string())
        })
    }

    /// First line made only of ASCII digits.
    fn bare_number_line(lines: &[&str]) -> Option<String> {
        lines.iter().map(|l| l.trim()).find_map(|line| {
            (!line.is_empty() && line.bytes().all(|b| b.is_ascii_digit()))
                .then(|| line.to_string())
        })
    }

    /// First run of digits anywhere in the text.
    fn first_digit_run(&self, text: &str) -> Option<String> {
        self.digits.find(text).map(|m| m.as_str().to_string())
    }

    /// From the first line holding a reasoning label, the rest of that line
    /// plus every later non-blank line, joined with single spaces.
    fn labeled_rationale(&self, lines: &[&str]) -> Option<String> {
        let (start, rest) = lines
            .iter()
            .enumerate()
            .find_map(|(i, line)| self.after_reasoning_label(line).map(|rest| (i, rest)))?;

        let mut parts: Vec<&str> = Vec::new();
        let rest = rest.trim();
        if !rest.is_empty() {
            parts.push(rest);
        }
        parts.extend(
            lines[start + 1..]
                .iter()
                .map(|l| l.trim())
                .filter(|l| !l.is_empty()),
        );

        Some(parts.join(" "))
    }

    /// Everything after the first reasoning label anywhere in the text.
    fn inline_rationale(&self, text: &str) -> Option<String> {
        self.after_reasoning_label(text)
            .map(|rest| rest.trim().to_string())
    }

    /// Text following the earliest reasoning label in `haystack`.
    fn after_reasoning_label<'a>(&self, haystack: &'a str) -> Option<&'a str> {
        self.reasoning_labels
            .iter()
            .filter_map(|re| re.find(haystack))
            .min_by_key(|m| m.start())
            .map(|m| &haystack[m.end()..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> ResponseExtractor {
        ResponseExtractor::new(&ExtractionConfig::default()).unwrap()
    }

    #[test]
    fn test_labeled_answer_and_multiline_reasoning() {
        let out = extractor().extract("Answer: 4\nReasoning: because X\nbecause Y", true);
        assert_eq!(out.answer, "4");
        assert_eq!(out.rationale, "because X because Y");
    }

    #[test]
    fn test_bare_number() {
        let out = extractor().extract("3", false);
        assert_eq!(out, Extraction { answer: "3".to_string(), rationale: String::new() });
    }

    #[test]
    fn test_embedded_digits() {
        let out = extractor().extract("I believe the value is around 7 overall.", false);
        assert_eq!(out.answer, "7");
    }

    #[test]
    fn test_labels_are_case_insensitive() {
        let out = extractor().extract("  ANSWER:  5 \n\nREASONING:\n  clear majority \n\n  of peers", true);
        assert_eq!(out.answer, "5");
        assert_eq!(out.rationale, "clear majority of peers");
    }

    #[test]
    fn test_reasoning_label_mid_line() {
        let out = extractor().extract("Answer: 2\nMy reasoning: the team rarely meets", true);
        assert_eq!(out.answer, "2");
        assert_eq!(out.rationale, "the team rarely meets");
    }

    #[test]
    fn test_rationale_ignored_when_not_requested() {
        let out = extractor().extract("Answer: 1\nReasoning: not asked for", false);
        assert_eq!(out.answer, "1");
        assert_eq!(out.rationale, "");
    }

    #[test]
    fn test_no_digit_fallback_when_rationale_requested() {
        let out = extractor().extract("Probably 3, since they collaborate.", true);
        assert_eq!(out.answer, "");
        assert_eq!(out.rationale, "");
    }

    #[test]
    fn test_bare_line_preferred_over_earlier_digits() {
        let out = extractor().extract("On a 1-5 scale:\n4\n", false);
        assert_eq!(out.answer, "4");
    }

    #[test]
    fn test_first_label_wins() {
        let out = extractor().extract("Answer: 2\nAnswer: 5", false);
        assert_eq!(out.answer, "2");
    }

    #[test]
    fn test_unparseable_degrades_to_empty() {
        let out = extractor().extract("I cannot answer that.", false);
        assert_eq!(out, Extraction::default());
    }

    #[test]
    fn test_inline_rationale_rule() {
        let rule = extractor().inline_rationale("4 -- reasoning:  they share an office ");
        assert_eq!(rule.as_deref(), Some("they share an office"));
        assert_eq!(extractor().inline_rationale("no label here"), None);
    }

    #[test]
    fn test_custom_labels() {
        let config = ExtractionConfig {
            answer_labels: vec!["answer:".to_string(), "Risposta:".to_string()],
            reasoning_labels: vec!["reasoning:".to_string(), "Motivazione:".to_string()],
        };
        let out = ResponseExtractor::new(&config)
            .unwrap()
            .extract("Risposta: 3\nMotivazione: lavorano insieme", true);
        assert_eq!(out.answer, "3");
        assert_eq!(out.rationale, "lavorano insieme");
    }
}
