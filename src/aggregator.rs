//! Response Aggregator
//!
//! Binds recognizer transcripts to the question the agent is currently asking
//! and turns the free text into tri-state answers.
//!
//! Only finalized transcripts are fed in. Each one is appended to the current
//! slot and the slot's answer is recomputed from the whole accumulated text.

use serde::Serialize;

use crate::script::{Script, ScriptedQuestion, SymptomMentions, QUESTION_COUNT, SYMPTOMS, WELLBEING};
use crate::triage::SelfReport;

const NEGATIVE_TERMS: &[&str] = &[
    "no", "nope", "nah", "not", "don't", "dont", "didn't", "didnt", "did not", "haven't",
    "havent", "never", "none", "negative", "isn't", "wasn't", "can't",
];
const POSITIVE_TERMS: &[&str] = &[
    "yes", "yeah", "yep", "yup", "sure", "correct", "affirmative", "of course", "definitely",
    "absolutely", "i did", "i have", "i do",
];
const POSITIVE_SENTIMENT: &[&str] = &[
    "good", "great", "fine", "well", "okay", "ok", "wonderful", "better", "excellent",
    "alright", "happy", "fantastic",
];
const NEGATIVE_SENTIMENT: &[&str] = &[
    "bad", "terrible", "awful", "sick", "unwell", "poorly", "worse", "tired", "exhausted",
    "sad", "pain", "hurt", "hurting",
];

/// One answer slot per scripted question
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseSlot {
    pub question: ScriptedQuestion,
    pub transcript: Option<String>,
    pub answer: Option<bool>,
}

/// Tracks the active question and accumulates answers
#[derive(Debug, Clone)]
pub struct ResponseAggregator {
    script: Script,
    slots: Vec<ResponseSlot>,
    current: usize,
    /// Previous transcript and the slot it went to
    last_transcript: Option<(usize, String)>,
}

impl ResponseAggregator {
    pub fn new(script: Script) -> Self {
        let slots = script
            .questions()
            .iter()
            .cloned()
            .map(|question| ResponseSlot {
                question,
                transcript: None,
                answer: None,
            })
            .collect();
        Self {
            script,
            slots,
            current: 0,
            last_transcript: None,
        }
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn slots(&self) -> &[ResponseSlot] {
        &self.slots
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    /// Track the question from the agent's latest utterance.
    ///
    /// Returns the new index when it changed.
    pub fn observe_agent_text(&mut self, text: &str) -> Option<usize> {
        let index = self.script.match_question(text)?;
        if index == self.current {
            return None;
        }
        log::debug!("Active question {} -> {}", self.current, index);
        self.current = index;
        Some(index)
    }

    /// Append a finalized transcript to the current slot.
    ///
    /// Returns false for empty text and for an exact repeat of the previous
    /// transcript within the same slot.
    pub fn record_transcript(&mut self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        let index = self.current;
        if let Some((last_index, last)) = &self.last_transcript {
            if *last_index == index && last == text {
                log::debug!("Ignoring duplicate transcript");
                return false;
            }
        }
        self.last_transcript = Some((index, text.to_string()));

        let slot = &mut self.slots[index];
        let combined = match slot.transcript.take() {
            Some(existing) => format!("{} {}", existing, text),
            None => text.to_string(),
        };
        slot.answer = normalize_answer(index, &combined);
        slot.transcript = Some(combined);
        log::info!("Answer for question {}: {:?}", index, slot.answer);
        true
    }

    /// Every slot has a resolved answer
    pub fn all_answered(&self) -> bool {
        self.slots.iter().all(|s| s.answer.is_some())
    }

    /// Every slot has at least one transcript
    pub fn all_transcribed(&self) -> bool {
        self.slots.iter().all(|s| s.transcript.is_some())
    }

    /// Self-reported answers in classifier form.
    ///
    /// A "yes" to the symptom question sets the symptoms the transcript
    /// names, or all three when none are named. A symptom named without a
    /// yes/no still counts as reported.
    pub fn self_report(&self) -> SelfReport {
        let symptoms = &self.slots[SYMPTOMS];
        let mentions = symptoms
            .transcript
            .as_deref()
            .map(SymptomMentions::scan)
            .unwrap_or_default();

        let flag = |mentioned: bool| match symptoms.answer {
            Some(true) if mentions.any() => Some(mentioned),
            Some(answer) => Some(answer),
            None if mentioned => Some(true),
            None => None,
        };

        SelfReport {
            feeling_well: self.slots[WELLBEING].answer,
            dizziness: flag(mentions.dizziness),
            chest_pain: flag(mentions.chest_pain),
            trouble_breathing: flag(mentions.trouble_breathing),
            medication_taken: self.slots.get(QUESTION_COUNT - 1).and_then(|s| s.answer),
        }
    }

    /// Conversation transcript as `AI: <prompt> USER: <answer> ...`
    pub fn transcript_text(&self) -> String {
        let mut parts = Vec::new();
        for slot in &self.slots {
            if !slot.question.prompt.is_empty() {
                parts.push(format!("AI: {}", slot.question.prompt));
            }
            if let Some(t) = slot.transcript.as_deref().filter(|t| !t.is_empty()) {
                parts.push(format!("USER: {}", t));
            }
        }
        parts.join(" ")
    }
}

/// Normalize free text into a tri-state answer.
///
/// Yes/no vocabulary is checked first; when several terms appear the larger
/// count wins and a tie goes to "no". Only the well-being question falls back
/// to sentiment vocabulary. Anything else stays unresolved.
pub fn normalize_answer(index: usize, text: &str) -> Option<bool> {
    let padded = padded_tokens(text);
    if padded.trim().is_empty() {
        return None;
    }

    if let Some(answer) = polarity(&padded, POSITIVE_TERMS, NEGATIVE_TERMS) {
        return Some(answer);
    }
    if index == WELLBEING {
        return polarity(&padded, POSITIVE_SENTIMENT, NEGATIVE_SENTIMENT);
    }
    None
}

fn polarity(padded: &str, positive: &[&str], negative: &[&str]) -> Option<bool> {
    let pos = count_terms(padded, positive);
    let neg = count_terms(padded, negative);
    match (pos, neg) {
        (0, 0) => None,
        (p, n) => Some(p > n),
    }
}

fn count_terms(padded: &str, terms: &[&str]) -> usize {
    terms
        .iter()
        .map(|t| padded.matches(&format!(" {} ", t)).count())
        .sum()
}

/// Lowercase word tokens joined by single spaces, padded on both ends
fn padded_tokens(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .replace('\u{2019}', "'")
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .collect();
    let joined = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    format!(" {} ", joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::MEDICATION;

    #[test]
    fn test_normalize_answer_examples() {
        assert_eq!(normalize_answer(0, "I'm feeling great today"), Some(true));
        assert_eq!(normalize_answer(1, "no I am not"), Some(false));
        assert_eq!(normalize_answer(2, "yes I did"), Some(true));
        assert_eq!(normalize_answer(0, ""), None);
    }

    #[test]
    fn test_yes_no_outranks_sentiment() {
        // "no" wins over "fine" on the well-being question
        assert_eq!(normalize_answer(0, "No, not fine at all"), Some(false));
        assert_eq!(normalize_answer(0, "Yes, pretty awful"), Some(true));
    }

    #[test]
    fn test_sentiment_only_for_wellbeing() {
        assert_eq!(normalize_answer(0, "pretty tired"), Some(false));
        assert_eq!(normalize_answer(1, "pretty tired"), None);
        assert_eq!(normalize_answer(2, "I think so, maybe"), None);
    }

    #[test]
    fn test_negative_wins_ties() {
        assert_eq!(normalize_answer(2, "yes... no"), Some(false));
        assert_eq!(normalize_answer(2, "Yeah I did, no trouble"), Some(true));
    }

    #[test]
    fn test_terms_match_whole_words() {
        // "know" and "nothing" must not count as "no"
        assert_eq!(normalize_answer(1, "I know nothing"), None);
        assert_eq!(normalize_answer(2, "I didn’t"), Some(false));
    }

    #[test]
    fn test_transcripts_bind_to_current_question() {
        let mut agg = ResponseAggregator::new(Script::default());
        assert_eq!(agg.current_index(), 0);
        assert!(agg.record_transcript("I'm doing great"));

        assert_eq!(agg.observe_agent_text("Any chest pain or dizziness?"), Some(1));
        assert!(agg.record_transcript("No"));
        assert!(agg.record_transcript("none at all"));

        assert_eq!(agg.observe_agent_text("Okay. Did you take your medication?"), Some(MEDICATION));
        assert!(agg.record_transcript("yes I did"));

        let slots = agg.slots();
        assert_eq!(slots[0].answer, Some(true));
        assert_eq!(slots[1].transcript.as_deref(), Some("No none at all"));
        assert_eq!(slots[1].answer, Some(false));
        assert_eq!(slots[2].answer, Some(true));
        assert!(agg.all_answered());
        assert!(agg.all_transcribed());
    }

    #[test]
    fn test_unmatched_agent_text_keeps_index() {
        let mut agg = ResponseAggregator::new(Script::default());
        agg.observe_agent_text("Have you had any dizziness?");
        assert_eq!(agg.observe_agent_text("I see, thank you."), None);
        assert_eq!(agg.current_index(), 1);
    }

    #[test]
    fn test_duplicate_and_empty_transcripts_ignored() {
        let mut agg = ResponseAggregator::new(Script::default());
        assert!(agg.record_transcript("good"));
        assert!(!agg.record_transcript("  good "));
        assert!(!agg.record_transcript("   "));
        assert_eq!(agg.slots()[0].transcript.as_deref(), Some("good"));
    }

    #[test]
    fn test_same_answer_to_consecutive_questions() {
        let mut agg = ResponseAggregator::new(Script::default());
        agg.observe_agent_text("Any dizziness, chest pain, or trouble breathing?");
        assert!(agg.record_transcript("No"));

        agg.observe_agent_text("Did you take your medication today?");
        assert!(agg.record_transcript("No"));

        let medication = &agg.slots()[MEDICATION];
        assert_eq!(medication.transcript.as_deref(), Some("No"));
        assert_eq!(medication.answer, Some(false));
        assert_eq!(agg.self_report().medication_taken, Some(false));

        // Still a repeat within the medication slot
        assert!(!agg.record_transcript("No"));
    }

    #[test]
    fn test_self_report_symptom_mapping() {
        let mut agg = ResponseAggregator::new(Script::default());
        agg.observe_agent_text("Any dizziness, chest pain, or trouble breathing?");
        agg.record_transcript("yes, I've been dizzy");
        let report = agg.self_report();
        assert_eq!(report.dizziness, Some(true));
        assert_eq!(report.chest_pain, Some(false));
        assert_eq!(report.trouble_breathing, Some(false));
        assert_eq!(report.feeling_well, None);
        assert_eq!(report.medication_taken, None);

        let mut agg = ResponseAggregator::new(Script::default());
        agg.observe_agent_text("Any dizziness?");
        agg.record_transcript("yeah");
        let report = agg.self_report();
        assert_eq!(report.chest_pain, Some(true));

        let mut agg = ResponseAggregator::new(Script::default());
        agg.observe_agent_text("Any dizziness?");
        agg.record_transcript("my chest feels tight");
        let report = agg.self_report();
        assert_eq!(report.chest_pain, Some(true));
        assert_eq!(report.dizziness, None);
    }

    #[test]
    fn test_transcript_text_format() {
        let mut agg = ResponseAggregator::new(Script::default());
        agg.record_transcript("fine");
        let text = agg.transcript_text();
        assert!(text.starts_with("AI: How are you feeling today? USER: fine AI: "));
        assert!(!text.contains("USER:  "));
    }
}
