//! Scripted check-in questions
//!
//! The agent asks exactly three questions in order. Each question has a
//! characteristic vocabulary used to recognize, from the agent's own speech,
//! which question is currently being asked.

use serde::{Deserialize, Serialize};

/// Number of scripted questions per session
pub const QUESTION_COUNT: usize = 3;

/// Index of the general well-being question
pub const WELLBEING: usize = 0;
/// Index of the dizziness / chest pain / breathing question
pub const SYMPTOMS: usize = 1;
/// Index of the medication question
pub const MEDICATION: usize = 2;

const WELLBEING_TERMS: &[&str] = &[
    "how are you feeling",
    "how do you feel",
    "feeling today",
    "how are you doing",
];
const SYMPTOM_TERMS: &[&str] = &["dizz", "chest", "breath"];
const MEDICATION_TERMS: &[&str] = &["medication", "medicine", "meds", "pill", "prescription"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedQuestion {
    pub index: usize,
    pub prompt: String,
}

/// The fixed, ordered question set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    questions: Vec<ScriptedQuestion>,
}

impl Script {
    pub fn new(prompts: [String; QUESTION_COUNT]) -> Self {
        let questions = prompts
            .into_iter()
            .enumerate()
            .map(|(index, prompt)| ScriptedQuestion { index, prompt })
            .collect();
        Self { questions }
    }

    pub fn questions(&self) -> &[ScriptedQuestion] {
        &self.questions
    }

    pub fn prompt(&self, index: usize) -> &str {
        self.questions
            .get(index)
            .map(|q| q.prompt.as_str())
            .unwrap_or_default()
    }

    /// Find the question the agent is asking in `text`.
    ///
    /// When an utterance touches several questions (e.g. a recap followed by
    /// the next question) the vocabulary term appearing last wins.
    pub fn match_question(&self, text: &str) -> Option<usize> {
        let lower = text.to_lowercase();
        [
            (WELLBEING, WELLBEING_TERMS),
            (SYMPTOMS, SYMPTOM_TERMS),
            (MEDICATION, MEDICATION_TERMS),
        ]
        .iter()
        .filter_map(|(index, terms)| {
            terms
                .iter()
                .filter_map(|t| lower.rfind(t))
                .max()
                .map(|pos| (pos, *index))
        })
        .max()
        .map(|(_, index)| index)
    }
}

impl Default for Script {
    fn default() -> Self {
        Self::new(default_prompts())
    }
}

pub fn default_prompts() -> [String; QUESTION_COUNT] {
    [
        "How are you feeling today?".to_string(),
        "Have you felt any dizziness, chest pain, or trouble breathing?".to_string(),
        "Have you taken your medication today?".to_string(),
    ]
}

/// Which red-flag symptoms a free-text answer mentions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SymptomMentions {
    pub dizziness: bool,
    pub chest_pain: bool,
    pub trouble_breathing: bool,
}

impl SymptomMentions {
    pub fn scan(text: &str) -> Self {
        let lower = text.to_lowercase();
        Self {
            dizziness: lower.contains("dizz") || lower.contains("lightheaded"),
            chest_pain: lower.contains("chest"),
            trouble_breathing: lower.contains("breath"),
        }
    }

    pub fn any(&self) -> bool {
        self.dizziness || self.chest_pain || self.trouble_breathing
    }
}
