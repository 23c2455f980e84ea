use regex::Regex;

use crate::flows::registry::FlowRegistry;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TriggerMatch {
    Single(String),
    Ambiguous(Vec<String>),
    NoMatch,
}

/// Whole-word, case-insensitive phrase matching.
#[derive(Clone, Debug)]
pub struct PhraseMatcher {
    phrases: Vec<(Regex, u32)>,
}

impl PhraseMatcher {
    pub fn new<I, S>(phrases: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::build(phrases, |body| format!(r"(?i)\b{body}\b"))
    }

    /// Matches only when the phrase is the whole message, give or take
    /// punctuation, so "does cover stop at the border?" is not a command.
    pub fn commands<I, S>(phrases: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::build(phrases, |body| format!(r"(?i)^\W*{body}\W*$"))
    }

    fn build<I, S>(phrases: I, pattern: impl Fn(&str) -> String) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let phrases = phrases
            .into_iter()
            .filter(|phrase| !phrase.as_ref().trim().is_empty())
            .map(|phrase| {
                let words: Vec<String> =
                    phrase.as_ref().split_whitespace().map(regex::escape).collect();
                let weight = words.len() as u32;
                Regex::new(&pattern(&words.join(r"\s+"))).map(|regex| (regex, weight))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { phrases })
    }

    pub fn matches(&self, message: &str) -> bool {
        self.phrases.iter().any(|(regex, _)| regex.is_match(message))
    }

    /// Sum of the word counts of every phrase found in `message`.
    pub fn score(&self, message: &str) -> u32 {
        self.phrases
            .iter()
            .filter(|(regex, _)| regex.is_match(message))
            .map(|(_, weight)| *weight)
            .sum()
    }
}

/// Picks the flow a free-text message asks for.
#[derive(Clone, Debug)]
pub struct TriggerMatcher {
    flows: Vec<(String, PhraseMatcher)>,
    ambiguity_margin: u32,
}

impl TriggerMatcher {
    pub fn new(registry: &FlowRegistry, ambiguity_margin: u32) -> Result<Self, regex::Error> {
        let flows = registry
            .flows()
            .map(|flow| Ok((flow.flow_id.clone(), PhraseMatcher::new(&flow.triggers)?)))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { flows, ambiguity_margin })
    }

    /// A flow wins when its score beats every other flow by more than the
    /// configured margin. Anything closer is reported as ambiguous.
    pub fn resolve(&self, message: &str) -> TriggerMatch {
        let scored: Vec<(&str, u32)> = self
            .flows
            .iter()
            .map(|(flow_id, matcher)| (flow_id.as_str(), matcher.score(message)))
            .filter(|(_, score)| *score > 0)
            .collect();

        let Some(best) = scored.iter().map(|(_, score)| *score).max() else {
            return TriggerMatch::NoMatch;
        };

        let contenders: Vec<String> = scored
            .iter()
            .filter(|(_, score)| score.saturating_add(self.ambiguity_margin) >= best)
            .map(|(flow_id, _)| flow_id.to_string())
            .collect();

        match contenders.as_slice() {
            [single] => TriggerMatch::Single(single.clone()),
            _ => TriggerMatch::Ambiguous(contenders),
        }
    }
}
