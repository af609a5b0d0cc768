// src/analysis.rs
//! Lexicon-based text analysis for chat messages.

const POSITIVE_WORDS: &[&str] = &[
    "love", "happy", "glad", "great", "good", "wonderful", "amazing", "thanks", "thank", "awesome",
    "excited", "beautiful", "fun", "enjoy", "nice", "best", "sweet", "calm", "proud", "hope",
];

const NEGATIVE_WORDS: &[&str] = &[
    "sad", "angry", "hate", "bad", "terrible", "awful", "lonely", "tired", "upset", "worried",
    "afraid", "scared", "hurt", "cry", "miss", "stress", "stressed", "anxious", "boring", "worst",
];

const EMOTIONAL_WORDS: &[&str] = &[
    "feel", "feeling", "felt", "love", "miss", "lonely", "afraid", "scared", "heart", "hurt",
    "cry", "dream", "hope", "trust", "care", "anxious", "grateful", "ashamed", "vulnerable",
    "secret", "honestly", "emotional",
];

const TOXIC_WORDS: &[&str] = &[
    "idiot", "stupid", "moron", "kill", "die", "shut", "dumb", "loser", "trash", "pathetic",
];

/// Topic categories and the keywords that signal them.
const TOPICS: &[(&str, &[&str])] = &[
    ("work", &["work", "job", "boss", "office", "career", "meeting", "project"]),
    ("family", &["family", "mom", "dad", "mother", "father", "sister", "brother", "kids"]),
    ("relationships", &["friend", "friends", "partner", "date", "dating", "girlfriend", "boyfriend"]),
    ("hobbies", &["game", "games", "hobby", "paint", "drawing", "read", "book", "books"]),
    ("health", &["health", "sleep", "gym", "workout", "doctor", "sick", "run", "running"]),
    ("travel", &["travel", "trip", "vacation", "flight", "beach", "city", "country"]),
    ("food", &["food", "cook", "cooking", "dinner", "lunch", "breakfast", "pizza", "coffee"]),
    ("music", &["music", "song", "songs", "concert", "band", "guitar", "piano", "sing"]),
    ("movies", &["movie", "movies", "film", "series", "show", "netflix", "anime"]),
    ("dreams", &["dream", "dreams", "future", "goal", "goals", "plan", "plans", "someday"]),
];

#[derive(Debug, Clone, PartialEq)]
pub struct TextAnalysis {
    /// Polarity in [-1, 1].
    pub sentiment: f64,
    /// Share of abusive vocabulary, scaled into [0, 1].
    pub toxicity: f64,
    pub emotional: bool,
    pub topics: Vec<&'static str>,
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

pub fn analyze(text: &str) -> TextAnalysis {
    let words: Vec<String> = tokens(text).collect();
    TextAnalysis {
        sentiment: sentiment_of(&words),
        toxicity: toxicity_of(&words),
        emotional: words.iter().any(|w| EMOTIONAL_WORDS.contains(&w.as_str())),
        topics: topics_of(&words),
    }
}

pub fn is_emotional(text: &str) -> bool {
    tokens(text).any(|w| EMOTIONAL_WORDS.contains(&w.as_str()))
}

pub fn topics(text: &str) -> Vec<&'static str> {
    let words: Vec<String> = tokens(text).collect();
    topics_of(&words)
}

fn sentiment_of(words: &[String]) -> f64 {
    let (pos, neg) = words.iter().fold((0i32, 0i32), |(p, n), w| {
        if POSITIVE_WORDS.contains(&w.as_str()) {
            (p + 1, n)
        } else if NEGATIVE_WORDS.contains(&w.as_str()) {
            (p, n + 1)
        } else {
            (p, n)
        }
    });
    if pos + neg == 0 {
        return 0.0;
    }
    f64::from(pos - neg) / f64::from(pos + neg)
}

fn toxicity_of(words: &[String]) -> f64 {
    if words.is_empty() {
        return 0.0;
    }
    let flagged = words
        .iter()
        .filter(|w| TOXIC_WORDS.contains(&w.as_str()))
        .count();
    // a fifth of the words being abusive is already maximal
    (flagged as f64 / words.len() as f64 * 5.0).min(1.0)
}

fn topics_of(words: &[String]) -> Vec<&'static str> {
    TOPICS
        .iter()
        .filter(|(_, keywords)| words.iter().any(|w| keywords.contains(&w.as_str())))
        .map(|(name, _)| *name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_text_has_zero_sentiment() {
        let a = analyze("The train leaves at noon.");
        assert_eq!(a.sentiment, 0.0);
        assert_eq!(a.toxicity, 0.0);
        assert!(!a.emotional);
    }

    #[test]
    fn sentiment_balances_positive_and_negative_words() {
        assert_eq!(analyze("I love this, thanks!").sentiment, 1.0);
        assert_eq!(analyze("Sad and tired today").sentiment, -1.0);
        assert_eq!(analyze("happy but tired").sentiment, 0.0);
    }

    #[test]
    fn detects_emotional_vocabulary_case_insensitively() {
        assert!(is_emotional("Honestly I FEEL lost"));
        assert!(!is_emotional("What's the weather?"));
    }

    #[test]
    fn topics_are_distinct_categories() {
        let found = topics("My boss wants the project done, then dinner with mom and dad");
        assert_eq!(found, vec!["work", "family", "food"]);
    }

    #[test]
    fn toxicity_saturates() {
        assert_eq!(analyze("stupid idiot").toxicity, 1.0);
        let mild = analyze("that movie was stupid but I had fun with friends tonight");
        assert!(mild.toxicity > 0.0 && mild.toxicity < 0.8);
    }
}
