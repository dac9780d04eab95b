//! Individual suspicion signals. Each returns a score in `[0, 1]` where
//! higher means "more likely automated".

use std::collections::{HashSet, VecDeque};
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::verification::tokenize;
use crate::config::SignalWeights;

/// Minimum messages before repetition is judged.
const MIN_MESSAGES_FOR_REPETITION: usize = 3;
/// Minimum tokens before lexical diversity is judged.
const MIN_TOKENS_FOR_DIVERSITY: usize = 12;
/// Type/token ratio at or above which text counts as fully diverse.
const DIVERSE_TTR: f64 = 0.4;

/// Per-signal scores for one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalScores {
    pub frequency: f64,
    pub latency: f64,
    pub entropy: f64,
    pub content: f64,
    pub history: f64,
}

impl SignalScores {
    /// Weighted mean. Zero total weight yields zero.
    pub fn aggregate(&self, w: &SignalWeights) -> f64 {
        let total = w.total();
        if total <= 0.0 {
            return 0.0;
        }
        let sum = self.frequency * w.frequency
            + self.latency * w.latency
            + self.entropy * w.entropy
            + self.content * w.content
            + self.history * w.history;
        (sum / total).clamp(0.0, 1.0)
    }
}

// ── Frequency ───────────────────────────────────────────────────────

/// Messages inside `window` (including the current one) scaled so that one
/// message scores 0 and `ceiling` or more score 1.
pub fn frequency(
    arrivals: &VecDeque<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: Duration,
    ceiling: usize,
) -> f64 {
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    let count = arrivals.iter().filter(|t| now - **t <= window).count();
    if ceiling <= 1 {
        return if count > 1 { 1.0 } else { 0.0 };
    }
    (count.saturating_sub(1) as f64 / (ceiling - 1) as f64).clamp(0.0, 1.0)
}

// ── Response latency ────────────────────────────────────────────────

/// 1.0 at or below `bot`, falling linearly to 0 at `human`. No outbound
/// reference or a negative latency scores 0.
pub fn latency(reply_after: Option<chrono::Duration>, bot: Duration, human: Duration) -> f64 {
    let Some(latency) = reply_after.and_then(|d| d.to_std().ok()) else {
        return 0.0;
    };
    if latency <= bot {
        return 1.0;
    }
    if latency >= human || human <= bot {
        return 0.0;
    }
    let span = (human - bot).as_secs_f64();
    1.0 - (latency - bot).as_secs_f64() / span
}

// ── Entropy / pattern ───────────────────────────────────────────────

/// Max of a repetition score and a low-lexical-diversity score over the
/// recent texts (current message included).
pub fn entropy(recent: &VecDeque<String>) -> f64 {
    repetition(recent).max(low_diversity(recent))
}

fn repetition(recent: &VecDeque<String>) -> f64 {
    let n = recent.len();
    if n < MIN_MESSAGES_FOR_REPETITION {
        return 0.0;
    }
    let distinct: HashSet<String> = recent.iter().map(|t| tokenize(t).join(" ")).collect();
    1.0 - (distinct.len().saturating_sub(1)) as f64 / (n - 1) as f64
}

fn low_diversity(recent: &VecDeque<String>) -> f64 {
    let tokens: Vec<String> = recent.iter().flat_map(|t| tokenize(t)).collect();
    if tokens.len() < MIN_TOKENS_FOR_DIVERSITY {
        return 0.0;
    }
    let distinct: HashSet<&String> = tokens.iter().collect();
    let ttr = distinct.len() as f64 / tokens.len() as f64;
    ((DIVERSE_TTR - ttr) / DIVERSE_TTR).clamp(0.0, 1.0)
}

// ── Content patterns ────────────────────────────────────────────────

static AWAY_MESSAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(auto(matic)?[- ]?(reply|response)|out of (the )?office|away message|i('| a)m (currently )?(away|unavailable)|mensagem autom[aá]tica|resposta autom[aá]tica|no momento n[aã]o (estou|estamos|podemos))",
    )
    .unwrap()
});

static MENU_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\b(reply|type|press|send|enter|digite|responda|envie|selecione|escolha)\b.{0,40}\b(number|option|n[uú]mero|op[cç][aã]o)|main menu|menu principal|(select|choose) an option)",
    )
    .unwrap()
});

static BUSINESS_HOURS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(business hours|opening hours|office hours|hor[aá]rio de (atendimento|funcionamento)|segunda a sexta|monday (to|through) friday)",
    )
    .unwrap()
});

static NUMBERED_OPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(\d{1,2}|[a-eA-E])\s*[\)\.\-:]\s+\S").unwrap());

static KEYCAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9#*]\u{FE0F}?\u{20E3}").unwrap());

/// A content rule over one of the compiled patterns.
#[derive(Debug, Clone)]
pub struct ContentRule {
    pub regex: &'static Regex,
    pub score: f64,
    pub label: &'static str,
}

/// Pattern rules for automated-message boilerplate.
#[derive(Debug, Clone)]
pub struct ContentRules {
    rules: Vec<ContentRule>,
}

impl ContentRules {
    /// Away messages, menu prompts and business-hours notices in English
    /// and Portuguese.
    pub fn default_rules() -> Self {
        let rules = vec![
            ContentRule {
                regex: LazyLock::force(&AWAY_MESSAGE),
                score: 1.0,
                label: "away_message",
            },
            ContentRule {
                regex: LazyLock::force(&MENU_PROMPT),
                score: 0.9,
                label: "menu_prompt",
            },
            ContentRule {
                regex: LazyLock::force(&BUSINESS_HOURS),
                score: 0.6,
                label: "business_hours",
            },
        ];
        Self { rules }
    }

    /// Highest score among the matching rules, with the rule label.
    pub fn score(&self, text: &str) -> (f64, Option<&'static str>) {
        let mut best = (0.0, None);
        let mut consider = |score: f64, label: &'static str| {
            if score > best.0 {
                best = (score, Some(label));
            }
        };

        for rule in &self.rules {
            if rule.regex.is_match(text) {
                consider(rule.score, rule.label);
            }
        }

        match NUMBERED_OPTION.find_iter(text).count() {
            0 | 1 => {}
            2 => consider(0.5, "numbered_options"),
            _ => consider(0.8, "numbered_options"),
        }

        if KEYCAP.find_iter(text).count() >= 2 {
            consider(0.8, "keycap_options");
        }

        best
    }
}

// ── Historical carryover ────────────────────────────────────────────

/// Previous aggregate decayed with the configured half-life.
pub fn carryover(previous: f64, elapsed: chrono::Duration, half_life: Duration) -> f64 {
    let elapsed = elapsed.to_std().unwrap_or(Duration::ZERO).as_secs_f64();
    let half_life = half_life.as_secs_f64();
    if half_life <= 0.0 {
        return 0.0;
    }
    (previous * 0.5_f64.powf(elapsed / half_life)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(items: &[&str]) -> VecDeque<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn frequency_scales_with_burst() {
        let now = Utc::now();
        let window = Duration::from_secs(10);
        let one: VecDeque<_> = [now].into();
        assert_eq!(frequency(&one, now, window, 6), 0.0);

        let burst: VecDeque<_> = (0..6).map(|i| now - chrono::Duration::seconds(i)).collect();
        assert_eq!(frequency(&burst, now, window, 6), 1.0);

        let old: VecDeque<_> = [now - chrono::Duration::seconds(60), now].into();
        assert_eq!(frequency(&old, now, window, 6), 0.0);
    }

    #[test]
    fn latency_bands() {
        let bot = Duration::from_millis(1000);
        let human = Duration::from_millis(3000);
        let ms = |n| Some(chrono::Duration::milliseconds(n));
        assert_eq!(latency(ms(400), bot, human), 1.0);
        assert_eq!(latency(ms(2000), bot, human), 0.5);
        assert_eq!(latency(ms(10_000), bot, human), 0.0);
        assert_eq!(latency(None, bot, human), 0.0);
        assert_eq!(latency(ms(-50), bot, human), 0.0);
    }

    #[test]
    fn repetition_detects_identical_messages() {
        assert_eq!(entropy(&texts(&["Menu", "menu", "MENU!"])), 1.0);
        assert_eq!(entropy(&texts(&["hi", "how much?", "ok thanks"])), 0.0);
        assert_eq!(entropy(&texts(&["same", "same"])), 0.0);
    }

    #[test]
    fn low_diversity_detects_looping_text() {
        let looping = texts(&["buy now buy now buy now", "buy now buy now buy now"]);
        assert!(entropy(&looping) > 0.5);

        let natural = texts(&[
            "hello, I saw your ad about the CRM tool",
            "we are a small team of five and need pipeline tracking",
        ]);
        assert_eq!(entropy(&natural), 0.0);
    }

    #[test]
    fn content_rules_flag_boilerplate() {
        let rules = ContentRules::default_rules();
        assert_eq!(
            rules.score("This is an automatic reply, I am out of office"),
            (1.0, Some("away_message"))
        );
        assert_eq!(
            rules.score("Digite o número da opção desejada").1,
            Some("menu_prompt")
        );
        assert_eq!(
            rules.score("1) Sales\n2) Support\n3) Billing").0,
            0.8
        );
        assert_eq!(rules.score("1. Sales\n2. Support").0, 0.5);
        assert_eq!(rules.score("1️⃣ Sales 2️⃣ Support").0, 0.8);
        assert_eq!(
            rules.score("Our business hours are 9 to 5").1,
            Some("business_hours")
        );
        assert_eq!(rules.score("hi, what's the price for 2 seats?"), (0.0, None));
    }

    #[test]
    fn rule_sets_share_compiled_patterns() {
        let a = ContentRules::default_rules();
        let b = ContentRules::default_rules();
        for (x, y) in a.rules.iter().zip(&b.rules) {
            assert!(std::ptr::eq(x.regex, y.regex));
        }
    }

    #[test]
    fn carryover_halves_each_half_life() {
        let hl = Duration::from_secs(3600);
        assert_eq!(carryover(0.8, chrono::Duration::zero(), hl), 0.8);
        let half = carryover(0.8, chrono::Duration::seconds(3600), hl);
        assert!((half - 0.4).abs() < 1e-9);
    }

    #[test]
    fn aggregate_is_weighted_mean() {
        let w = SignalWeights::default();
        let scores = SignalScores {
            latency: 1.0,
            ..Default::default()
        };
        assert!((scores.aggregate(&w) - w.latency / w.total()).abs() < 1e-9);
        assert_eq!(SignalScores::default().aggregate(&w), 0.0);
    }
}
