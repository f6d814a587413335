//! Question records, server metadata, and the type classifier.
//!
//! The backend usually declares a question's interaction type in structured
//! metadata; when it does not, a best-effort text classifier fills the gap.
//! The classifier rules run in a fixed, documented order and are kept
//! independent of the streaming layer so they can be tested on plain
//! strings.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Interaction type of a questionnaire item.
///
/// Serialized with the backend's wire names (`open` / `mc` / `likert`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuestionType {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "mc")]
    SingleChoice,
    #[serde(rename = "likert")]
    Likert,
}

/// Server-declared metadata attached to a question.
///
/// All fields are optional; unknown `type` values fall through to the text
/// classifier instead of failing the whole payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuestionMeta {
    #[serde(rename = "type", default)]
    pub question_type: Option<String>,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub likert_option: Option<Vec<String>>,
    #[serde(default)]
    pub likert_range: Option<String>,
}

/// A normalized question ready for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionRecord {
    pub text: String,
    pub question_type: QuestionType,
    /// Single-choice only; the index is the selectable choice identity.
    pub options: Vec<String>,
    pub likert_options: Option<Vec<String>>,
    pub likert_range: Option<String>,
    /// True while text is still arriving; answerable only once false.
    pub streaming: bool,
}

impl QuestionRecord {
    /// A placeholder for a question whose text is still streaming in.
    pub fn streaming_placeholder() -> Self {
        Self {
            text: String::new(),
            question_type: QuestionType::Open,
            options: Vec::new(),
            likert_options: None,
            likert_range: None,
            streaming: true,
        }
    }

    pub fn is_answerable(&self) -> bool {
        !self.streaming
    }
}

/// One accepted answer, immutable once appended to the response log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub question: String,
    pub answer: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    /// Likert rating or chosen option index; `None` for open answers.
    pub value: Option<i64>,
}

static LIKERT_SCALE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)1\s*到\s*5|1-5|1~5|1～5|likert|1[^\d]*5").expect("valid regex"));

static CHUNK_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\n;；、/]|\s\|\s").expect("valid regex"));

static OPTION_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\r?\n|;|；|、|\s+or\s+|\|").expect("valid regex"));

static OPTION_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{1,3}\s*[).．。:：、\-－.]\s*").expect("valid regex"));

/// Classifies raw question text when no explicit metadata type is present.
///
/// Rule order: a 1-to-5 scale pattern means Likert; otherwise 2–10 chunks
/// separated by option markers mean single-choice; anything else is open.
pub fn detect_question_type(text: &str) -> QuestionType {
    if text.trim().is_empty() {
        return QuestionType::Open;
    }
    if LIKERT_SCALE.is_match(text) {
        return QuestionType::Likert;
    }
    let chunks = CHUNK_SEPARATORS
        .split(text)
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .count();
    if (2..=10).contains(&chunks) {
        QuestionType::SingleChoice
    } else {
        QuestionType::Open
    }
}

/// Strips a leading identifier marker ("A.", "2)", "c：") and surrounding
/// quotes from one option candidate.
fn clean_option(part: &str) -> String {
    let trimmed = part.trim();
    let without_marker = OPTION_MARKER.replace(trimmed, "");
    without_marker
        .trim_matches(|c| matches!(c, '\'' | '"' | '“' | '”'))
        .trim()
        .to_string()
}

/// Cuts the question stem off the first option candidate, keeping whatever
/// follows its last terminal punctuation.
fn strip_question_stem(first: &str) -> Option<String> {
    let is_terminal = |c: char| matches!(c, '？' | '?' | '：' | ':' | '。' | '.');
    let stem_like = first.chars().count() > 80
        || first.chars().any(|c| matches!(c, '？' | '：' | ':' | '。'));
    if !stem_like {
        return Some(first.to_string());
    }
    if let Some((pos, c)) = first.char_indices().rev().find(|(_, c)| is_terminal(*c)) {
        let candidate = first[pos + c.len_utf8()..].trim();
        if !candidate.is_empty() {
            return Some(candidate.to_string());
        }
    }
    None
}

/// Extracts ordered option strings from raw question text.
///
/// A `/`-separated list is preferred; newline-, semicolon-, "or"- and
/// pipe-separated lists are the fallback. Fewer than two surviving options
/// means the text carries no usable choice list.
pub fn extract_options(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut parts: Vec<String> = text
        .split('/')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect();
    if parts.len() < 2 {
        parts = OPTION_SEPARATORS
            .split(text)
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();
    }
    if parts.len() < 2 {
        return Vec::new();
    }

    // The first segment often still carries the question stem.
    match strip_question_stem(&parts[0]) {
        Some(first) => parts[0] = first,
        None => {
            parts.remove(0);
        }
    }

    let options: Vec<String> = parts
        .iter()
        .map(|part| clean_option(part))
        .filter(|option| !option.is_empty())
        .collect();
    if options.len() >= 2 { options } else { Vec::new() }
}

/// Frequency labels for a bare 1–5 scale.
const LIKERT_BASE_LABELS: [&str; 5] = ["從不", "偶爾", "有時", "經常", "非常常"];

/// Composes the textual descriptor for a Likert rating.
///
/// Server-declared labels win; otherwise the descriptor is derived from the
/// question's vocabulary (stress, risk appetite, or agreement phrasing),
/// falling back to a plain frequency label.
pub fn likert_descriptor(question: &str, value: u8, declared: Option<&[String]>) -> String {
    let index = usize::from(value.clamp(1, 5)) - 1;
    if let Some(labels) = declared {
        if let Some(label) = labels.get(index) {
            if !label.is_empty() {
                return label.clone();
            }
        }
    }

    let base = LIKERT_BASE_LABELS[index];
    let stress = ["壓力", "焦慮", "緊張", "擔心", "煩躁"];
    let risk = ["風險", "風險承受", "冒險", "風險偏好"];
    let agreement = ["認同", "同意", "贊同"];

    if stress.iter().any(|k| question.contains(k)) {
        let suffixes = [
            "不會感到壓力",
            "偶爾感到壓力",
            "有時感到壓力",
            "經常感到壓力",
            "非常常感到壓力",
        ];
        return suffixes[index].to_string();
    }
    if risk.iter().any(|k| question.contains(k)) {
        let suffixes = ["非常保守", "偏保守", "中性", "偏冒險", "非常冒險"];
        return format!("{base}（{}）", suffixes[index]);
    }
    if agreement.iter().any(|k| question.contains(k)) {
        let suffixes = ["非常不認同", "不認同", "中立/有保留", "認同", "非常認同"];
        return format!("{base}（{}）", suffixes[index]);
    }
    base.to_string()
}

/// Builds a [`QuestionRecord`] from final text plus optional metadata.
///
/// Explicit metadata always wins; inference from the arrays that are
/// present comes next; the text classifier is the last resort.
pub fn normalize_question(text: &str, meta: Option<&QuestionMeta>) -> QuestionRecord {
    let text = text.trim().to_string();

    if let Some(meta) = meta {
        match meta.question_type.as_deref() {
            Some("mc") => {
                let options = meta.options.clone().unwrap_or_default();
                return QuestionRecord {
                    text,
                    question_type: QuestionType::SingleChoice,
                    options,
                    likert_options: None,
                    likert_range: None,
                    streaming: false,
                };
            }
            Some("likert") => {
                return QuestionRecord {
                    text,
                    question_type: QuestionType::Likert,
                    options: Vec::new(),
                    likert_options: meta.likert_option.clone(),
                    likert_range: meta.likert_range.clone(),
                    streaming: false,
                };
            }
            Some("open") => {
                return QuestionRecord {
                    text,
                    question_type: QuestionType::Open,
                    options: Vec::new(),
                    likert_options: None,
                    likert_range: None,
                    streaming: false,
                };
            }
            _ => {}
        }

        // No explicit type: infer from whichever array is populated.
        if let Some(options) = meta.options.as_ref().filter(|o| o.len() >= 2) {
            return QuestionRecord {
                text,
                question_type: QuestionType::SingleChoice,
                options: options.clone(),
                likert_options: None,
                likert_range: None,
                streaming: false,
            };
        }
        if meta
            .likert_option
            .as_ref()
            .is_some_and(|labels| !labels.is_empty())
        {
            return QuestionRecord {
                text,
                question_type: QuestionType::Likert,
                options: Vec::new(),
                likert_options: meta.likert_option.clone(),
                likert_range: meta.likert_range.clone(),
                streaming: false,
            };
        }
    }

    match detect_question_type(&text) {
        QuestionType::SingleChoice => {
            let options = extract_options(&text);
            QuestionRecord {
                text,
                question_type: QuestionType::SingleChoice,
                options,
                likert_options: None,
                likert_range: None,
                streaming: false,
            }
        }
        QuestionType::Likert => QuestionRecord {
            text,
            question_type: QuestionType::Likert,
            options: Vec::new(),
            likert_options: None,
            likert_range: None,
            streaming: false,
        },
        QuestionType::Open => QuestionRecord {
            text,
            question_type: QuestionType::Open,
            options: Vec::new(),
            likert_options: None,
            likert_range: None,
            streaming: false,
        },
    }
}

/// Why a question was flagged as possibly malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncompleteReason {
    Empty,
    InsufficientOptions,
    TooShort,
    PlaceholderOptions,
    Truncated,
}

/// Tunable thresholds for the malformed-question advisory. The defaults are
/// empirical, not load-bearing.
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Minimum question length in characters before `TooShort` fires.
    pub min_length: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self { min_length: 8 }
    }
}

static PLACEHOLDER_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:選擇|選項)\s*[A-D]\b").expect("valid regex"));

static PLACEHOLDER_ALTERNATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-D]\s*/\s*[A-D]\b").expect("valid regex"));

/// Advisory check for generation defects in a question.
///
/// Never blocks progress: callers pair a flag with a regenerate affordance
/// and let the user decide.
pub fn question_health(
    record: &QuestionRecord,
    thresholds: &HealthThresholds,
) -> Option<IncompleteReason> {
    let trimmed = record.text.trim();
    if trimmed.is_empty() {
        return Some(IncompleteReason::Empty);
    }
    if record.question_type == QuestionType::SingleChoice && record.options.len() < 2 {
        return Some(IncompleteReason::InsufficientOptions);
    }
    if trimmed.chars().count() < thresholds.min_length {
        return Some(IncompleteReason::TooShort);
    }
    if PLACEHOLDER_TOKEN.is_match(trimmed) || PLACEHOLDER_ALTERNATION.is_match(trimmed) {
        return Some(IncompleteReason::PlaceholderOptions);
    }
    if trimmed.ends_with('…') || trimmed.ends_with("..") {
        return Some(IncompleteReason::Truncated);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_meta_type_beats_heuristics() {
        // The text alone would classify as single-choice.
        let meta = QuestionMeta {
            question_type: Some("open".into()),
            ..Default::default()
        };
        let record = normalize_question("觀望 / 加碼 / 賣出", Some(&meta));
        assert_eq!(record.question_type, QuestionType::Open);
        assert!(record.options.is_empty());
    }

    #[test]
    fn meta_options_without_type_infer_single_choice() {
        let meta = QuestionMeta {
            options: Some(vec!["Buy".into(), "Hold".into(), "Sell".into()]),
            ..Default::default()
        };
        let record = normalize_question("市場大跌時您會怎麼做？", Some(&meta));
        assert_eq!(record.question_type, QuestionType::SingleChoice);
        assert_eq!(record.options, ["Buy", "Hold", "Sell"]);
    }

    #[test]
    fn meta_likert_labels_without_type_infer_likert() {
        let meta = QuestionMeta {
            likert_option: Some(vec!["從不".into(), "偶爾".into()]),
            likert_range: Some("1-5".into()),
            ..Default::default()
        };
        let record = normalize_question("您多常檢查持股？", Some(&meta));
        assert_eq!(record.question_type, QuestionType::Likert);
        assert_eq!(record.likert_range.as_deref(), Some("1-5"));
    }

    #[test]
    fn unknown_meta_type_falls_through_to_classifier() {
        let meta = QuestionMeta {
            question_type: Some("slider".into()),
            ..Default::default()
        };
        let record = normalize_question("請以 1 到 5 評分您的焦慮程度", Some(&meta));
        assert_eq!(record.question_type, QuestionType::Likert);
    }

    #[test]
    fn scale_phrases_classify_as_likert() {
        for text in [
            "請以 1 到 5 表示您的認同程度",
            "rate from 1-5",
            "1~5 分，您會給幾分？",
        ] {
            assert_eq!(detect_question_type(text), QuestionType::Likert, "{text}");
        }
    }

    #[test]
    fn slash_separated_chunks_classify_as_single_choice() {
        assert_eq!(
            detect_question_type("加碼買入 / 繼續觀望 / 立刻賣出"),
            QuestionType::SingleChoice
        );
        assert_eq!(detect_question_type("您如何看待長期投資？"), QuestionType::Open);
    }

    #[test]
    fn options_are_extracted_in_order_with_markers_stripped() {
        let options = extract_options("A. 加碼買入 / B. 繼續觀望 / C. 立刻賣出");
        assert_eq!(options, ["加碼買入", "繼續觀望", "立刻賣出"]);
    }

    #[test]
    fn question_stem_is_cut_off_the_first_option() {
        let options = extract_options("市場大跌時您會怎麼做？加碼買入 / 繼續觀望 / 立刻賣出");
        assert_eq!(options, ["加碼買入", "繼續觀望", "立刻賣出"]);
    }

    #[test]
    fn newline_separated_options_fall_back() {
        let options = extract_options("1) 保守配置\n2) 平衡配置\n3) 積極配置");
        assert_eq!(options, ["保守配置", "平衡配置", "積極配置"]);
    }

    #[test]
    fn a_single_chunk_yields_no_options() {
        assert!(extract_options("您如何看待長期投資").is_empty());
        assert!(extract_options("").is_empty());
    }

    #[test]
    fn likert_descriptor_prefers_declared_labels() {
        let labels: Vec<String> = ["很少", "偶爾", "普通", "常常", "總是"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(likert_descriptor("任意題目", 4, Some(&labels)), "常常");
    }

    #[test]
    fn likert_descriptor_derives_from_vocabulary() {
        assert_eq!(
            likert_descriptor("投資虧損時您會感到壓力嗎？", 5, None),
            "非常常感到壓力"
        );
        assert_eq!(
            likert_descriptor("您的風險承受度如何？", 1, None),
            "從不（非常保守）"
        );
        assert_eq!(
            likert_descriptor("您是否認同逢低買入？", 3, None),
            "有時（中立/有保留）"
        );
        assert_eq!(likert_descriptor("您多常查看盤勢？", 2, None), "偶爾");
    }

    #[test]
    fn likert_descriptor_clamps_out_of_range_values() {
        assert_eq!(likert_descriptor("您多常查看盤勢？", 0, None), "從不");
        assert_eq!(likert_descriptor("您多常查看盤勢？", 9, None), "非常常");
    }

    #[test]
    fn health_flags_each_defect() {
        let thresholds = HealthThresholds::default();
        let open = |text: &str| QuestionRecord {
            text: text.into(),
            question_type: QuestionType::Open,
            options: Vec::new(),
            likert_options: None,
            likert_range: None,
            streaming: false,
        };

        assert_eq!(
            question_health(&open(""), &thresholds),
            Some(IncompleteReason::Empty)
        );
        assert_eq!(
            question_health(&open("太短了"), &thresholds),
            Some(IncompleteReason::TooShort)
        );
        assert_eq!(
            question_health(&open("請從下列選項 A 與選項 B 中挑選"), &thresholds),
            Some(IncompleteReason::PlaceholderOptions)
        );
        assert_eq!(
            question_health(&open("您會如何配置您的資產，例如…"), &thresholds),
            Some(IncompleteReason::Truncated)
        );

        let mut choice = open("市場大跌時您會怎麼做？");
        choice.question_type = QuestionType::SingleChoice;
        choice.options = vec!["觀望".into()];
        assert_eq!(
            question_health(&choice, &thresholds),
            Some(IncompleteReason::InsufficientOptions)
        );

        assert_eq!(question_health(&open("您如何看待長期投資策略？"), &thresholds), None);
    }

    #[test]
    fn thresholds_are_tunable() {
        let record = QuestionRecord {
            text: "短題目".into(),
            question_type: QuestionType::Open,
            options: Vec::new(),
            likert_options: None,
            likert_range: None,
            streaming: false,
        };
        let relaxed = HealthThresholds { min_length: 2 };
        assert_eq!(question_health(&record, &relaxed), None);
    }

    #[test]
    fn wire_names_round_trip() {
        let json = serde_json::to_string(&QuestionType::SingleChoice).unwrap();
        assert_eq!(json, "\"mc\"");
        let parsed: QuestionType = serde_json::from_str("\"likert\"").unwrap();
        assert_eq!(parsed, QuestionType::Likert);
    }

    #[test]
    fn response_record_serializes_open_value_as_null() {
        let record = ResponseRecord {
            question: "Q1?".into(),
            answer: "A".into(),
            question_type: QuestionType::Open,
            value: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "open");
        assert!(json["value"].is_null());
    }
}
