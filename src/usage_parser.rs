//! Scraper for the portal's water usage page.
//!
//! The page markup is not under our control, so extraction works on the
//! page's plain text with a small set of label rules evaluated in priority
//! order. A rule that finds nothing simply falls through; parsing never
//! fails, absent values stay `None`.

/// Shape of the value captured after a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extract {
    /// First run of `[0-9,.]` containing a digit, non-digits before it skipped.
    Number,
    /// `[A-Za-z0-9-]+` after any mix of `:`, `#` and whitespace.
    Identifier,
}

/// One label-driven extraction rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelRule {
    /// Words of the label; any amount of whitespace may separate them.
    pub label: &'static str,
    /// Characters after the label start that may hold the value; `None` means unbounded.
    pub window: Option<usize>,
    pub case_insensitive: bool,
    pub extract: Extract,
}

const CURRENT_READING_WINDOW: usize = 200;

const fn current_rule(label: &'static str) -> LabelRule {
    LabelRule {
        label,
        window: Some(CURRENT_READING_WINDOW),
        case_insensitive: false,
        extract: Extract::Number,
    }
}

pub const CURRENT_READING_RULES: &[LabelRule] = &[
    current_rule("Total"),
    current_rule("Reading"),
    current_rule("Current"),
    current_rule("Meter"),
];

pub const DAILY_USAGE_RULES: &[LabelRule] = &[LabelRule {
    label: "Last 24 Hours",
    window: None,
    case_insensitive: true,
    extract: Extract::Number,
}];

pub const MONTHLY_USAGE_RULES: &[LabelRule] = &[LabelRule {
    label: "This Month",
    window: None,
    case_insensitive: true,
    extract: Extract::Number,
}];

pub const ACCOUNT_RULES: &[LabelRule] = &[LabelRule {
    label: "Account",
    window: None,
    case_insensitive: true,
    extract: Extract::Identifier,
}];

/// Best-effort readings scraped from one usage page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSnapshot {
    pub current_reading: Option<f64>,
    pub daily_usage: Option<f64>,
    pub monthly_usage: Option<f64>,
    pub account: Option<String>,
}

impl UsageSnapshot {
    pub fn is_empty(&self) -> bool {
        self.current_reading.is_none()
            && self.daily_usage.is_none()
            && self.monthly_usage.is_none()
            && self.account.is_none()
    }
}

/// Parses the usage page HTML.
pub fn parse_usage(html: &str) -> UsageSnapshot {
    let text = html_to_text(html);

    let current_reading = apply_rules(&text, CURRENT_READING_RULES)
        .and_then(|raw| parse_number(&raw))
        .or_else(|| largest_number(&text));

    UsageSnapshot {
        current_reading,
        daily_usage: apply_rules(&text, DAILY_USAGE_RULES).and_then(|raw| parse_number(&raw)),
        monthly_usage: apply_rules(&text, MONTHLY_USAGE_RULES).and_then(|raw| parse_number(&raw)),
        account: apply_rules(&text, ACCOUNT_RULES),
    }
}

/// Evaluates `rules` in order and returns the first capture whose value is usable.
///
/// Number captures that do not parse fall through to the next rule.
pub fn apply_rules(text: &str, rules: &[LabelRule]) -> Option<String> {
    rules.iter().find_map(|rule| {
        let captured = apply_rule(text, rule)?;
        match rule.extract {
            Extract::Number => parse_number(&captured).map(|_| captured),
            Extract::Identifier => Some(captured),
        }
    })
}

/// Applies a single rule.
///
/// Windowed rules only look at the first occurrence of their label. Rules
/// without a window move on to later occurrences until one yields a capture.
pub fn apply_rule(text: &str, rule: &LabelRule) -> Option<String> {
    let mut from = 0;
    while let Some((start, end)) = find_label(text, rule.label, rule.case_insensitive, from) {
        if let Some(captured) = capture_after(text, rule, start, end) {
            return Some(captured);
        }
        if rule.window.is_some() {
            return None;
        }
        from = end;
    }
    None
}

fn capture_after(text: &str, rule: &LabelRule, start: usize, end: usize) -> Option<String> {
    let limit = match rule.window {
        Some(window) => text[start..]
            .char_indices()
            .nth(window)
            .map(|(offset, _)| start + offset)
            .unwrap_or(text.len()),
        None => text.len(),
    };
    if end > limit {
        return None;
    }
    let tail = &text[end..limit];

    match rule.extract {
        Extract::Number => numeric_tokens(tail).next().map(str::to_string),
        Extract::Identifier => {
            let rest = tail.trim_start_matches(|c: char| c == ':' || c == '#' || c.is_whitespace());
            let token: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
                .collect();
            (!token.is_empty()).then_some(token)
        }
    }
}

/// Finds the first occurrence of `label` at or after byte `from`, allowing
/// any whitespace (or none) between its words. Returns the byte range of the
/// match.
fn find_label(text: &str, label: &str, case_insensitive: bool, from: usize) -> Option<(usize, usize)> {
    let words: Vec<&[u8]> = label.split_whitespace().map(str::as_bytes).collect();
    let first = *words.first()?;
    let bytes = text.as_bytes();

    let eq = |a: &[u8], b: &[u8]| {
        if case_insensitive {
            a.eq_ignore_ascii_case(b)
        } else {
            a == b
        }
    };

    'candidates: for start in from..bytes.len() {
        if start + first.len() > bytes.len() || !eq(&bytes[start..start + first.len()], first) {
            continue;
        }
        let mut pos = start + first.len();
        for word in &words[1..] {
            while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            if pos + word.len() > bytes.len() || !eq(&bytes[pos..pos + word.len()], word) {
                continue 'candidates;
            }
            pos += word.len();
        }
        return Some((start, pos));
    }
    None
}

/// Runs of `[0-9,.]` that contain at least one digit, in order of appearance.
pub fn numeric_tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_ascii_digit() || c == ',' || c == '.'))
        .filter(|token| token.bytes().any(|b| b.is_ascii_digit()))
}

/// Parses a numeric token, ignoring thousands separators.
pub fn parse_number(token: &str) -> Option<f64> {
    token
        .replace(',', "")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

fn largest_number(text: &str) -> Option<f64> {
    numeric_tokens(text)
        .filter_map(parse_number)
        .fold(None, |best: Option<f64>, v| {
            Some(best.map_or(v, |b| b.max(v)))
        })
}

/// Reduces HTML to whitespace-separated visible text.
///
/// Tags are removed, `<script>` and `<style>` bodies dropped, common
/// entities decoded and runs of whitespace collapsed.
pub fn html_to_text(html: &str) -> String {
    let mut fragments: Vec<String> = Vec::new();
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        push_fragment(&mut fragments, &rest[..open]);
        let after = &rest[open..];
        let Some(close) = after.find('>') else {
            rest = "";
            break;
        };
        let tag = after[1..close].trim().to_ascii_lowercase();
        rest = &after[close + 1..];

        for skipped in ["script", "style"] {
            if tag == skipped || tag.starts_with(&format!("{skipped} ")) {
                let end_tag = format!("</{skipped}");
                rest = match find_ignore_ascii_case(rest, &end_tag) {
                    Some(end) => {
                        let tail = &rest[end..];
                        tail.find('>').map(|gt| &tail[gt + 1..]).unwrap_or("")
                    }
                    None => "",
                };
            }
        }
    }
    push_fragment(&mut fragments, rest);

    fragments.join(" ")
}

fn push_fragment(fragments: &mut Vec<String>, raw: &str) {
    let decoded = decode_entities(raw);
    let collapsed = decoded.split_whitespace().collect::<Vec<_>>().join(" ");
    if !collapsed.is_empty() {
        fragments.push(collapsed);
    }
}

fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    let hay = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.len() > hay.len() {
        return None;
    }
    (0..=hay.len() - needle.len()).find(|&i| hay[i..i + needle.len()].eq_ignore_ascii_case(needle))
}

fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp..];
        let decoded = after.find(';').filter(|&semi| semi <= 10).and_then(|semi| {
            let entity = &after[1..semi];
            let ch = match entity {
                "nbsp" => Some(' '),
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix('#')
                    .and_then(|code| match code.strip_prefix(['x', 'X']) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => code.parse::<u32>().ok(),
                    })
                    .and_then(char::from_u32),
            };
            ch.map(|c| (c, semi))
        });
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &after[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &after[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
