use std::collections::HashSet;

use crate::engine::ProbeResult;

pub const DEFAULT_SHINGLE_SIZE: usize = 5;

/// Optional inclusive bounds on the response size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SizeRange {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl SizeRange {
    pub fn is_bounded(&self) -> bool {
        self.min.is_some() || self.max.is_some()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MatcherOptions {
    pub statuses: Vec<u16>,
    pub size: SizeRange,
    pub baseline_body: Vec<u8>,
    pub similarity_threshold: f64,
    pub shingle_size: usize,
}

/// Evaluates probe results against the configured match rules.
#[derive(Clone, Debug)]
pub struct Matcher {
    statuses: Option<HashSet<u16>>,
    size: SizeRange,
    baseline: Option<HashSet<String>>,
    threshold: f64,
    shingle_size: usize,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MatchOutcome {
    pub matched: bool,
    pub similarity: Option<f64>,
}

impl Matcher {
    pub fn new(opts: MatcherOptions) -> Self {
        let statuses = if opts.statuses.is_empty() {
            None
        } else {
            Some(opts.statuses.iter().copied().collect())
        };

        let shingle_size = if opts.shingle_size == 0 {
            DEFAULT_SHINGLE_SIZE
        } else {
            opts.shingle_size
        };

        let threshold = opts.similarity_threshold.min(1.0);
        let baseline = if threshold > 0.0 && !opts.baseline_body.is_empty() {
            let shingles = build_shingles(&opts.baseline_body, shingle_size);
            if shingles.is_empty() {
                None
            } else {
                Some(shingles)
            }
        } else {
            None
        };

        Self {
            statuses,
            size: opts.size,
            baseline,
            threshold,
            shingle_size,
        }
    }

    /// True when a baseline body was captured and produced a usable
    /// fingerprint.
    pub fn has_baseline(&self) -> bool {
        self.baseline.is_some()
    }

    pub fn matches(&self, res: &ProbeResult) -> bool {
        self.evaluate(res).matched
    }

    /// Applies the rules in order: errors always match so they stay visible,
    /// then the status allow-list, the size range, and finally baseline
    /// similarity.
    pub fn evaluate(&self, res: &ProbeResult) -> MatchOutcome {
        let mut outcome = MatchOutcome {
            matched: true,
            similarity: None,
        };

        if res.error.is_some() {
            return outcome;
        }

        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&res.status) {
                outcome.matched = false;
                return outcome;
            }
        }

        if self.size.is_bounded() {
            let size = res.content_length;
            if size < 0 {
                outcome.matched = false;
                return outcome;
            }
            if let Some(min) = self.size.min {
                if size < min {
                    outcome.matched = false;
                    return outcome;
                }
            }
            if let Some(max) = self.size.max {
                if size > max {
                    outcome.matched = false;
                    return outcome;
                }
            }
        }

        if let Some(baseline) = &self.baseline {
            if res.body.is_empty() {
                return outcome;
            }
            let shingles = build_shingles(&res.body, self.shingle_size);
            if shingles.is_empty() {
                return outcome;
            }
            let similarity = jaccard(baseline, &shingles);
            outcome.similarity = Some(similarity);
            if similarity >= self.threshold {
                outcome.matched = false;
            }
        }

        outcome
    }
}

/// Builds the set of space-joined word n-gram shingles for a body. The window
/// shrinks to the token count when the body is shorter than `size` tokens.
pub fn build_shingles(body: &[u8], size: usize) -> HashSet<String> {
    let size = size.max(1);
    let tokens = tokenize(body);
    if tokens.is_empty() {
        return HashSet::new();
    }
    let size = size.min(tokens.len());

    let mut shingles = HashSet::with_capacity(tokens.len());
    for window in tokens.windows(size) {
        shingles.insert(window.join(" "));
    }
    shingles
}

fn tokenize(body: &[u8]) -> Vec<String> {
    if body.is_empty() {
        return Vec::new();
    }
    let text = String::from_utf8_lossy(body).to_lowercase();
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = b.iter().filter(|s| a.contains(*s)).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Parses a comma-separated list of HTTP status codes, deduplicating while
/// preserving order. An empty input yields an empty list (no filtering).
pub fn parse_status_list(input: &str) -> Result<Vec<u16>, String> {
    let raw = input.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    let mut codes: Vec<u16> = Vec::new();
    let mut seen: HashSet<u16> = HashSet::new();
    for part in raw.split(',') {
        let item = part.trim();
        if item.is_empty() {
            return Err(format!("empty status code in '{raw}'"));
        }
        let code: u16 = item
            .parse()
            .map_err(|_| format!("invalid status code '{item}'"))?;
        if !(100..=999).contains(&code) {
            return Err(format!("status code out of range: {code}"));
        }
        if seen.insert(code) {
            codes.push(code);
        }
    }
    Ok(codes)
}

/// Parses a size range of the form "min-max"; either bound may be omitted
/// ("100-" or "-200"). An empty input yields an unbounded range.
pub fn parse_size_range(input: &str) -> Result<SizeRange, String> {
    let raw = input.trim();
    if raw.is_empty() {
        return Ok(SizeRange::default());
    }

    if raw.matches('-').count() != 1 {
        return Err(format!("invalid size range '{raw}'"));
    }
    let (min_raw, max_raw) = raw.split_once('-').unwrap_or(("", ""));

    let mut range = SizeRange::default();
    let min_raw = min_raw.trim();
    if !min_raw.is_empty() {
        let min: i64 = min_raw
            .parse()
            .map_err(|_| format!("invalid minimum size '{min_raw}'"))?;
        if min < 0 {
            return Err(format!("minimum size must be non-negative: {min}"));
        }
        range.min = Some(min);
    }
    let max_raw = max_raw.trim();
    if !max_raw.is_empty() {
        let max: i64 = max_raw
            .parse()
            .map_err(|_| format!("invalid maximum size '{max_raw}'"))?;
        if max < 0 {
            return Err(format!("maximum size must be non-negative: {max}"));
        }
        range.max = Some(max);
    }

    if let (Some(min), Some(max)) = (range.min, range.max) {
        if min > max {
            return Err(format!("minimum size {min} greater than maximum {max}"));
        }
    }

    Ok(range)
}
