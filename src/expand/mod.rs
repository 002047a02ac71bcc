pub const DOUBLE_PLACEHOLDER: &str = "{{FUZZ}}";
pub const PLACEHOLDER: &str = "FUZZ";
pub const FORMAT_PLACEHOLDER: &str = "%s";

/// Expands brace `{a,b,c}` and integer range `[m-n]` constructs in a wordlist
/// line. The left-most construct is expanded first and expansion repeats until
/// none remain. Unterminated or non-integer constructs are kept as literals.
pub fn expand_payload(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    expand_into(line, 0, &mut out);
    out
}

fn expand_into(value: &str, from: usize, out: &mut Vec<String>) {
    match find_construct(value, from) {
        None => out.push(value.to_string()),
        Some(c) => {
            for opt in &c.options {
                let mut next = String::with_capacity(value.len() + opt.len());
                next.push_str(&value[..c.start]);
                next.push_str(opt);
                next.push_str(&value[c.end..]);
                // replaced text is literal, keep scanning after it
                expand_into(&next, c.start + opt.len(), out);
            }
        }
    }
}

struct Construct {
    start: usize,
    end: usize,
    options: Vec<String>,
}

fn find_construct(value: &str, from: usize) -> Option<Construct> {
    let mut search = from;
    while search < value.len() {
        let open = match value[search..].find(|c| c == '{' || c == '[') {
            Some(rel) => search + rel,
            None => return None,
        };

        if value[open..].starts_with('{') {
            if let Some(rel) = value[open + 1..].find('}') {
                let close = open + 1 + rel;
                let options = value[open + 1..close]
                    .split(',')
                    .map(|o| o.trim().to_string())
                    .collect();
                return Some(Construct {
                    start: open,
                    end: close + 1,
                    options,
                });
            }
        } else if let Some(rel) = value[open + 1..].find(']') {
            let close = open + 1 + rel;
            if let Some(options) = range_options(&value[open + 1..close]) {
                return Some(Construct {
                    start: open,
                    end: close + 1,
                    options,
                });
            }
        }

        // unterminated or non-expandable, skip past the opener
        search = open + 1;
    }
    None
}

fn range_options(inner: &str) -> Option<Vec<String>> {
    let (start_raw, end_raw) = inner.split_once('-')?;
    let start_raw = start_raw.trim();
    let end_raw = end_raw.trim();
    let start: i64 = start_raw.parse().ok()?;
    let end: i64 = end_raw.parse().ok()?;

    let width = if start_raw.len() == end_raw.len()
        && (start_raw.starts_with('0') || end_raw.starts_with('0'))
    {
        start_raw.len()
    } else {
        0
    };

    let render = |n: i64| {
        if width > 0 {
            format!("{n:0width$}")
        } else {
            n.to_string()
        }
    };

    let mut options = Vec::new();
    if start <= end {
        for n in start..=end {
            options.push(render(n));
        }
    } else {
        let mut n = start;
        while n >= end {
            options.push(render(n));
            n -= 1;
        }
    }
    Some(options)
}

/// Substitutes the payload into the target template. All occurrences of every
/// recognized placeholder are replaced in one pass; when the template carries
/// no placeholder the payload is appended to the path.
pub fn expand_target(template: &str, payload: &str) -> String {
    let has_double = template.contains(DOUBLE_PLACEHOLDER);
    let without_double = if has_double {
        template.replace(DOUBLE_PLACEHOLDER, "")
    } else {
        template.to_string()
    };
    let has_plain = without_double.contains(PLACEHOLDER);
    let has_format = template.contains(FORMAT_PLACEHOLDER);

    let mut expanded = template.to_string();
    if has_double {
        expanded = expanded.replace(DOUBLE_PLACEHOLDER, payload);
    }
    if has_plain {
        expanded = expanded.replace(PLACEHOLDER, payload);
    }
    if has_format {
        expanded = expanded.replace(FORMAT_PLACEHOLDER, payload);
    }

    if has_double || has_plain || has_format {
        return expanded;
    }

    if template.ends_with('/') {
        format!("{template}{payload}")
    } else {
        format!("{template}/{payload}")
    }
}
