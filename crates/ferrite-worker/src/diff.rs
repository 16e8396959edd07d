use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal { old: usize, len: usize },
    Delete { old: usize, len: usize },
    Insert { old: usize, new: usize, len: usize },
}

struct OpCollector {
    ops: Vec<Op>,
}

impl diffs::Diff for OpCollector {
    type Error = std::convert::Infallible;

    fn equal(&mut self, old: usize, _new: usize, len: usize) -> Result<(), Self::Error> {
        self.ops.push(Op::Equal { old, len });
        Ok(())
    }

    fn delete(&mut self, old: usize, len: usize, _new: usize) -> Result<(), Self::Error> {
        self.ops.push(Op::Delete { old, len });
        Ok(())
    }

    fn insert(&mut self, old: usize, new: usize, new_len: usize) -> Result<(), Self::Error> {
        self.ops.push(Op::Insert {
            old,
            new,
            len: new_len,
        });
        Ok(())
    }
}

const CONTEXT: usize = 3;

#[derive(Debug)]
struct HunkLine {
    prefix: char,
    text: String,
}

/// Content fingerprint of a diff: SHA-256 hex over the exact diff bytes.
pub fn patch_id(diff_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(diff_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Unified diff between two texts with standard `a/` `b/` headers and
/// 3-line context hunks. Identical inputs produce an empty string.
pub fn build_unified_diff(old_text: &str, new_text: &str, path: &str) -> String {
    if old_text == new_text {
        return String::new();
    }
    let old_lines: Vec<&str> = old_text.lines().collect();
    let new_lines: Vec<&str> = new_text.lines().collect();
    let mut collector = OpCollector { ops: Vec::new() };
    let _ = diffs::myers::diff(
        &mut collector,
        &old_lines,
        0,
        old_lines.len(),
        &new_lines,
        0,
        new_lines.len(),
    );

    // Expand ops into a flat annotated line sequence
    let mut annotated: Vec<(char, usize, String)> = Vec::new(); // (prefix, old_line_no, text)
    for op in &collector.ops {
        match *op {
            Op::Equal { old, len } => {
                for i in 0..len {
                    annotated.push((' ', old + i, old_lines[old + i].to_string()));
                }
            }
            Op::Delete { old, len } => {
                for i in 0..len {
                    annotated.push(('-', old + i, old_lines[old + i].to_string()));
                }
            }
            Op::Insert { old, new, len } => {
                for i in 0..len {
                    annotated.push(('+', old, new_lines[new + i].to_string()));
                }
            }
        }
    }

    // Group changes into hunks with CONTEXT lines around them
    let change_indices: Vec<usize> = annotated
        .iter()
        .enumerate()
        .filter(|(_, (prefix, _, _))| *prefix != ' ')
        .map(|(i, _)| i)
        .collect();
    if change_indices.is_empty() {
        return String::new();
    }

    let mut hunk_ranges: Vec<(usize, usize)> = Vec::new();
    let mut start = change_indices[0].saturating_sub(CONTEXT);
    let mut end = (change_indices[0] + CONTEXT + 1).min(annotated.len());
    for &idx in &change_indices[1..] {
        let lo = idx.saturating_sub(CONTEXT);
        let hi = (idx + CONTEXT + 1).min(annotated.len());
        if lo <= end {
            end = hi;
        } else {
            hunk_ranges.push((start, end));
            start = lo;
            end = hi;
        }
    }
    hunk_ranges.push((start, end));

    let mut out = format!("--- a/{path}\n+++ b/{path}\n");
    let mut old_to_new_offset: i64 = 0;
    for (lo, hi) in hunk_ranges {
        let lines: Vec<HunkLine> = annotated[lo..hi]
            .iter()
            .map(|(prefix, _, text)| HunkLine {
                prefix: *prefix,
                text: text.clone(),
            })
            .collect();
        let old_count = lines.iter().filter(|l| l.prefix != '+').count();
        let new_count = lines.iter().filter(|l| l.prefix != '-').count();
        let old_start = annotated[lo..hi]
            .iter()
            .find(|(prefix, _, _)| *prefix != '+')
            .map(|(_, old_no, _)| old_no + 1)
            .unwrap_or(1);
        let new_start = (old_start as i64 + old_to_new_offset).max(1) as usize;
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            if old_count == 0 { old_start.saturating_sub(1) } else { old_start },
            old_count,
            if new_count == 0 { new_start.saturating_sub(1) } else { new_start },
            new_count,
        ));
        for line in &lines {
            out.push_str(&format!("{}{}\n", line.prefix, line.text));
        }
        old_to_new_offset += new_count as i64 - old_count as i64;
    }
    out
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("malformed diff: {0}")]
    Malformed(String),
    #[error("diff does not apply: {0}")]
    Mismatch(String),
}

/// Apply a unified diff produced by `build_unified_diff` to the original
/// text. Context and deletion lines are verified against the original.
pub fn apply_unified_diff(original: &str, diff_text: &str) -> Result<String, ApplyError> {
    let original_lines: Vec<&str> = original.lines().collect();
    let mut output: Vec<String> = Vec::new();
    let mut cursor = 0usize; // index into original_lines

    let mut lines = diff_text.lines().peekable();
    // Skip headers
    while let Some(line) = lines.peek() {
        if line.starts_with("--- ") || line.starts_with("+++ ") {
            lines.next();
        } else {
            break;
        }
    }

    while let Some(line) = lines.next() {
        if line.starts_with("@@") {
            let header = line
                .trim_start_matches("@@")
                .trim_end_matches("@@")
                .trim();
            let old_part = header
                .split_whitespace()
                .next()
                .and_then(|p| p.strip_prefix('-'))
                .ok_or_else(|| ApplyError::Malformed(format!("bad hunk header: {line}")))?;
            let old_start: usize = old_part
                .split(',')
                .next()
                .unwrap_or("1")
                .parse()
                .map_err(|_| ApplyError::Malformed(format!("bad hunk header: {line}")))?;
            let hunk_old_index = old_start.saturating_sub(1);
            if hunk_old_index < cursor {
                return Err(ApplyError::Malformed("hunks out of order".to_string()));
            }
            // Copy untouched lines up to the hunk
            while cursor < hunk_old_index && cursor < original_lines.len() {
                output.push(original_lines[cursor].to_string());
                cursor += 1;
            }
            continue;
        }
        match line.chars().next() {
            Some(' ') => {
                let expected = &line[1..];
                let actual = original_lines.get(cursor).copied().ok_or_else(|| {
                    ApplyError::Mismatch(format!("context past end of file: {expected}"))
                })?;
                if actual != expected {
                    return Err(ApplyError::Mismatch(format!(
                        "context mismatch at line {}: expected {expected:?}, found {actual:?}",
                        cursor + 1
                    )));
                }
                output.push(actual.to_string());
                cursor += 1;
            }
            Some('-') => {
                let expected = &line[1..];
                let actual = original_lines.get(cursor).copied().ok_or_else(|| {
                    ApplyError::Mismatch(format!("deletion past end of file: {expected}"))
                })?;
                if actual != expected {
                    return Err(ApplyError::Mismatch(format!(
                        "deletion mismatch at line {}: expected {expected:?}, found {actual:?}",
                        cursor + 1
                    )));
                }
                cursor += 1;
            }
            Some('+') => {
                output.push(line[1..].to_string());
            }
            Some('\\') => {} // "\ No newline at end of file"
            None => output.push(String::new()),
            Some(other) => {
                return Err(ApplyError::Malformed(format!(
                    "unexpected diff line prefix {other:?}"
                )));
            }
        }
    }
    // Copy the tail
    while cursor < original_lines.len() {
        output.push(original_lines[cursor].to_string());
        cursor += 1;
    }

    let mut result = output.join("\n");
    if !result.is_empty() {
        result.push('\n');
    }
    Ok(result)
}
