//! Two-pass approximate matching of wordlist entries against OCR output.
//!
//! A word hits a line when the best edit distance of the word against any
//! substring of the line, divided by the word length, is strictly below
//! the word's threshold. The first pass matches the text as recognized;
//! the second removes all spaces from both sides to compensate for OCR
//! token splitting, and its wins are scored at a reduced weight.

use crate::wordlist::Wordlist;

/// Which matching pass produced the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPass {
    /// Text matched as recognized.
    Verbatim,
    /// Matched only after removing spaces from word and line.
    Despaced,
}

/// Per-word hit count for the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordHit {
    pub word: String,
    pub hits: u32,
}

/// Result of matching one scanset's output against the wordlist.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub pass: MatchPass,
    pub count: u32,
    pub hits: Vec<WordHit>,
}

impl MatchOutcome {
    fn empty() -> Self {
        Self {
            pass: MatchPass::Verbatim,
            count: 0,
            hits: Vec::new(),
        }
    }
}

/// Matching knobs, lifted out of the scan config.
#[derive(Debug, Clone, Copy)]
pub struct MatcherOptions {
    pub strip_numbers: bool,
    pub unique_match: bool,
    pub required_count: u32,
}

/// Punctuation OCR engines commonly emit in place of letters.
const CONFUSABLES: &[(char, char)] = &[
    ('@', 'a'),
    ('$', 's'),
    ('|', 'l'),
    ('!', 'i'),
    ('(', 'c'),
    ('[', 'c'),
    ('+', 't'),
];

/// Lowercase and strip everything outside `[a-z0-9 ]`.
pub fn normalize_word(raw: &str, strip_numbers: bool) -> String {
    raw.chars()
        .flat_map(char::to_lowercase)
        .filter(|c| keep_char(*c, strip_numbers))
        .collect()
}

/// Like `normalize_word`, with confusable substitution applied first.
pub fn normalize_line(raw: &str, strip_numbers: bool) -> String {
    raw.chars()
        .map(|c| {
            CONFUSABLES
                .iter()
                .find(|(from, _)| *from == c)
                .map(|(_, to)| *to)
                .unwrap_or(c)
        })
        .flat_map(char::to_lowercase)
        .filter(|c| keep_char(*c, strip_numbers))
        .collect()
}

fn keep_char(c: char, strip_numbers: bool) -> bool {
    match c {
        'a'..='z' | ' ' => true,
        '0'..='9' => !strip_numbers,
        _ => false,
    }
}

/// Minimum edit distance of `needle` against any substring of `haystack`.
///
/// Semi-global alignment: the match may start and end anywhere in the
/// haystack at no cost, so a clean occurrence inside a longer line scores
/// zero. Inputs are normalized ASCII.
pub fn substring_distance(needle: &str, haystack: &str) -> u32 {
    let needle = needle.as_bytes();
    let haystack = haystack.as_bytes();
    if needle.is_empty() {
        return 0;
    }
    if haystack.is_empty() {
        return needle.len() as u32;
    }

    let mut prev: Vec<u32> = vec![0; haystack.len() + 1];
    let mut row: Vec<u32> = vec![0; haystack.len() + 1];

    for (i, &nc) in needle.iter().enumerate() {
        row[0] = (i + 1) as u32;
        for (j, &hc) in haystack.iter().enumerate() {
            let cost = u32::from(nc != hc);
            row[j + 1] = (prev[j] + cost)
                .min(prev[j + 1] + 1)
                .min(row[j] + 1);
        }
        std::mem::swap(&mut prev, &mut row);
    }

    prev.iter().copied().min().unwrap_or(needle.len() as u32)
}

fn strip_spaces(s: &str) -> String {
    s.chars().filter(|c| *c != ' ').collect()
}

fn run_pass(
    words: &[(String, String, f32)],
    lines: &[String],
    despaced: bool,
    unique_match: bool,
) -> (u32, Vec<WordHit>) {
    let mut total = 0u32;
    let mut hits = Vec::new();

    for (raw, normalized, threshold) in words {
        let word = if despaced {
            strip_spaces(normalized)
        } else {
            normalized.clone()
        };
        if word.is_empty() {
            continue;
        }
        let word_len = word.len() as f32;

        let mut word_hits = 0u32;
        for line in lines {
            let line = if despaced {
                strip_spaces(line)
            } else {
                line.clone()
            };
            if line.is_empty() {
                continue;
            }
            let ratio = substring_distance(&word, &line) as f32 / word_len;
            if ratio < *threshold {
                word_hits += 1;
                if unique_match {
                    break;
                }
            }
        }

        if word_hits > 0 {
            total += word_hits;
            hits.push(WordHit {
                word: raw.clone(),
                hits: word_hits,
            });
        }
    }

    (total, hits)
}

/// Match one scanset's output lines against the wordlist.
///
/// The verbatim pass short-circuits the despaced pass when it already
/// meets the required count; otherwise the larger count wins and ties go
/// to the verbatim pass.
pub fn match_lines(lines: &[String], wordlist: &Wordlist, opts: MatcherOptions) -> MatchOutcome {
    if wordlist.is_empty() || lines.is_empty() {
        return MatchOutcome::empty();
    }

    let words: Vec<(String, String, f32)> = wordlist
        .iter()
        .map(|(w, t)| (w.to_string(), normalize_word(w, opts.strip_numbers), t))
        .collect();
    let normalized_lines: Vec<String> = lines
        .iter()
        .map(|l| normalize_line(l, opts.strip_numbers))
        .collect();

    let (verbatim_count, verbatim_hits) =
        run_pass(&words, &normalized_lines, false, opts.unique_match);
    if verbatim_count >= opts.required_count {
        return MatchOutcome {
            pass: MatchPass::Verbatim,
            count: verbatim_count,
            hits: verbatim_hits,
        };
    }

    let (despaced_count, despaced_hits) =
        run_pass(&words, &normalized_lines, true, opts.unique_match);
    if despaced_count > verbatim_count {
        MatchOutcome {
            pass: MatchPass::Despaced,
            count: despaced_count,
            hits: despaced_hits,
        }
    } else {
        MatchOutcome {
            pass: MatchPass::Verbatim,
            count: verbatim_count,
            hits: verbatim_hits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> MatcherOptions {
        MatcherOptions {
            strip_numbers: false,
            unique_match: true,
            required_count: 2,
        }
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn distance_to_self_is_zero() {
        for word in ["viagra", "refinance now", "x"] {
            assert_eq!(substring_distance(word, word), 0);
        }
    }

    #[test]
    fn clean_substring_costs_nothing() {
        assert_eq!(substring_distance("viagra", "buy viagra today"), 0);
    }

    #[test]
    fn single_error_costs_one() {
        assert_eq!(substring_distance("viagra", "buy viaxra now"), 1);
    }

    #[test]
    fn normalization_keeps_only_word_characters() {
        assert_eq!(normalize_word("Via-Gra 100%!", false), "viagra 100");
        assert_eq!(normalize_word("Via-Gra 100%!", true), "viagra ");
    }

    #[test]
    fn line_normalization_maps_confusables() {
        assert_eq!(normalize_line("V|AGRA c!@lis", false), "vlagra cialis");
    }

    #[test]
    fn self_match_satisfies_any_positive_threshold() {
        let wl = Wordlist::from_entries([("viagra", 0.01)]);
        let outcome = match_lines(&lines(&["viagra"]), &wl, opts());
        assert_eq!(outcome.count, 1);
        assert_eq!(outcome.pass, MatchPass::Verbatim);
    }

    #[test]
    fn despaced_pass_catches_token_split_words() {
        let wl = Wordlist::from_entries([("viagra", 0.2)]);
        let outcome = match_lines(&lines(&["v i a g r a"]), &wl, opts());
        assert_eq!(outcome.pass, MatchPass::Despaced);
        assert_eq!(outcome.count, 1);
        assert_eq!(outcome.hits[0].word, "viagra");
    }

    #[test]
    fn despaced_count_never_below_verbatim_on_split_input() {
        let wl = Wordlist::from_entries([("viagra", 0.2), ("cialis", 0.2)]);
        let split = lines(&["via gra here", "c i a l i s"]);
        let normalized: Vec<(String, String, f32)> = wl
            .iter()
            .map(|(w, t)| (w.to_string(), normalize_word(w, false), t))
            .collect();
        let norm_lines: Vec<String> =
            split.iter().map(|l| normalize_line(l, false)).collect();
        let (verbatim, _) = run_pass(&normalized, &norm_lines, false, true);
        let (despaced, _) = run_pass(&normalized, &norm_lines, true, true);
        assert!(despaced >= verbatim);
        assert_eq!(despaced, 2);
    }

    #[test]
    fn verbatim_meeting_required_count_skips_despaced_pass() {
        // despaced would also match the split second line, but the
        // verbatim pass already meets the requirement
        let wl = Wordlist::from_entries([("viagra", 0.2)]);
        let mut o = opts();
        o.required_count = 1;
        o.unique_match = false;
        let outcome = match_lines(&lines(&["viagra", "v i a g r a"]), &wl, o);
        assert_eq!(outcome.pass, MatchPass::Verbatim);
        assert_eq!(outcome.count, 1);
    }

    #[test]
    fn tie_prefers_verbatim() {
        let wl = Wordlist::from_entries([("viagra", 0.2)]);
        let outcome = match_lines(&lines(&["buy viagra"]), &wl, opts());
        assert_eq!(outcome.pass, MatchPass::Verbatim);
    }

    #[test]
    fn unique_match_counts_a_word_once() {
        let wl = Wordlist::from_entries([("viagra", 0.2)]);
        let two_lines = lines(&["viagra", "more viagra"]);

        let unique = match_lines(&two_lines, &wl, opts());
        assert_eq!(unique.count, 1);

        let mut o = opts();
        o.unique_match = false;
        let all = match_lines(&two_lines, &wl, o);
        assert_eq!(all.count, 2);
        assert_eq!(all.hits[0].hits, 2);
    }

    #[test]
    fn zero_threshold_never_hits() {
        let wl = Wordlist::from_entries([("viagra", 0.0)]);
        let outcome = match_lines(&lines(&["viagra"]), &wl, opts());
        assert_eq!(outcome.count, 0);
    }
}
