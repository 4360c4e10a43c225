/// Compiled exclude patterns of one folder.
///
/// A pattern containing `/` is anchored at the folder root and matched against the
/// relative path and each of its ancestors, so `build/**` and `build` both exclude the
/// whole `build` subtree. A pattern without `/` is matched against every path segment,
/// so `*.tmp` or `.git` apply at any depth. Wildcards: `*` (within a segment), `?`
/// (one character within a segment) and `**` (any number of segments).
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<Pattern>,
}

#[derive(Debug, Clone)]
struct Pattern {
    tokens: Vec<Token>,
    anchored: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Char(char),
    /// `?`
    One,
    /// `*`
    Star,
    /// `**`
    GlobStar,
}

impl ExcludeSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns = patterns
            .iter()
            .map(|raw| raw.as_ref().trim())
            .filter(|raw| !raw.is_empty())
            .map(|raw| {
                let trimmed = raw.trim_start_matches('/').trim_end_matches('/');
                Pattern {
                    tokens: tokenize(trimmed),
                    anchored: trimmed.contains('/') || raw.starts_with('/'),
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_excluded(&self, relative: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let segments: Vec<&str> = relative.split('/').collect();
        self.patterns.iter().any(|pattern| {
            if pattern.anchored {
                (1..=segments.len()).any(|end| {
                    let prefix: Vec<char> = segments[..end].join("/").chars().collect();
                    glob_match(&pattern.tokens, &prefix)
                })
            } else {
                segments.iter().any(|segment| {
                    let segment: Vec<char> = segment.chars().collect();
                    glob_match(&pattern.tokens, &segment)
                })
            }
        })
    }
}

fn tokenize(raw: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                Token::GlobStar
            }
            '*' => Token::Star,
            '?' => Token::One,
            c => Token::Char(c),
        });
    }
    tokens
}

/// Bottom-up match table: `rows[i][j]` is whether `pattern[i..]` matches `text[j..]`.
/// Each cell is computed once, so the cost stays at pattern length times text length
/// however many wildcards a pattern has.
fn glob_match(pattern: &[Token], text: &[char]) -> bool {
    let n = text.len();
    let mut rows = vec![vec![false; n + 1]; pattern.len() + 1];
    rows[pattern.len()][n] = true;
    for i in (0..pattern.len()).rev() {
        let (head, tail) = rows.split_at_mut(i + 1);
        let current = &mut head[i];
        let next = &tail[0];
        // Whether the rest matches some suffix starting at or after `j`.
        let mut rest_later = false;
        for j in (0..=n).rev() {
            rest_later |= next[j];
            current[j] = match pattern[i] {
                Token::Char(c) => j < n && text[j] == c && next[j + 1],
                Token::One => j < n && text[j] != '/' && next[j + 1],
                Token::Star => next[j] || (j < n && text[j] != '/' && current[j + 1]),
                Token::GlobStar => {
                    // `**/` may also stand for no directory at all.
                    let no_segment = pattern.get(i + 1) == Some(&Token::Char('/'))
                        && tail.get(1).is_some_and(|row| row[j]);
                    no_segment || rest_later
                }
            };
        }
    }
    rows[0][0]
}
