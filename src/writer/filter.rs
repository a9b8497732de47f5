//! Rule-based entry filtering with a small self-contained glob matcher.
//!
//! Rules are evaluated in order against the slash-separated path relative
//! to the scan root; the first matching rule wins.  Paths with no
//! matching rule are included.
//!
//! Glob syntax: `*` matches within one path component, `**` matches
//! across components, `?` matches one character, `[abc]`/`[a-z]` match
//! character sets.  A pattern ending in `/` only matches directories.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Include,
    Exclude,
}

#[derive(Debug, Clone)]
pub struct FilterRule {
    pub action:  RuleAction,
    pub pattern: GlobMatcher,
}

#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    rules: Vec<FilterRule>,
}

impl EntryFilter {
    pub fn new() -> Self {
        EntryFilter::default()
    }

    pub fn add_rule(&mut self, action: RuleAction, pattern: &str) {
        self.rules.push(FilterRule { action, pattern: GlobMatcher::new(pattern) });
    }

    pub fn exclude(mut self, pattern: &str) -> Self {
        self.add_rule(RuleAction::Exclude, pattern);
        self
    }

    pub fn include(mut self, pattern: &str) -> Self {
        self.add_rule(RuleAction::Include, pattern);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First matching rule decides; default is include.
    pub fn accepts(&self, path: &str, is_dir: bool) -> bool {
        for rule in &self.rules {
            if rule.pattern.matches_entry(path, is_dir) {
                return rule.action == RuleAction::Include;
            }
        }
        true
    }
}

// ── Glob matcher ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GlobMatcher {
    tokens:   Vec<Token>,
    dir_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(char),
    AnyChar,
    /// `*` — anything except `/`.
    Star,
    /// `**` — anything including `/`.
    GlobStar,
    Set { negated: bool, ranges: Vec<(char, char)> },
}

impl GlobMatcher {
    pub fn new(pattern: &str) -> Self {
        let dir_only = pattern.ends_with('/');
        let pattern = pattern.trim_end_matches('/');
        let mut tokens = Vec::new();
        let mut chars = pattern.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    if chars.peek() == Some(&'*') {
                        chars.next();
                        tokens.push(Token::GlobStar);
                    } else {
                        tokens.push(Token::Star);
                    }
                }
                '?' => tokens.push(Token::AnyChar),
                '[' => {
                    let mut negated = false;
                    if matches!(chars.peek(), Some('!') | Some('^')) {
                        chars.next();
                        negated = true;
                    }
                    let mut ranges: Vec<(char, char)> = Vec::new();
                    let mut pending: Option<char> = None;
                    while let Some(s) = chars.next() {
                        if s == ']' {
                            break;
                        }
                        if s == '-' && pending.is_some() && chars.peek().is_some_and(|&n| n != ']') {
                            let lo = pending.take().unwrap();
                            let hi = chars.next().unwrap();
                            ranges.pop();
                            ranges.push((lo, hi));
                        } else {
                            ranges.push((s, s));
                            pending = Some(s);
                        }
                    }
                    tokens.push(Token::Set { negated, ranges });
                }
                c => tokens.push(Token::Literal(c)),
            }
        }

        GlobMatcher { tokens, dir_only }
    }

    pub fn matches_entry(&self, path: &str, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        let chars: Vec<char> = path.chars().collect();
        match_tokens(&self.tokens, &chars)
    }

    pub fn matches(&self, path: &str) -> bool {
        self.matches_entry(path, true) || self.matches_entry(path, false)
    }
}

fn match_tokens(tokens: &[Token], input: &[char]) -> bool {
    match tokens.first() {
        None => input.is_empty(),
        Some(Token::Literal(c)) => input.first() == Some(c) && match_tokens(&tokens[1..], &input[1..]),
        Some(Token::AnyChar) => {
            !input.is_empty() && input[0] != '/' && match_tokens(&tokens[1..], &input[1..])
        }
        Some(Token::Set { negated, ranges }) => match input.first() {
            Some(&c) if c != '/' => {
                let inside = ranges.iter().any(|&(lo, hi)| c >= lo && c <= hi);
                inside != *negated && match_tokens(&tokens[1..], &input[1..])
            }
            _ => false,
        },
        Some(Token::Star) => {
            for skip in 0..=input.len() {
                if match_tokens(&tokens[1..], &input[skip..]) {
                    return true;
                }
                if skip < input.len() && input[skip] == '/' {
                    break;
                }
            }
            false
        }
        Some(Token::GlobStar) => {
            for skip in 0..=input.len() {
                if match_tokens(&tokens[1..], &input[skip..]) {
                    return true;
                }
            }
            false
        }
    }
}
