//! Character scanner for chain text.
//!
//! Splits words at caller-chosen stop characters while honoring quoting,
//! backslash escapes and bracket nesting. Quotes and escapes are removed
//! from the result; bracketed text is kept verbatim including its brackets.

use crate::error::ParseError;

pub(crate) struct Scanner<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    pub fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    pub fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    /// Consume `c` if it is next.
    pub fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    pub fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    /// Read one word, stopping before any char in `stops` at nesting depth 0.
    pub fn word(&mut self, stops: &[char]) -> Result<String, ParseError> {
        let mut out = String::new();
        let mut nests: Vec<char> = Vec::new();

        while let Some(c) = self.peek() {
            if nests.is_empty() && stops.contains(&c) {
                break;
            }
            self.bump();
            match c {
                '\\' => match self.bump() {
                    Some(escaped) => {
                        if !nests.is_empty() {
                            out.push('\\');
                        }
                        out.push(escaped);
                    }
                    None => return Err(ParseError::Unterminated("escape", self.text.into())),
                },
                '\'' | '"' => {
                    let keep = !nests.is_empty();
                    if keep {
                        out.push(c);
                    }
                    self.quoted(c, keep, &mut out)?;
                    if keep {
                        out.push(c);
                    }
                }
                '(' | '[' | '{' => {
                    nests.push(closer(c));
                    out.push(c);
                }
                ')' | ']' | '}' => {
                    if nests.pop() != Some(c) {
                        return Err(ParseError::Unbalanced {
                            close: c,
                            text: self.text.into(),
                        });
                    }
                    out.push(c);
                }
                _ => out.push(c),
            }
        }

        if !nests.is_empty() {
            return Err(ParseError::Unterminated("bracket", self.text.into()));
        }
        Ok(out)
    }

    fn quoted(&mut self, quote: char, keep_escapes: bool, out: &mut String) -> Result<(), ParseError> {
        loop {
            match self.bump() {
                None => return Err(ParseError::Unterminated("quote", self.text.into())),
                Some(c) if c == quote => return Ok(()),
                // Single quotes are fully literal.
                Some('\\') if quote == '"' => match self.bump() {
                    Some(escaped) => {
                        if keep_escapes {
                            out.push('\\');
                        }
                        out.push(escaped);
                    }
                    None => return Err(ParseError::Unterminated("quote", self.text.into())),
                },
                Some(c) => out.push(c),
            }
        }
    }
}

fn closer(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STOPS: &[char] = &[':', ',', '|', '%'];

    #[test]
    fn stops_at_separator() {
        let mut sc = Scanner::new("TCP:localhost:80");
        assert_eq!(sc.word(STOPS).unwrap(), "TCP");
        assert!(sc.eat(':'));
        assert_eq!(sc.word(STOPS).unwrap(), "localhost");
        assert_eq!(sc.rest(), ":80");
    }

    #[test]
    fn quotes_protect_separators() {
        let mut sc = Scanner::new("'a:b|c'\"d,e\"|x");
        assert_eq!(sc.word(STOPS).unwrap(), "a:b|cd,e");
        assert_eq!(sc.peek(), Some('|'));
    }

    #[test]
    fn brackets_are_kept_verbatim() {
        let mut sc = Scanner::new("[::1]:80");
        assert_eq!(sc.word(STOPS).unwrap(), "[::1]");
        assert_eq!(sc.rest(), ":80");
    }

    #[test]
    fn backslash_escapes_one_char() {
        let mut sc = Scanner::new(r"a\:b:c");
        assert_eq!(sc.word(STOPS).unwrap(), "a:b");
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        let mut sc = Scanner::new("'abc");
        assert!(matches!(sc.word(STOPS), Err(ParseError::Unterminated("quote", _))));
    }

    #[test]
    fn unbalanced_brackets_are_errors() {
        assert!(matches!(
            Scanner::new("(abc").word(STOPS),
            Err(ParseError::Unterminated("bracket", _))
        ));
        assert!(matches!(
            Scanner::new("a)b").word(STOPS),
            Err(ParseError::Unbalanced { close: ')', .. })
        ));
        assert!(matches!(
            Scanner::new("(a]").word(STOPS),
            Err(ParseError::Unbalanced { close: ']', .. })
        ));
    }
}
