//! Chain text parsing.
//!
//! A chain is a list of hops separated by `|`. A hop is one address, or two
//! addresses joined by `%`: first the one the consumer writes to, then the
//! one it reads from. Any address may start with `^` to mark it reversed.
//! Each address is `KEYWORD[:param...][,option...]`.

pub(crate) mod lexer;
pub mod options;

use crate::direction::DirMask;
use crate::driver::{AddressDesc, DriverRegistry};
use crate::error::ParseError;

use lexer::Scanner;
pub use options::{AddressOption, AddressOptions};

const KEYWORD_STOPS: &[char] = &[':', ',', '|', '%'];
const OPTION_STOPS: &[char] = &[',', '|', '%'];

/// One parsed address with the driver variants that may serve it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AddressSpec {
    pub keyword: String,
    pub params: Vec<String>,
    pub options: Vec<AddressOption>,
    pub reverse: bool,
    #[serde(skip)]
    pub opts: AddressOptions,
    /// Variants of the keyword that accept this many params.
    #[serde(skip)]
    pub candidates: Vec<&'static AddressDesc>,
}

impl AddressSpec {
    /// Union of the consumer-side directions the candidates support.
    pub fn local_dirs(&self) -> DirMask {
        self.candidates
            .iter()
            .fold(DirMask::empty(), |mask, desc| mask | desc.local_dirs)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "hop", rename_all = "snake_case")]
pub enum Hop {
    Single(AddressSpec),
    /// `a` carries what the consumer writes, `b` what it reads.
    Dual { a: AddressSpec, b: AddressSpec },
}

impl Hop {
    pub fn parts(&self) -> Vec<&AddressSpec> {
        match self {
            Hop::Single(spec) => vec![spec],
            Hop::Dual { a, b } => vec![a, b],
        }
    }
}

/// Parse a whole chain into its hops, first hop first.
pub fn parse_chain(text: &str, registry: &DriverRegistry) -> Result<Vec<Hop>, ParseError> {
    let mut sc = Scanner::new(text);
    let mut hops = Vec::new();
    loop {
        let first = parse_address(&mut sc, registry)?;
        let hop = if sc.eat('%') {
            let second = parse_address(&mut sc, registry)?;
            Hop::Dual { a: first, b: second }
        } else {
            Hop::Single(first)
        };
        tracing::debug!(
            index = hops.len(),
            hop = %serde_json::to_string(&hop).unwrap_or_default(),
            "parsed hop"
        );
        hops.push(hop);

        match sc.peek() {
            None => return Ok(hops),
            Some('|') => {
                sc.bump();
            }
            Some(_) => return Err(ParseError::TrailingGarbage(sc.rest().to_string())),
        }
    }
}

/// Parse text that must hold exactly one address.
pub fn parse_single(text: &str, registry: &DriverRegistry) -> Result<AddressSpec, ParseError> {
    let mut sc = Scanner::new(text);
    let spec = parse_address(&mut sc, registry)?;
    if sc.peek().is_some() {
        return Err(ParseError::TrailingGarbage(sc.rest().to_string()));
    }
    Ok(spec)
}

fn parse_address(sc: &mut Scanner<'_>, registry: &DriverRegistry) -> Result<AddressSpec, ParseError> {
    let reverse = sc.eat('^');
    let word = sc.word(KEYWORD_STOPS)?;
    let word = word.trim();
    if word.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut params = Vec::new();
    while sc.eat(':') {
        params.push(sc.word(KEYWORD_STOPS)?);
    }
    let mut options = Vec::new();
    while sc.eat(',') {
        let item = sc.word(OPTION_STOPS)?;
        if !item.trim().is_empty() {
            options.push(AddressOption::parse(&item));
        }
    }

    let (descs, params) = match registry.lookup(word) {
        Some(descs) => (descs, params),
        None if params.is_empty() => (fallback(word, registry)?, vec![word.to_string()]),
        None => return Err(ParseError::UnknownKeyword(word.to_string())),
    };

    let candidates: Vec<_> = descs
        .iter()
        .copied()
        .filter(|desc| desc.accepts_params(params.len()))
        .collect();
    let Some(first) = candidates.first() else {
        return Err(ParseError::ParamCount {
            keyword: word.to_ascii_uppercase(),
            given: params.len(),
            expected: expected_params(descs),
        });
    };

    Ok(AddressSpec {
        keyword: first.keyword.to_string(),
        params,
        opts: AddressOptions::from_list(&options)?,
        options,
        reverse,
        candidates,
    })
}

/// Bare tokens without a keyword: `3` is FD:3, `/tmp/x` is GOPEN:/tmp/x.
fn fallback<'r>(word: &str, registry: &'r DriverRegistry) -> Result<&'r [&'static AddressDesc], ParseError> {
    let keyword = if word.bytes().all(|b| b.is_ascii_digit()) {
        "FD"
    } else if word.contains('/') {
        "GOPEN"
    } else {
        return Err(ParseError::UnknownKeyword(word.to_string()));
    };
    registry
        .lookup(keyword)
        .ok_or_else(|| ParseError::UnknownKeyword(word.to_string()))
}

fn expected_params(descs: &[&AddressDesc]) -> String {
    let min = descs.iter().map(|d| d.min_params).min().unwrap_or(0);
    let max = descs.iter().map(|d| d.max_params).max().unwrap_or(0);
    if min == max {
        min.to_string()
    } else {
        format!("{min}-{max}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver;
    use crate::error::{ChainError, OpenStatus};

    fn parse(text: &str) -> Result<Vec<Hop>, ParseError> {
        parse_chain(text, driver::builtin())
    }

    #[test]
    fn chain_with_options_and_reverse() {
        let hops = parse("NOP|^TEST|TCP:localhost:8080,retry=3").unwrap();
        insta::assert_json_snapshot!(hops, @r#"
        [
          {
            "hop": "single",
            "keyword": "NOP",
            "params": [],
            "options": [],
            "reverse": false
          },
          {
            "hop": "single",
            "keyword": "TEST",
            "params": [],
            "options": [],
            "reverse": true
          },
          {
            "hop": "single",
            "keyword": "TCP",
            "params": [
              "localhost",
              "8080"
            ],
            "options": [
              {
                "name": "retry",
                "value": "3"
              }
            ],
            "reverse": false
          }
        ]
        "#);
        match &hops[2] {
            Hop::Single(spec) => assert_eq!(spec.opts.retry, Some(3)),
            other => panic!("unexpected hop {other:?}"),
        }
    }

    #[test]
    fn dual_hop_and_fallbacks() {
        let hops = parse("0%/tmp/out,append").unwrap();
        insta::assert_json_snapshot!(hops, @r#"
        [
          {
            "hop": "dual",
            "a": {
              "keyword": "FD",
              "params": [
                "0"
              ],
              "options": [],
              "reverse": false
            },
            "b": {
              "keyword": "GOPEN",
              "params": [
                "/tmp/out"
              ],
              "options": [
                {
                  "name": "append"
                }
              ],
              "reverse": false
            }
          }
        ]
        "#);
    }

    #[test]
    fn keywords_ignore_case_and_alias() {
        let hops = parse("-|pipe").unwrap();
        let keywords: Vec<_> = hops
            .iter()
            .flat_map(|h| h.parts())
            .map(|s| s.keyword.as_str())
            .collect();
        assert_eq!(keywords, ["STDIO", "PIPE"]);
    }

    #[test]
    fn quoted_params_keep_separators() {
        let spec = parse_single("SYSTEM:'echo a|b, c'", driver::builtin()).unwrap();
        assert_eq!(spec.params, ["echo a|b, c"]);
        assert!(spec.options.is_empty());
    }

    #[test]
    fn param_count_is_checked() {
        assert_eq!(
            parse("TCP:localhost").unwrap_err(),
            ParseError::ParamCount {
                keyword: "TCP".into(),
                given: 1,
                expected: "2".into(),
            }
        );
        assert!(matches!(
            parse("PIPE:a:b").unwrap_err(),
            ParseError::ParamCount { expected, .. } if expected == "0-1"
        ));
    }

    #[test]
    fn unknown_keyword_with_trailing_garbage_never_retries() {
        let err = parse("NOSUCHTHING:1:2,junk)more").unwrap_err();
        assert!(matches!(err, ParseError::Unbalanced { close: ')', .. }));
        assert_eq!(ChainError::from(err).status(), OpenStatus::NoRetry);

        let err = parse("NOSUCHTHING:1 trailing garbage|PIPE").unwrap_err();
        assert_eq!(err, ParseError::UnknownKeyword("NOSUCHTHING".into()));
        assert_eq!(ChainError::from(err).status(), OpenStatus::NoRetry);
    }

    #[test]
    fn third_dual_part_is_trailing_garbage() {
        assert_eq!(
            parse("PIPE%PIPE%PIPE").unwrap_err(),
            ParseError::TrailingGarbage("%PIPE".into())
        );
    }

    #[test]
    fn empty_hops_and_bad_options_fail() {
        assert_eq!(parse("").unwrap_err(), ParseError::Empty);
        assert_eq!(parse("PIPE|").unwrap_err(), ParseError::Empty);
        assert_eq!(
            parse("PIPE,nosuchopt").unwrap_err(),
            ParseError::UnknownOption("nosuchopt".into())
        );
    }

    #[test]
    fn candidates_union_directions() {
        let spec = parse_single("STDOUT", driver::builtin()).unwrap();
        assert_eq!(spec.local_dirs(), DirMask::WRITE);
    }
}
