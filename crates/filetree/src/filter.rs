//! Content filters applied while an element's content is read.
//!
//! A [`FilterChain`] is an ordered list of transforms. Nothing runs when a filter is
//! registered; the chain is composed over the content each time it is read. Content is
//! decoded with the chain's [`Charset`], passed through every transform in
//! registration order, and encoded again.

use crate::error::{FileTreeError, Result};
use crate::types::Charset;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, OnceLock};

type LineFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;
type TextFn = Arc<dyn Fn(String) -> String + Send + Sync>;

#[derive(Clone)]
enum Transform {
    /// Per-line transform; `None` drops the line
    Lines(LineFn),
    /// Whole-content transform
    Text(TextFn),
    /// `$name` / `${name}` substitution
    Expand {
        properties: BTreeMap<String, String>,
        escape_backslash: bool,
    },
    /// Ant-style `@token@` replacement
    ReplaceTokens {
        tokens: BTreeMap<String, String>,
        begin: String,
        end: String,
    },
}

impl Transform {
    fn apply(&self, text: String) -> Result<String> {
        match self {
            Self::Lines(filter) => Ok(filter_lines(&text, filter.as_ref())),
            Self::Text(transformer) => Ok(transformer(text)),
            Self::Expand {
                properties,
                escape_backslash,
            } => expand(&text, properties, *escape_backslash),
            Self::ReplaceTokens { tokens, begin, end } => {
                Ok(replace_tokens(&text, tokens, begin, end))
            }
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::Lines(_) => "lines",
            Self::Text(_) => "text",
            Self::Expand { .. } => "expand",
            Self::ReplaceTokens { .. } => "replace-tokens",
        }
    }
}

/// An ordered, composable sequence of content transforms.
#[derive(Clone, Default)]
pub struct FilterChain {
    charset: Charset,
    transforms: Vec<Transform>,
}

impl FilterChain {
    pub fn new(charset: Charset) -> Self {
        Self {
            charset,
            transforms: Vec::new(),
        }
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    pub fn has_filters(&self) -> bool {
        !self.transforms.is_empty()
    }

    /// Transform every line; returning `None` removes the line. Line endings are kept.
    pub fn add_line_filter(
        &mut self,
        filter: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> &mut Self {
        self.transforms.push(Transform::Lines(Arc::new(filter)));
        self
    }

    /// Transform the whole decoded content at once.
    pub fn add_transformer(
        &mut self,
        transformer: impl Fn(String) -> String + Send + Sync + 'static,
    ) -> &mut Self {
        self.transforms.push(Transform::Text(Arc::new(transformer)));
        self
    }

    /// Substitute `$name` and `${name}` with property values. `\$` yields a literal
    /// dollar sign unless `escape_backslash` is set, in which case backslashes are
    /// always copied verbatim. Referencing a missing property fails the read.
    pub fn expand(
        &mut self,
        properties: BTreeMap<String, String>,
        escape_backslash: bool,
    ) -> &mut Self {
        self.transforms.push(Transform::Expand {
            properties,
            escape_backslash,
        });
        self
    }

    /// Replace `begin + key + end` with the key's value. Unknown tokens are left alone.
    pub fn replace_tokens(
        &mut self,
        tokens: BTreeMap<String, String>,
        begin: impl Into<String>,
        end: impl Into<String>,
    ) -> &mut Self {
        self.transforms.push(Transform::ReplaceTokens {
            tokens,
            begin: begin.into(),
            end: end.into(),
        });
        self
    }

    /// Copy `source` into `sink` through the chain, returning the bytes written.
    pub fn transform(&self, source: &mut dyn Read, sink: &mut dyn Write) -> Result<u64> {
        if self.transforms.is_empty() {
            return Ok(io::copy(source, sink)?);
        }

        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes)?;
        let mut text = self.charset.decode(&bytes)?;
        for transform in &self.transforms {
            text = transform.apply(text)?;
        }

        let encoded = self.charset.encode(&text)?;
        sink.write_all(&encoded)?;
        Ok(encoded.len() as u64)
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("charset", &self.charset)
            .field(
                "transforms",
                &self.transforms.iter().map(Transform::describe).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A sink that only counts what is written to it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteCountingSink {
    count: u64,
}

impl ByteCountingSink {
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Write for ByteCountingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.count += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn filter_lines(text: &str, filter: &(dyn Fn(&str) -> Option<String> + Send + Sync)) -> String {
    let mut output = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let (body, ending) = if let Some(body) = line.strip_suffix("\r\n") {
            (body, "\r\n")
        } else if let Some(body) = line.strip_suffix('\n') {
            (body, "\n")
        } else {
            (line, "")
        };

        if let Some(replacement) = filter(body) {
            output.push_str(&replacement);
            output.push_str(ending);
        }
    }
    output
}

fn expand_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\\?)\$(?:\{([A-Za-z_][A-Za-z0-9_.]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
            .expect("expand pattern is valid")
    })
}

fn expand(
    text: &str,
    properties: &BTreeMap<String, String>,
    escape_backslash: bool,
) -> Result<String> {
    let mut output = String::with_capacity(text.len());
    let mut last = 0;

    for captures in expand_pattern().captures_iter(text) {
        let whole = captures.get(0).map(|m| m.range()).unwrap_or(0..0);
        output.push_str(&text[last..whole.start]);
        last = whole.end;

        let escaped = !captures[1].is_empty();
        if escaped && !escape_backslash {
            // `\$name` is a literal `$name`
            output.push_str(&captures[0][1..]);
            continue;
        }
        if escaped {
            output.push('\\');
        }
        output.push_str(lookup(&captures, properties)?);
    }

    output.push_str(&text[last..]);
    Ok(output)
}

fn lookup<'p>(captures: &Captures<'_>, properties: &'p BTreeMap<String, String>) -> Result<&'p str> {
    let name = captures
        .get(2)
        .or_else(|| captures.get(3))
        .map(|m| m.as_str())
        .unwrap_or_default();
    properties
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| FileTreeError::Filter(format!("Missing property '{}'", name)))
}

fn replace_tokens(text: &str, tokens: &BTreeMap<String, String>, begin: &str, end: &str) -> String {
    if begin.is_empty() || end.is_empty() {
        return text.to_string();
    }

    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(begin) {
        output.push_str(&rest[..start]);
        let after_begin = &rest[start + begin.len()..];
        match after_begin.find(end) {
            Some(stop) if tokens.contains_key(&after_begin[..stop]) => {
                output.push_str(&tokens[&after_begin[..stop]]);
                rest = &after_begin[stop + end.len()..];
            }
            _ => {
                output.push_str(begin);
                rest = after_begin;
            }
        }
    }
    output.push_str(rest);
    output
}
