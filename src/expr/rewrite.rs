//! Textual channel substitution.
//!
//! An expression is split on parentheses and whitespace; inside every other token the longest
//! channel name is replaced by a reference, and the text on either side of it is scanned again.
//! Everything that is not a channel name survives verbatim.

use std::fmt;

use crate::catalog::{ChannelCatalog, ChannelKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelRef {
    pub name: String,
    /// Route through the status decoder before use
    pub decode: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Channel(ChannelRef),
}

/// The expression after substitution.
#[derive(Debug, Clone, PartialEq)]
pub struct Rewritten {
    pub segments: Vec<Segment>,
}

impl Rewritten {
    pub fn channels(&self) -> impl Iterator<Item = &ChannelRef> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Channel(channel) => Some(channel),
            Segment::Text(_) => None,
        })
    }
}

impl fmt::Display for Rewritten {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => write!(f, "{}", text)?,
                Segment::Channel(ChannelRef { name, decode: false }) => write!(f, "data[\"{}\"][window]", name)?,
                Segment::Channel(ChannelRef { name, decode: true }) => {
                    write!(f, "decode(data[\"{}\"][window])", name)?
                }
            }
        }
        Ok(())
    }
}

/// Split on parentheses and whitespace. Separators are kept as their own tokens so joining the
/// result gives back the input.
pub fn split_tokens(expression: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut in_space = false;

    for (idx, ch) in expression.char_indices() {
        if ch == '(' || ch == ')' {
            if start < idx {
                tokens.push(&expression[start..idx]);
            }
            tokens.push(&expression[idx..idx + 1]);
            start = idx + 1;
            in_space = false;
            continue;
        }
        let space = ch.is_whitespace();
        if idx > start && space != in_space {
            tokens.push(&expression[start..idx]);
            start = idx;
        }
        if idx == start {
            in_space = space;
        }
    }
    if start < expression.len() {
        tokens.push(&expression[start..]);
    }
    tokens
}

/// Replace channel names with references. With `decode_status` set, references to status
/// channels are marked for decoding.
pub fn rewrite(expression: &str, catalog: &ChannelCatalog, decode_status: bool) -> Rewritten {
    let mut segments = Vec::new();
    for token in split_tokens(expression) {
        if token == "(" || token == ")" || token.trim().is_empty() {
            push_text(&mut segments, token);
        } else {
            substitute(token, catalog, decode_status, &mut segments);
        }
    }
    Rewritten { segments }
}

fn substitute(text: &str, catalog: &ChannelCatalog, decode_status: bool, out: &mut Vec<Segment>) {
    if text.is_empty() {
        return;
    }
    match catalog.longest_match(text) {
        None => push_text(out, text),
        Some((pos, channel)) => {
            let end = pos + channel.name.len();
            substitute(&text[..pos], catalog, decode_status, out);
            out.push(Segment::Channel(ChannelRef {
                name: channel.name.clone(),
                decode: decode_status && channel.kind == ChannelKind::RawStatus,
            }));
            substitute(&text[end..], catalog, decode_status, out);
        }
    }
}

fn push_text(out: &mut Vec<Segment>, text: &str) {
    if let Some(Segment::Text(last)) = out.last_mut() {
        last.push_str(text);
    } else {
        out.push(Segment::Text(text.to_string()));
    }
}
