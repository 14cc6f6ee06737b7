//! Compact linear notation for expression trees.
//!
//! A leaf is written `tag:content`, a node `tag(child,child,...)`. The notation
//! string is the identity key of every frequency statistic, so decoding and
//! encoding must agree exactly.
//!
//! Leaf content may itself contain `(`, `)`, `,` and `:` (`mo:(`, `mo:,`,
//! `mo::`, `mtext:(1.3), (1.4)`). Content therefore ends at the first
//!
//! * `,` that is followed by the start of a tag token (`[a-z][a-z0-9]*` and
//!   then `(` or `:`), or
//! * `)` once the content is non-empty and either a single character or free
//!   of unmatched `(`,
//!
//! or at the end of the input for a top-level leaf.
//!
//! Empty content ends at `,<tag>` or at `)`. The two readings of `tag:)`
//! (empty last child, or the content `)`) are resolved by trying the empty
//! reading first and falling back to the content reading when the rest of
//! the input does not parse that way.

use crate::error::ParseError;
use quick_xml::events::Event;
use quick_xml::Reader;

pub const INVISIBLE_TIMES: char = '\u{2062}';
pub const FUNCTION_APPLY: char = '\u{2061}';

const INVISIBLE_TIMES_TOKEN: &str = "ivt";
const FUNCTION_APPLY_TOKEN: &str = "fap";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MathNode {
    Leaf { tag: String, text: String },
    Node { tag: String, children: Vec<MathNode> },
}

impl MathNode {
    pub fn leaf(tag: impl Into<String>, text: impl Into<String>) -> Self {
        MathNode::Leaf { tag: tag.into(), text: text.into() }
    }

    pub fn node(tag: impl Into<String>, children: Vec<MathNode>) -> Self {
        MathNode::Node { tag: tag.into(), children }
    }

    pub fn tag(&self) -> &str {
        match self {
            MathNode::Leaf { tag, .. } | MathNode::Node { tag, .. } => tag,
        }
    }

    /// Height of the tree; a single leaf has depth 1.
    pub fn depth(&self) -> usize {
        let mut max = 0;
        let mut pending = vec![(self, 1usize)];
        while let Some((node, level)) = pending.pop() {
            max = max.max(level);
            if let MathNode::Node { children, .. } = node {
                pending.extend(children.iter().map(|c| (c, level + 1)));
            }
        }
        max
    }
}

struct OpenNode {
    tag: String,
    children: Vec<MathNode>,
}

/// Parses notation into a tree.
pub fn decode(input: &str) -> Result<MathNode, ParseError> {
    decode_pass(input, true).or_else(|_| decode_pass(input, false))
}

fn decode_pass(input: &str, empty_closes: bool) -> Result<MathNode, ParseError> {
    let bytes = input.as_bytes();
    let mut stack: Vec<OpenNode> = Vec::new();
    let mut root: Option<MathNode> = None;
    let mut pos = 0;

    'items: loop {
        if root.is_some() {
            return Err(ParseError::notation(pos, "trailing input after expression"));
        }
        let (tag, after_tag) = read_tag(bytes, pos)?;
        match bytes.get(after_tag) {
            Some(b'(') => {
                stack.push(OpenNode { tag, children: Vec::new() });
                pos = after_tag + 1;
                if bytes.get(pos) != Some(&b')') {
                    continue 'items;
                }
            }
            Some(b':') => {
                let start = after_tag + 1;
                let end = leaf_end(bytes, start, !stack.is_empty(), empty_closes)?;
                let leaf = MathNode::Leaf { tag, text: decode_content(&input[start..end]) };
                attach(&mut stack, &mut root, leaf, pos)?;
                pos = end;
            }
            _ => return Err(ParseError::notation(after_tag, "expected '(' or ':' after tag")),
        }

        // separators and closing parentheses after a finished item
        loop {
            match bytes.get(pos) {
                None if stack.is_empty() => {
                    return root.ok_or_else(|| ParseError::notation(pos, "empty expression"));
                }
                None => return Err(ParseError::notation(pos, "unbalanced parentheses: node not closed")),
                Some(b')') => {
                    let open = stack
                        .pop()
                        .ok_or_else(|| ParseError::notation(pos, "unbalanced parentheses: unexpected ')'"))?;
                    let node = MathNode::Node { tag: open.tag, children: open.children };
                    attach(&mut stack, &mut root, node, pos)?;
                    pos += 1;
                }
                Some(b',') if !stack.is_empty() => {
                    pos += 1;
                    continue 'items;
                }
                Some(_) => return Err(ParseError::notation(pos, "unexpected character")),
            }
        }
    }
}

fn attach(
    stack: &mut [OpenNode],
    root: &mut Option<MathNode>,
    node: MathNode,
    pos: usize,
) -> Result<(), ParseError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None if root.is_none() => *root = Some(node),
        None => return Err(ParseError::notation(pos, "more than one top-level expression")),
    }
    Ok(())
}

fn read_tag(bytes: &[u8], start: usize) -> Result<(String, usize), ParseError> {
    match bytes.get(start) {
        Some(b) if b.is_ascii_lowercase() => {}
        _ => return Err(ParseError::notation(start, "expected tag")),
    }
    let mut end = start + 1;
    while matches!(bytes.get(end), Some(b) if b.is_ascii_lowercase() || b.is_ascii_digit()) {
        end += 1;
    }
    // tags are ASCII, the slice is valid UTF-8
    Ok((String::from_utf8_lossy(&bytes[start..end]).into_owned(), end))
}

fn starts_tag(bytes: &[u8], start: usize) -> bool {
    if !matches!(bytes.get(start), Some(b) if b.is_ascii_lowercase()) {
        return false;
    }
    let mut i = start + 1;
    while matches!(bytes.get(i), Some(b) if b.is_ascii_lowercase() || b.is_ascii_digit()) {
        i += 1;
    }
    matches!(bytes.get(i), Some(b'(') | Some(b':'))
}

fn leaf_end(bytes: &[u8], start: usize, inside_node: bool, empty_closes: bool) -> Result<usize, ParseError> {
    if !inside_node {
        return Ok(bytes.len());
    }
    let mut unmatched: i32 = 0;
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b',' if starts_tag(bytes, i + 1) => return Ok(i),
            b')' if i == start && empty_closes => return Ok(i),
            b')' if i > start && (single_char(&bytes[start..i]) || unmatched <= 0) => return Ok(i),
            b'(' => unmatched += 1,
            b')' => unmatched -= 1,
            _ => {}
        }
        i += 1;
    }
    Err(ParseError::notation(start, "unterminated leaf content inside open node"))
}

fn single_char(content: &[u8]) -> bool {
    std::str::from_utf8(content).map(|s| s.chars().count() == 1).unwrap_or(false)
}

fn decode_content(raw: &str) -> String {
    match raw {
        INVISIBLE_TIMES_TOKEN => INVISIBLE_TIMES.to_string(),
        FUNCTION_APPLY_TOKEN => FUNCTION_APPLY.to_string(),
        _ => raw.to_string(),
    }
}

fn encode_content(text: &str) -> &str {
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(INVISIBLE_TIMES), None) => INVISIBLE_TIMES_TOKEN,
        (Some(FUNCTION_APPLY), None) => FUNCTION_APPLY_TOKEN,
        _ => text,
    }
}

enum Step<'a> {
    Visit(&'a MathNode),
    Separator,
    Close(&'a str),
}

/// Writes a tree back into notation.
pub fn encode(node: &MathNode) -> String {
    let mut out = String::new();
    let mut work = vec![Step::Visit(node)];
    while let Some(step) = work.pop() {
        match step {
            Step::Visit(MathNode::Leaf { tag, text }) => {
                out.push_str(tag);
                out.push(':');
                out.push_str(encode_content(text));
            }
            Step::Visit(MathNode::Node { tag, children }) => {
                out.push_str(tag);
                out.push('(');
                work.push(Step::Close(tag));
                push_children(&mut work, children, true);
            }
            Step::Separator => out.push(','),
            Step::Close(_) => out.push(')'),
        }
    }
    out
}

fn push_children<'a>(work: &mut Vec<Step<'a>>, children: &'a [MathNode], separated: bool) {
    for (i, child) in children.iter().enumerate().rev() {
        work.push(Step::Visit(child));
        if separated && i > 0 {
            work.push(Step::Separator);
        }
    }
}

/// Renders a tree as markup, escaping reserved characters in text content.
pub fn to_markup(node: &MathNode) -> String {
    let mut out = String::new();
    let mut work = vec![Step::Visit(node)];
    while let Some(step) = work.pop() {
        match step {
            Step::Visit(MathNode::Leaf { tag, text }) => {
                open_tag(&mut out, tag);
                out.push_str(&quick_xml::escape::escape(text.as_str()));
                close_tag(&mut out, tag);
            }
            Step::Visit(MathNode::Node { tag, children }) => {
                open_tag(&mut out, tag);
                work.push(Step::Close(tag));
                push_children(&mut work, children, false);
            }
            Step::Close(tag) => close_tag(&mut out, tag),
            Step::Separator => {}
        }
    }
    out
}

fn open_tag(out: &mut String, tag: &str) {
    out.push('<');
    out.push_str(tag);
    out.push('>');
}

fn close_tag(out: &mut String, tag: &str) {
    out.push_str("</");
    out.push_str(tag);
    out.push('>');
}

/// Convenience for `to_markup(&decode(input)?)`.
pub fn notation_to_markup(input: &str) -> Result<String, ParseError> {
    Ok(to_markup(&decode(input)?))
}

struct OpenElement {
    tag: String,
    children: Vec<MathNode>,
    text: String,
}

/// Parses (possibly pretty-printed) markup into a tree.
///
/// Attributes, namespace prefixes, comments and whitespace between elements
/// are dropped. A `math` root with a single child is unwrapped.
pub fn from_markup(input: &str) -> Result<MathNode, ParseError> {
    let mut reader = Reader::from_str(input);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<OpenElement> = Vec::new();
    let mut root: Option<MathNode> = None;

    loop {
        let event = reader.read_event().map_err(|e| ParseError::Markup { reason: e.to_string() })?;
        match event {
            Event::Start(e) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                stack.push(OpenElement { tag, children: Vec::new(), text: String::new() });
            }
            Event::Empty(e) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                attach_markup(&mut stack, &mut root, MathNode::Leaf { tag, text: String::new() })?;
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| ParseError::Markup { reason: e.to_string() })?;
                match stack.last_mut() {
                    Some(open) => open.text.push_str(&text),
                    None => return Err(markup_error("text outside of any element")),
                }
            }
            Event::CData(c) => match stack.last_mut() {
                Some(open) => open.text.push_str(&String::from_utf8_lossy(&c)),
                None => return Err(markup_error("text outside of any element")),
            },
            Event::End(_) => {
                let open = stack.pop().ok_or_else(|| markup_error("unexpected closing tag"))?;
                let node = if open.children.is_empty() {
                    MathNode::Leaf { tag: open.tag, text: open.text }
                } else if open.text.trim().is_empty() {
                    MathNode::Node { tag: open.tag, children: open.children }
                } else {
                    return Err(markup_error(format!("mixed content in <{}>", open.tag)));
                };
                attach_markup(&mut stack, &mut root, node)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(markup_error("unclosed element"));
    }
    match root {
        Some(MathNode::Node { tag, mut children }) if tag == "math" && children.len() == 1 => {
            Ok(children.remove(0))
        }
        Some(node) => Ok(node),
        None => Err(markup_error("no element found")),
    }
}

fn attach_markup(stack: &mut [OpenElement], root: &mut Option<MathNode>, node: MathNode) -> Result<(), ParseError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None if root.is_none() => *root = Some(node),
        None => return Err(markup_error("more than one root element")),
    }
    Ok(())
}

fn markup_error(reason: impl Into<String>) -> ParseError {
    ParseError::Markup { reason: reason.into() }
}
