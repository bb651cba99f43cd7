//! Decoder for the tagged output stream produced by the wrapper scripts.
//!
//! The stream is a flat sequence of `<psout>`/`<pserr>` elements separated by
//! line breaks. It is wrapped in a synthetic `<root>` element and parsed as a
//! (very small) XML tree: children of the root may only be the two tag
//! elements, and element content may only be CDATA sections, character data
//! and the five predefined entities or numeric character references.

use super::{CodecError, CodecResult, STDERR_TAG, STDOUT_TAG};

const ROOT_OPEN: &str = "<root>\n";
const ROOT_CLOSE: &str = "</root>";
const CDATA_OPEN: &str = "<![CDATA[";
const CDATA_CLOSE: &str = "]]>";

/// Separate stdout and stderr text recovered from a tagged stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedOutput {
    /// Lines tagged `psout`, joined with `\n`
    pub stdout: String,
    /// Lines tagged `pserr`, joined with `\n`
    pub stderr: String,
}

/// Decode raw stdout captured from a wrapper script.
///
/// Each element's text has trailing newline and space padding removed and is
/// appended as one line to the matching stream. Empty input yields empty
/// streams. Anything not produced by the wrapper scripts is rejected with
/// [`CodecError::MalformedOutput`].
pub fn decode(raw: &[u8]) -> CodecResult<DecodedOutput> {
    let text = String::from_utf8_lossy(raw);
    let document = format!("{ROOT_OPEN}{text}{ROOT_CLOSE}");

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let mut parser = Parser::new(&document);
    parser.expect(ROOT_OPEN)?;

    loop {
        parser.skip_whitespace();

        if parser.rest().starts_with(ROOT_CLOSE) {
            parser.advance(ROOT_CLOSE.len());
            break;
        }

        let (tag, content) = parser.element()?;
        let line = content.trim_end_matches(['\n', '\r', ' ']).to_string();
        match tag {
            Stream::Stdout => stdout.push(line),
            Stream::Stderr => stderr.push(line),
        }
    }

    if !parser.rest().is_empty() {
        return Err(parser.error("unexpected data after the tagged stream"));
    }

    Ok(DecodedOutput {
        stdout: stdout.join("\n"),
        stderr: stderr.join("\n"),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn advance(&mut self, len: usize) {
        self.pos += len;
    }

    /// Offset relative to the caller's raw bytes rather than the document.
    fn error(&self, reason: impl Into<String>) -> CodecError {
        CodecError::MalformedOutput {
            offset: self.pos.saturating_sub(ROOT_OPEN.len()),
            reason: reason.into(),
        }
    }

    fn expect(&mut self, literal: &str) -> CodecResult<()> {
        if self.rest().starts_with(literal) {
            self.advance(literal.len());
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", literal.escape_debug())))
        }
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        let trimmed = rest.trim_start();
        self.advance(rest.len() - trimmed.len());
    }

    /// Parse one `<psout>`/`<pserr>` element and return its text content.
    fn element(&mut self) -> CodecResult<(Stream, String)> {
        if !self.rest().starts_with('<') {
            return Err(self.error("text outside of a tagged element"));
        }

        let rest = &self.rest()[1..];
        let name_len = rest
            .find(|c: char| c == '>' || c == '/' || c.is_whitespace())
            .ok_or_else(|| self.error("unterminated start tag"))?;
        let name = &rest[..name_len];
        let stream = match name {
            STDOUT_TAG => Stream::Stdout,
            STDERR_TAG => Stream::Stderr,
            _ => return Err(self.error(format!("unknown element '{}'", name))),
        };
        self.advance(1 + name_len);

        if self.rest().starts_with("/>") {
            self.advance(2);
            return Ok((stream, String::new()));
        }
        self.expect(">")?;

        let close = format!("</{}>", name);
        let mut content = String::new();

        loop {
            let rest = self.rest();
            if rest.is_empty() || rest.starts_with(ROOT_CLOSE) {
                return Err(self.error(format!("unterminated <{}> element", name)));
            }

            if rest.starts_with(CDATA_OPEN) {
                let body = &rest[CDATA_OPEN.len()..];
                let end = body
                    .find(CDATA_CLOSE)
                    .ok_or_else(|| self.error("unterminated CDATA section"))?;
                content.push_str(&body[..end]);
                self.advance(CDATA_OPEN.len() + end + CDATA_CLOSE.len());
            } else if rest.starts_with(close.as_str()) {
                self.advance(close.len());
                return Ok((stream, content));
            } else if rest.starts_with('<') {
                return Err(self.error(format!("unexpected markup inside <{}>", name)));
            } else {
                let end = rest.find('<').unwrap_or(rest.len());
                let text = self.unescape(&rest[..end])?;
                content.push_str(&text);
                self.advance(end);
            }
        }
    }

    fn unescape(&self, text: &str) -> CodecResult<String> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(amp) = rest.find('&') {
            out.push_str(&rest[..amp]);
            let after = &rest[amp + 1..];
            let semi = after
                .find(';')
                .ok_or_else(|| self.error("unterminated entity reference"))?;
            let entity = &after[..semi];

            let decoded = match entity {
                "lt" => '<',
                "gt" => '>',
                "amp" => '&',
                "quot" => '"',
                "apos" => '\'',
                _ => numeric_reference(entity)
                    .ok_or_else(|| self.error(format!("unknown entity '&{};'", entity)))?,
            };
            out.push(decoded);
            rest = &after[semi + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }
}

fn numeric_reference(entity: &str) -> Option<char> {
    let digits = entity.strip_prefix('#')?;
    let code = match digits.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    char::from_u32(code)
}
