use std::io::{self, ErrorKind, Read, Seek};
use std::mem;

use crate::{Dialect, LexKind, Lexeme};

// Reads the source one line at a time so a lexeme can never straddle a line
// boundary. The current line always carries a trailing b'\n', or a NUL
// sentinel on the final unterminated line and at end of input, so scans stay
// in bounds without length checks. Raw lines are cached as they go by for
// the listing and for error excerpts.
struct LineReader<R> {
    inner: R,
    lines: Vec<String>,
    line: Vec<u8>,
    line_num: usize,
    pos: usize,
    done: bool,
}

impl<R: Read + Seek> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            lines: Vec::new(),
            line: Vec::new(),
            line_num: 0,
            pos: 0,
            done: false,
        }
    }

    fn read_line(&mut self) -> io::Result<()> {
        self.line.clear();
        let mut buf = [0];
        loop {
            if self.inner.read(&mut buf)? == 0 {
                break;
            }
            self.line.push(buf[0]);
            if buf[0] == b'\n' {
                break;
            }
        }
        if self.line.is_empty() {
            self.done = true;
            self.line.push(0);
        } else {
            if *self.line.last().unwrap() != b'\n' {
                self.line.push(0);
            }
            let raw = String::from_utf8_lossy(&self.line);
            self.lines
                .push(raw.trim_end_matches(['\n', '\r', '\0']).to_string());
        }
        self.pos = 0;
        self.line_num += 1;
        Ok(())
    }

    fn reset(&mut self) -> io::Result<()> {
        self.inner.rewind()?;
        self.lines.clear();
        self.line.clear();
        self.line_num = 0;
        self.pos = 0;
        self.done = false;
        self.read_line()
    }

    fn cur(&self) -> u8 {
        self.line.get(self.pos).copied().unwrap_or(0)
    }

    fn skip_whitespace(&mut self) {
        while let Some(&c) = self.line.get(self.pos) {
            if c != b' ' && c != b'\t' {
                break;
            }
            self.pos += 1;
        }
    }

    fn line_str(&self) -> String {
        String::from_utf8_lossy(&self.line)
            .trim_end_matches(['\n', '\r', '\0'])
            .to_string()
    }
}

/// Lexeme stream with a three slot lookahead window. `advance` shifts
/// this into prev and next into this, then scans a fresh `next` - most
/// grammar decisions hang off what follows the current lexeme.
pub struct Lexer<R> {
    reader: LineReader<R>,
    dialect: Dialect,
    pub prev: Lexeme,
    pub this: Lexeme,
    pub next: Lexeme,
}

impl<R: Read + Seek> Lexer<R> {
    /// A successive `advance` moves the first lexeme of the input into
    /// `this` and scans a new `next`.
    pub fn new(inner: R, dialect: Dialect) -> io::Result<Self> {
        let mut lex = Self {
            reader: LineReader::new(inner),
            dialect,
            prev: Lexeme::default(),
            this: Lexeme::default(),
            next: Lexeme::default(),
        };
        lex.reader.read_line()?;
        lex.advance()?;
        Ok(lex)
    }

    pub fn advance(&mut self) -> io::Result<()> {
        let next = self.scan()?;
        self.prev = mem::replace(&mut self.this, mem::replace(&mut self.next, next));
        Ok(())
    }

    /// Rewind to the start of the input and restore the initial window.
    pub fn reset(&mut self) -> io::Result<()> {
        self.reader.reset()?;
        self.prev = Lexeme::default();
        self.this = Lexeme::default();
        self.next = Lexeme::default();
        self.advance()
    }

    /// Raw text of a 1-based source line seen so far, for the listing.
    pub fn raw_line(&self, num: usize) -> &str {
        match num.checked_sub(1).and_then(|i| self.reader.lines.get(i)) {
            Some(line) => line,
            None => "",
        }
    }

    /// All raw source lines, reading any remainder past an early `$` end
    /// marker so error excerpts can show trailing context.
    pub fn source_lines(&mut self) -> io::Result<&[String]> {
        while !self.reader.done {
            self.reader.read_line()?;
        }
        Ok(&self.reader.lines)
    }

    fn scan(&mut self) -> io::Result<Lexeme> {
        let line = self.reader.line_num;
        self.reader.skip_whitespace();
        let column = self.reader.pos + 1;
        let lexeme = |kind, text: &str| Lexeme {
            kind,
            text: text.to_string(),
            line,
            column,
        };

        let c = self.reader.cur();
        if self.reader.done || c == 0 || c == b'$' {
            return Ok(lexeme(LexKind::Eof, ""));
        }

        if c == b'\n' || c == b';' {
            if c == b';' {
                // catches a ';' at end of line along with any empty lines
                // after it
                self.reader.pos += 1;
            }
            while self.reader.cur() == b'\n' {
                self.reader.read_line()?;
                if self.reader.done {
                    break;
                }
                self.reader.skip_whitespace();
            }
            return Ok(lexeme(LexKind::Eol, "\n"));
        }

        if c == b'/' {
            // the rest of the line verbatim, kept for listing alignment
            let text = self.reader.line_str();
            let text = &text[self.reader.pos.min(text.len())..];
            self.reader.pos = self.reader.line.len() - 1;
            return Ok(lexeme(LexKind::Comment, text));
        }

        if c == b'"' && self.dialect == Dialect::PalD {
            self.reader.pos += 1;
            let start = self.reader.pos;
            while self.reader.cur() != b'"' {
                if self.reader.cur() == b'\n' || self.reader.cur() == 0 {
                    return Err(self.fatal(column, "unterminated string"));
                }
                self.reader.pos += 1;
            }
            let text = String::from_utf8_lossy(&self.reader.line[start..self.reader.pos]).to_string();
            self.reader.pos += 1;
            return Ok(Lexeme {
                kind: LexKind::Str,
                text,
                line,
                column,
            });
        }

        if c == b'\'' && self.dialect == Dialect::PalD {
            self.reader.pos += 1;
            let start = self.reader.pos;
            loop {
                match self.reader.cur() {
                    0 | b'\n' | b'\'' => break,
                    b'\\' => {
                        self.reader.pos += 1;
                        if self.reader.cur() == 0 || self.reader.cur() == b'\n' {
                            return Err(self.fatal(column, "invalid character literal"));
                        }
                        self.reader.pos += 1;
                    }
                    _ => self.reader.pos += 1,
                }
            }
            let text = String::from_utf8_lossy(&self.reader.line[start..self.reader.pos]).to_string();
            if self.reader.cur() == b'\'' {
                // the closing quote is optional
                self.reader.pos += 1;
            }
            if text.is_empty() {
                return Err(self.fatal(column, "invalid character literal"));
            }
            return Ok(Lexeme {
                kind: LexKind::Char,
                text,
                line,
                column,
            });
        }

        if matches!(c, b'=' | b'*' | b',' | b'.' | b'-' | b'+') {
            self.reader.pos += 1;
            return Ok(lexeme(LexKind::Punct, &(c as char).to_string()));
        }

        if c.is_ascii_alphabetic() {
            let start = self.reader.pos;
            while self.reader.cur().is_ascii_alphanumeric() {
                self.reader.pos += 1;
            }
            let text = String::from_utf8_lossy(&self.reader.line[start..self.reader.pos]).to_string();
            return Ok(Lexeme {
                kind: LexKind::Symbol,
                text,
                line,
                column,
            });
        }

        if c.is_ascii_digit() {
            let start = self.reader.pos;
            self.reader.pos += 1;
            match self.dialect {
                // legacy loose scan: the base letters count as digits
                // wherever they appear, hex bodies are not recognized
                Dialect::Pal3 => {
                    while matches!(self.reader.cur(), b'0'..=b'9' | b'x' | b'o' | b'b' | b'd') {
                        self.reader.pos += 1;
                    }
                }
                // strict scan: a base prefix is only recognized up front,
                // and it opens up the hex alphabet for the body
                Dialect::PalD => {
                    if c == b'0' && matches!(self.reader.cur(), b'x' | b'o' | b'b' | b'd') {
                        self.reader.pos += 1;
                        while self.reader.cur().is_ascii_hexdigit() {
                            self.reader.pos += 1;
                        }
                    } else {
                        while self.reader.cur().is_ascii_digit() {
                            self.reader.pos += 1;
                        }
                    }
                }
            }
            let text = String::from_utf8_lossy(&self.reader.line[start..self.reader.pos]).to_string();
            return Ok(Lexeme {
                kind: LexKind::Number,
                text,
                line,
                column,
            });
        }

        Err(self.fatal(column, &format!("unknown lexeme: '{}'", c as char)))
    }

    // A malformed byte makes the rest of the stream unreliable, so lexical
    // errors abort the whole run instead of joining the batched diagnostics.
    fn fatal(&self, column: usize, msg: &str) -> io::Error {
        io::Error::new(
            ErrorKind::InvalidData,
            format!(
                "{msg}\n{:>3} | {}\n    | {:>column$}",
                self.reader.line_num,
                self.reader.line_str(),
                "^",
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn lex_all(src: &str, dialect: Dialect) -> Vec<(LexKind, String)> {
        let mut lex = Lexer::new(Cursor::new(src.as_bytes().to_vec()), dialect).unwrap();
        let mut out = Vec::new();
        loop {
            lex.advance().unwrap();
            out.push((lex.this.kind, lex.this.text.clone()));
            if lex.this.kind == LexKind::Eof {
                return out;
            }
        }
    }

    #[test]
    fn classifies_a_statement() {
        use LexKind::*;
        let toks = lex_all("*200\nHERE, TAD 5 /get five\n$", Dialect::Pal3);
        let kinds: Vec<LexKind> = toks.iter().map(|t| t.0).collect();
        assert_eq!(
            kinds,
            vec![Punct, Number, Eol, Symbol, Punct, Symbol, Number, Comment, Eol, Eof]
        );
        assert_eq!(toks[3].1, "HERE");
        assert_eq!(toks[7].1, "/get five");
    }

    #[test]
    fn lookahead_window() {
        let mut lex = Lexer::new(Cursor::new(b"TAD A\n".to_vec()), Dialect::Pal3).unwrap();
        lex.advance().unwrap();
        assert_eq!(lex.this.text, "TAD");
        assert_eq!(lex.next.text, "A");
        lex.advance().unwrap();
        assert_eq!(lex.prev.text, "TAD");
        assert_eq!(lex.this.text, "A");
        assert_eq!(lex.next.kind, LexKind::Eol);
    }

    #[test]
    fn positions_are_one_based() {
        let mut lex = Lexer::new(Cursor::new(b"  TAD A\nB\n".to_vec()), Dialect::Pal3).unwrap();
        lex.advance().unwrap();
        assert_eq!((lex.this.line, lex.this.column), (1, 3));
        lex.advance().unwrap();
        assert_eq!((lex.this.line, lex.this.column), (1, 7));
        lex.advance().unwrap(); // eol
        lex.advance().unwrap();
        assert_eq!(lex.this.text, "B");
        assert_eq!((lex.this.line, lex.this.column), (2, 1));
    }

    #[test]
    fn semicolon_separates_and_skips_blanks() {
        use LexKind::*;
        let toks = lex_all("CLA;CMA\n\n\nNOP\n", Dialect::Pal3);
        let kinds: Vec<LexKind> = toks.iter().map(|t| t.0).collect();
        assert_eq!(kinds, vec![Symbol, Eol, Symbol, Eol, Symbol, Eol, Eof]);
    }

    #[test]
    fn reset_restores_the_stream() {
        let mut lex = Lexer::new(Cursor::new(b"CLA\nCMA\n".to_vec()), Dialect::Pal3).unwrap();
        lex.advance().unwrap();
        lex.advance().unwrap();
        lex.advance().unwrap();
        assert_eq!(lex.this.text, "CMA");
        lex.reset().unwrap();
        lex.advance().unwrap();
        assert_eq!(lex.this.text, "CLA");
        assert_eq!(lex.this.line, 1);
    }

    #[test]
    fn dollar_ends_the_program() {
        use LexKind::*;
        let toks = lex_all("NOP\n$\nCLA\n", Dialect::Pal3);
        let kinds: Vec<LexKind> = toks.iter().map(|t| t.0).collect();
        assert_eq!(kinds, vec![Symbol, Eol, Eof]);
    }

    #[test]
    fn unknown_byte_is_fatal() {
        // `new` primes the first lexeme, so the bad byte surfaces on the
        // advance that scans it into the window
        let mut lex = Lexer::new(Cursor::new(b"TAD ?\n".to_vec()), Dialect::Pal3).unwrap();
        let err = lex.advance().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.to_string().contains("unknown lexeme"));
        assert!(err.to_string().contains("TAD ?"));
    }

    #[test]
    fn string_and_char_are_pal_d_only() {
        let toks = lex_all("\"AB\" '\\n'\n", Dialect::PalD);
        assert_eq!(toks[0], (LexKind::Str, "AB".to_string()));
        assert_eq!(toks[1], (LexKind::Char, "\\n".to_string()));

        let mut lex = Lexer::new(Cursor::new(b"NOP \"AB\"\n".to_vec()), Dialect::Pal3).unwrap();
        assert!(lex.advance().is_err());
    }

    #[test]
    fn unterminated_string_is_fatal() {
        let mut lex = Lexer::new(Cursor::new(b"NOP \"AB\n".to_vec()), Dialect::PalD).unwrap();
        let err = lex.advance().unwrap_err();
        assert!(err.to_string().contains("unterminated string"));
    }

    #[test]
    fn numeric_strictness_differs_by_dialect() {
        // loose: base letters ride along anywhere, hex digits do not
        let toks = lex_all("0x12 0x1F\n", Dialect::Pal3);
        assert_eq!(toks[0], (LexKind::Number, "0x12".to_string()));
        assert_eq!(toks[1], (LexKind::Number, "0x1".to_string()));
        assert_eq!(toks[2], (LexKind::Symbol, "F".to_string()));

        // strict: the prefix opens the hex alphabet
        let toks = lex_all("0x1F 17\n", Dialect::PalD);
        assert_eq!(toks[0], (LexKind::Number, "0x1F".to_string()));
        assert_eq!(toks[1], (LexKind::Number, "17".to_string()));
    }
}
