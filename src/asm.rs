use std::collections::BTreeMap;
use std::io::{self, Read, Seek, Write};
use std::mem;

use crate::lexer::Lexer;
use crate::{LexKind, Lexeme, Memory, Sym, SymKind, SymTab, WORD_MASK};

/// Where a fresh assembly starts placing words, and where every later pass
/// restarts from.
pub const INITIAL_LC: i32 = 0o200;

/// The fixpoint loop's only runaway protection.
pub const MAX_PASSES: usize = 10;

const PAGE_MASK: i32 = 0o7600;
const IN_PAGE_MASK: i32 = 0o177;
const CURRENT_PAGE_BIT: i32 = 0o200;
const INDIRECT_BIT: i32 = 0o400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Converged { passes: usize },
    MaxPasses,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagKind {
    Syntax,
    IllegalReference,
    UndefinedSymbol,
}

impl DiagKind {
    fn label(self) -> &'static str {
        match self {
            DiagKind::Syntax => "syntax error",
            DiagKind::IllegalReference => "illegal reference",
            DiagKind::UndefinedSymbol => "undefined symbol",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diag {
    pub kind: DiagKind,
    pub lexeme: Lexeme,
    pub msg: String,
}

impl Diag {
    fn message(&self) -> String {
        if self.msg.is_empty() {
            self.kind.label().to_string()
        } else {
            format!("{}: {}", self.kind.label(), self.msg)
        }
    }
}

/// Result of evaluating one operand expression. An undefined symbol is not a
/// hard failure - it asks for another pass. `Err` means a diagnostic was
/// already recorded and the slot is tainted.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Eval {
    Value(i32),
    Undef(Lexeme),
    Err,
}

/// The assembler session: drives the lexer and evaluator over the source
/// until no forward references remain or the pass ceiling is hit. The memory
/// image and listing persist across passes and are overwritten in place;
/// everything else resets per pass.
pub struct Asm<R> {
    lex: Lexer<R>,
    symtab: SymTab,
    lc: i32,
    mem: Memory,
    listing: BTreeMap<u16, String>,
    tags: BTreeMap<u16, String>,
    apass: bool,
    depth: usize,
    undef: Vec<Lexeme>,
    diags: Vec<Diag>,
}

impl<R: Read + Seek> Asm<R> {
    pub fn new(lex: Lexer<R>, symtab: SymTab) -> Self {
        Self {
            lex,
            symtab,
            lc: INITIAL_LC,
            mem: Memory::new(),
            listing: BTreeMap::new(),
            tags: BTreeMap::new(),
            apass: false,
            depth: 0,
            undef: Vec::new(),
            diags: Vec::new(),
        }
    }

    pub fn memory(&self) -> &Memory {
        &self.mem
    }

    /// Address to trimmed source line, for the listing output.
    pub fn listing(&self) -> &BTreeMap<u16, String> {
        &self.listing
    }

    /// Address to label name, for the listing's tag column.
    pub fn tags(&self) -> &BTreeMap<u16, String> {
        &self.tags
    }

    pub fn symtab(&self) -> &SymTab {
        &self.symtab
    }

    pub fn diagnostics(&self) -> &[Diag] {
        &self.diags
    }

    pub fn has_errors(&self) -> bool {
        !self.diags.is_empty()
    }

    pub fn assemble(&mut self) -> io::Result<Outcome> {
        loop {
            self.depth += 1;
            tracing::debug!("starting pass {}", self.depth);
            self.pass()?;
            if !self.apass {
                tracing::debug!("converged after {} pass(es)", self.depth);
                tracing::debug!("symbols: {}", self.symtab.len());
                return Ok(Outcome::Converged { passes: self.depth });
            }
            if self.depth >= MAX_PASSES {
                // whatever is still on the unresolved list is never going
                // to resolve
                for lexeme in mem::take(&mut self.undef) {
                    self.diags.push(Diag {
                        kind: DiagKind::UndefinedSymbol,
                        lexeme,
                        msg: String::new(),
                    });
                }
                return Ok(Outcome::MaxPasses);
            }
            self.lc = INITIAL_LC;
            self.apass = false;
            self.undef.clear();
            self.diags.clear();
            self.lex.reset()?;
        }
    }

    /// Print the batched diagnostics with `ctx` lines of surrounding source.
    pub fn print_errors(&mut self, ctx: usize) -> io::Result<()> {
        let lines = self.lex.source_lines()?.to_vec();
        let mut out = io::stderr().lock();
        for diag in &self.diags {
            writeln!(
                out,
                "****> Error: {}: '{}'",
                diag.message(),
                diag.lexeme.text
            )?;
            print_excerpt(&mut out, &lines, &diag.lexeme, ctx)?;
        }
        Ok(())
    }

    fn pass(&mut self) -> io::Result<()> {
        loop {
            self.lex.advance()?;
            match self.lex.this.kind {
                LexKind::Punct => match self.lex.this.byte() {
                    b'*' => {
                        self.lex.advance()?;
                        match self.expression()? {
                            Eval::Value(v) => self.lc = v,
                            Eval::Undef(lexeme) => {
                                self.diag(
                                    DiagKind::IllegalReference,
                                    lexeme,
                                    "program counter set from undefined symbol",
                                );
                            }
                            Eval::Err => {}
                        }
                    }
                    b'.' | b'-' | b'+' => self.value_statement()?,
                    _ => {
                        let lexeme = self.lex.this.clone();
                        self.diag(DiagKind::Syntax, lexeme, "unexpected punctuation");
                    }
                },
                LexKind::Symbol => {
                    if self.lex.next.kind == LexKind::Punct && self.lex.next.byte() != b'.' {
                        match self.lex.next.byte() {
                            b'=' => self.symbol_definition()?,
                            b',' => self.label_definition()?,
                            b'-' | b'+' => self.value_statement()?,
                            _ => {
                                let lexeme = self.lex.next.clone();
                                self.diag(DiagKind::Syntax, lexeme, "unexpected punctuation");
                                self.skip_to_eol()?;
                            }
                        }
                    } else {
                        match self.symtab.get(&self.lex.this.text) {
                            Some(sym) if sym.kind == SymKind::Mri => {
                                self.memory_reference(sym)?
                            }
                            _ => self.value_statement()?,
                        }
                    }
                }
                LexKind::Number => self.value_statement()?,
                LexKind::Char => self.char_statement(),
                LexKind::Str => self.string_statement(),
                LexKind::Comment | LexKind::Eol | LexKind::Unknown => {}
                LexKind::Eof => return Ok(()),
            }
        }
    }

    /// A statement whose expression produces one word at the location
    /// counter. The counter advances whether or not the word could be
    /// emitted - an unresolved slot is simply absent until a later pass
    /// fills it in.
    fn value_statement(&mut self) -> io::Result<()> {
        match self.expression()? {
            Eval::Value(v) => self.add_instruction(v),
            Eval::Undef(lexeme) => {
                tracing::trace!("another pass required: {lexeme}");
                self.undef.push(lexeme);
                self.apass = true;
            }
            Eval::Err => {}
        }
        self.lc += 1;
        Ok(())
    }

    fn symbol_definition(&mut self) -> io::Result<()> {
        let name = self.lex.this.clone();
        self.lex.advance()?; // the '='
        self.lex.advance()?;
        match self.expression()? {
            Eval::Value(v) => self.symtab.set(&name.text, v),
            Eval::Undef(_) => {
                // report the defined symbol itself, not the reference that
                // blocked it
                tracing::trace!("another pass required: {name}");
                self.undef.push(name);
                self.apass = true;
            }
            Eval::Err => {}
        }
        Ok(())
    }

    fn label_definition(&mut self) -> io::Result<()> {
        let name = self.lex.this.text.clone();
        self.symtab.label(&name, self.lc);
        self.tags.insert((self.lc & WORD_MASK) as u16, name);
        self.lex.advance()?; // the ','
        Ok(())
    }

    fn memory_reference(&mut self, sym: Sym) -> io::Result<()> {
        let mri = self.lex.this.clone();
        self.lex.advance()?;
        let mut indirect = false;
        while self.lex.this.kind == LexKind::Symbol {
            match self.lex.this.text.as_str() {
                "I" => indirect = true,
                // Z is accepted for compatibility; a page zero operand
                // clears the page bit on its own
                "Z" => {}
                _ => break,
            }
            self.lex.advance()?;
        }
        match self.expression()? {
            Eval::Value(result) => {
                let mut word = sym.val | (result & IN_PAGE_MASK);
                let page = result & PAGE_MASK;
                if page != 0 {
                    if page != self.lc & PAGE_MASK {
                        // only the current page and page zero are reachable
                        // without indirection; emit the word best-effort
                        self.diag(DiagKind::IllegalReference, mri, "operand is out of page");
                    }
                    word |= CURRENT_PAGE_BIT;
                }
                if indirect {
                    word |= INDIRECT_BIT;
                }
                self.add_instruction(word);
            }
            Eval::Undef(lexeme) => {
                tracing::trace!("another pass required: {lexeme}");
                self.undef.push(lexeme);
                self.apass = true;
            }
            Eval::Err => {}
        }
        self.lc += 1;
        Ok(())
    }

    fn char_statement(&mut self) {
        let lexeme = self.lex.this.clone();
        let bytes = lexeme.text.as_bytes();
        let word = if bytes.len() == 2 && bytes[0] == b'\\' {
            match unescape(bytes[1]) {
                Some(c) => c as i32,
                None => {
                    self.diag(DiagKind::Syntax, lexeme, "unknown escape");
                    self.lc += 1;
                    return;
                }
            }
        } else if bytes.len() == 1 {
            bytes[0] as i32
        } else {
            self.diag(
                DiagKind::Syntax,
                lexeme,
                "more than one character in character literal",
            );
            self.lc += 1;
            return;
        };
        self.add_instruction(word);
        self.lc += 1;
    }

    /// One word per character plus a NUL terminator word.
    fn string_statement(&mut self) {
        let lexeme = self.lex.this.clone();
        let bytes = lexeme.text.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let mut c = bytes[i];
            if c == b'\\' && i + 1 < bytes.len() {
                i += 1;
                match unescape(bytes[i]) {
                    Some(e) => c = e,
                    None => {
                        // keep scanning with the literal byte
                        self.diag(DiagKind::Syntax, lexeme.clone(), "unknown escape");
                        c = bytes[i];
                    }
                }
            }
            self.add_instruction(c as i32);
            self.lc += 1;
            i += 1;
        }
        self.add_instruction(0);
        self.lc += 1;
    }

    /// Evaluate an operand expression starting at the current lexeme. Five
    /// shapes, told apart by lookahead: literal, unary, location-relative,
    /// binary, and the two-symbol disjunction.
    fn expression(&mut self) -> io::Result<Eval> {
        match self.lex.this.kind {
            LexKind::Punct if self.lex.this.byte() == b'.' => {
                if self.lex.next.kind == LexKind::Punct {
                    self.lex.advance()?; // the sign
                    self.lex.advance()?;
                    let sign = self.lex.prev.clone();
                    let b = match self.operand() {
                        Eval::Value(v) => v,
                        other => return Ok(other),
                    };
                    match sign.byte() {
                        b'+' => Ok(Eval::Value(self.lc + b)),
                        b'-' => Ok(Eval::Value(self.lc - b)),
                        _ => {
                            self.diag(DiagKind::Syntax, sign, "unknown operation");
                            Ok(Eval::Err)
                        }
                    }
                } else if is_end(self.lex.next.kind) {
                    // bare '.' is the location counter itself
                    Ok(Eval::Value(self.lc))
                } else {
                    let lexeme = self.lex.next.clone();
                    self.diag(DiagKind::Syntax, lexeme, "unknown syntax");
                    Ok(Eval::Err)
                }
            }
            LexKind::Punct => {
                let sign = self.lex.this.clone();
                self.lex.advance()?;
                let a = match self.operand() {
                    Eval::Value(v) => v,
                    other => return Ok(other),
                };
                match sign.byte() {
                    b'+' => Ok(Eval::Value(a)),
                    b'-' => Ok(Eval::Value(-a)),
                    _ => {
                        self.diag(DiagKind::Syntax, sign, "unknown operation");
                        Ok(Eval::Err)
                    }
                }
            }
            LexKind::Symbol | LexKind::Number if self.lex.next.kind == LexKind::Punct => {
                let a = match self.operand() {
                    Eval::Value(v) => v,
                    other => {
                        self.skip_to_eol()?;
                        return Ok(other);
                    }
                };
                self.lex.advance()?; // the sign
                self.lex.advance()?;
                let sign = self.lex.prev.clone();
                let b = match self.operand() {
                    Eval::Value(v) => v,
                    other => {
                        self.skip_to_eol()?;
                        return Ok(other);
                    }
                };
                let ans = match sign.byte() {
                    b'+' => a + b,
                    b'-' => a - b,
                    _ => {
                        self.diag(DiagKind::Syntax, sign, "unknown operation");
                        return Ok(Eval::Err);
                    }
                };
                // a negative result folds into its 12-bit two's complement
                // here; the unary and location-relative forms stay raw
                if ans < 0 {
                    Ok(Eval::Value(ans & WORD_MASK))
                } else {
                    Ok(Eval::Value(ans))
                }
            }
            LexKind::Symbol if self.lex.next.kind == LexKind::Symbol => {
                // A B - or the two values together (the old sources call
                // this "and", the exercised behavior has always been or)
                let a = self.lex.this.clone();
                self.lex.advance()?;
                let b = self.lex.this.clone();
                let Some(asym) = self.symtab.get(&a.text) else {
                    return Ok(Eval::Undef(a));
                };
                let Some(bsym) = self.symtab.get(&b.text) else {
                    return Ok(Eval::Undef(b));
                };
                Ok(Eval::Value(asym.val | bsym.val))
            }
            LexKind::Symbol | LexKind::Number if is_end(self.lex.next.kind) => Ok(self.operand()),
            _ => {
                let lexeme = self.lex.this.clone();
                self.diag(DiagKind::Syntax, lexeme, "unknown syntax");
                Ok(Eval::Err)
            }
        }
    }

    /// The current lexeme as a plain value: a symbol looked up in the table
    /// or a number parsed per the dialect's base rules.
    fn operand(&mut self) -> Eval {
        match self.lex.this.kind {
            LexKind::Symbol => match self.symtab.get(&self.lex.this.text) {
                Some(sym) => Eval::Value(sym.val),
                None => Eval::Undef(self.lex.this.clone()),
            },
            LexKind::Number => match self.number() {
                Some(v) => Eval::Value(v),
                None => Eval::Err,
            },
            _ => {
                let lexeme = self.lex.this.clone();
                self.diag(DiagKind::Syntax, lexeme, "unknown expression operand");
                Eval::Err
            }
        }
    }

    /// Octal by default; an explicit `0x`/`0o`/`0b` prefix sets the base and
    /// `0d` strips down to decimal. Everything passes through the 16-bit
    /// intermediate representation, so larger literals are an error.
    fn number(&mut self) -> Option<i32> {
        let text = self.lex.this.text.clone();
        let bytes = text.as_bytes();
        let parsed = if bytes.len() > 2 && bytes[0] == b'0' && bytes[1].is_ascii_alphabetic() {
            match bytes[1] {
                b'd' => i16::from_str_radix(&text[2..], 10),
                b'x' => i16::from_str_radix(&text[2..], 16),
                b'o' => i16::from_str_radix(&text[2..], 8),
                b'b' => i16::from_str_radix(&text[2..], 2),
                _ => i16::from_str_radix(&text, 8),
            }
        } else {
            i16::from_str_radix(&text, 8)
        };
        match parsed {
            Ok(v) => Some(v as i32),
            Err(_) => {
                let lexeme = self.lex.this.clone();
                self.diag(DiagKind::Syntax, lexeme, "bad number (too large?)");
                None
            }
        }
    }

    fn add_instruction(&mut self, word: i32) {
        let addr = (self.lc & WORD_MASK) as u16;
        self.mem.set(addr, (word & WORD_MASK) as u16);
        let line = self.lex.raw_line(self.lex.this.line).trim().to_string();
        self.listing.insert(addr, line);
    }

    fn skip_to_eol(&mut self) -> io::Result<()> {
        while !matches!(self.lex.this.kind, LexKind::Eol | LexKind::Eof) {
            self.lex.advance()?;
        }
        Ok(())
    }

    fn diag(&mut self, kind: DiagKind, lexeme: Lexeme, msg: &str) {
        self.diags.push(Diag {
            kind,
            lexeme,
            msg: msg.to_string(),
        });
    }
}

fn is_end(kind: LexKind) -> bool {
    matches!(kind, LexKind::Comment | LexKind::Eol | LexKind::Eof)
}

fn unescape(c: u8) -> Option<u8> {
    match c {
        b'n' => Some(b'\n'),
        b'r' => Some(b'\r'),
        b't' => Some(b'\t'),
        b'\\' => Some(b'\\'),
        _ => None,
    }
}

fn print_excerpt<W: Write>(
    out: &mut W,
    lines: &[String],
    lexeme: &Lexeme,
    ctx: usize,
) -> io::Result<()> {
    if lexeme.line == 0 || lexeme.line > lines.len() {
        return Ok(());
    }
    let first = lexeme.line.saturating_sub(ctx).max(1);
    for num in first..lexeme.line {
        writeln!(out, "{:>3} | {}", num, lines[num - 1])?;
    }
    writeln!(out, "{:>3} | {}", lexeme.line, lines[lexeme.line - 1])?;
    writeln!(
        out,
        "      {:>col$}{}",
        "^",
        "~".repeat(lexeme.text.len().saturating_sub(1)),
        col = lexeme.column,
    )?;
    for num in (lexeme.line + 1)..=(lexeme.line + ctx) {
        match lines.get(num - 1) {
            Some(line) => writeln!(out, "{:>3} | {}", num, line)?,
            None => break,
        }
    }
    writeln!(out)
}
