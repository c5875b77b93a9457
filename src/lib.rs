use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use indexmap::IndexMap;

pub mod asm;
pub mod exporter;
pub mod lexer;

/// Every word and address fits in the machine's 12 bits.
pub const WORD_MASK: i32 = 0o7777;

/// Size of the addressable core: 4096 words, numbered 0 through 0o7777.
pub const MEMORY_WORDS: usize = 0o10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// PAL-III: octal numbers with the legacy loose scan, no literals.
    Pal3,
    /// PAL-D: adds string/char literals and strict base-prefixed numbers.
    PalD,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LexKind {
    Symbol,
    Punct,
    Number,
    Comment,
    Str,
    Char,
    Eol,
    Eof,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lexeme {
    pub kind: LexKind,
    pub text: String,
    pub line: usize,
    pub column: usize,
}

impl Lexeme {
    /// First byte of the lexeme text, 0 when empty. Punct lexemes are a
    /// single byte so this is the whole story for them.
    pub fn byte(&self) -> u8 {
        self.text.as_bytes().first().copied().unwrap_or(0)
    }
}

impl Display for Lexeme {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' at {}:{}", self.text, self.line, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymKind {
    /// Memory reference instruction base opcode.
    Mri,
    /// Self-contained instruction or plain constant.
    Si,
    /// Address bound by a label definition.
    Label,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sym {
    pub kind: SymKind,
    pub val: i32,
}

const fn mri(val: i32) -> Sym {
    Sym {
        kind: SymKind::Mri,
        val,
    }
}

const fn si(val: i32) -> Sym {
    Sym {
        kind: SymKind::Si,
        val,
    }
}

const PAL_SYMBOLS: &[(&str, Sym)] = &[
    // memory reference instructions
    ("AND", mri(0o0000)),
    ("TAD", mri(0o1000)),
    ("ISZ", mri(0o2000)),
    ("DCA", mri(0o3000)),
    ("JMS", mri(0o4000)),
    ("JMP", mri(0o5000)),
    // group 1 operate instructions
    ("NOP", si(0o7000)),
    ("IAC", si(0o7001)),
    ("RAL", si(0o7004)),
    ("RTL", si(0o7006)),
    ("RAR", si(0o7010)),
    ("RTR", si(0o7012)),
    ("CML", si(0o7020)),
    ("CMA", si(0o7040)),
    ("CIA", si(0o7041)),
    ("CLL", si(0o7100)),
    ("STL", si(0o7120)),
    ("CLA", si(0o7200)), // 0o7600 does the same thing - pick your favorite
    ("GLK", si(0o7204)),
    ("STA", si(0o7240)),
    // group 2 operate instructions
    ("HLT", si(0o7402)),
    ("OSR", si(0o7404)),
    ("SKP", si(0o7410)),
    ("SNL", si(0o7420)),
    ("SZL", si(0o7430)),
    ("SZA", si(0o7440)),
    ("SNA", si(0o7450)),
    ("SMA", si(0o7500)),
    ("SPA", si(0o7510)),
    ("LAS", si(0o7604)),
    // IOT - program interrupt
    ("ION", si(0o6001)),
    ("IOF", si(0o6002)),
    // IOT - high speed perforated tape reader
    ("RSF", si(0o6011)),
    ("RRB", si(0o6012)),
    ("RFC", si(0o6014)),
    // IOT - high speed perforated tape punch
    ("PSF", si(0o6021)),
    ("PCF", si(0o6022)),
    ("PPC", si(0o6024)),
    ("PLS", si(0o6026)),
    // IOT - teletype keyboard/reader
    ("KSF", si(0o6031)),
    ("KCC", si(0o6032)),
    ("KRS", si(0o6034)),
    ("KRB", si(0o6036)),
    // IOT - teletype teleprinter/punch
    ("TSF", si(0o6041)),
    ("TCF", si(0o6042)),
    ("TPC", si(0o6044)),
    ("TLS", si(0o6046)),
];

// The MK12 clone wires the rotate-direction bit of the instruction register
// swapped, so its dialect encodes the rotate mnemonics with the opposite bit.
const MK_SYMBOLS: &[(&str, Sym)] = &[
    ("RAL", si(0o7010)),
    ("RTL", si(0o7012)),
    ("RAR", si(0o7004)),
    ("RTR", si(0o7006)),
    ("GLK", si(0o7210)),
];

/// Name to symbol mapping: a fixed instruction dictionary selected at start,
/// with user definitions layered on top. Redefinition silently overwrites -
/// later passes must be able to re-derive a provisional value.
#[derive(Debug, Clone)]
pub struct SymTab {
    syms: IndexMap<String, Sym>,
}

impl SymTab {
    pub fn pal() -> Self {
        let mut syms = IndexMap::new();
        for (name, sym) in PAL_SYMBOLS {
            syms.insert(name.to_string(), *sym);
        }
        Self { syms }
    }

    pub fn mk() -> Self {
        let mut tab = Self::pal();
        for (name, sym) in MK_SYMBOLS {
            tab.syms.insert(name.to_string(), *sym);
        }
        tab
    }

    pub fn get(&self, name: &str) -> Option<Sym> {
        self.syms.get(name).copied()
    }

    pub fn set(&mut self, name: &str, val: i32) {
        self.syms.insert(name.to_string(), si(val));
    }

    pub fn label(&mut self, name: &str, val: i32) {
        self.syms.insert(
            name.to_string(),
            Sym {
                kind: SymKind::Label,
                val,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.syms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }
}

/// The assembled core image: a sparse 12-bit address to 12-bit word map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memory {
    words: BTreeMap<u16, u16>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, addr: u16, word: u16) {
        self.words
            .insert(addr & WORD_MASK as u16, word & WORD_MASK as u16);
    }

    pub fn get(&self, addr: u16) -> Option<u16> {
        self.words.get(&addr).copied()
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Words in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.words.iter().map(|(a, w)| (*a, *w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dictionary_seeds() {
        let tab = SymTab::pal();
        assert_eq!(tab.get("TAD"), Some(mri(0o1000)));
        assert_eq!(tab.get("JMP"), Some(mri(0o5000)));
        assert_eq!(tab.get("CLA"), Some(si(0o7200)));
        assert_eq!(tab.get("KRB"), Some(si(0o6036)));
        assert_eq!(tab.get("FOO"), None);
    }

    #[test]
    fn mk_swaps_rotates() {
        let tab = SymTab::mk();
        assert_eq!(tab.get("RAL"), Some(si(0o7010)));
        assert_eq!(tab.get("RAR"), Some(si(0o7004)));
        assert_eq!(tab.get("RTL"), Some(si(0o7012)));
        assert_eq!(tab.get("RTR"), Some(si(0o7006)));
        assert_eq!(tab.get("GLK"), Some(si(0o7210)));
        // everything else is the stock dictionary
        assert_eq!(tab.get("CLA"), Some(si(0o7200)));
        assert_eq!(tab.len(), SymTab::pal().len());
    }

    #[test]
    fn redefinition_overwrites() {
        let mut tab = SymTab::pal();
        tab.set("A", 5);
        assert_eq!(tab.get("A"), Some(si(5)));
        tab.label("A", 0o200);
        assert_eq!(
            tab.get("A"),
            Some(Sym {
                kind: SymKind::Label,
                val: 0o200
            })
        );
        // the instruction dictionary itself can be shadowed
        tab.set("NOP", 1);
        assert_eq!(tab.get("NOP"), Some(si(1)));
    }

    #[test]
    fn memory_masks_to_twelve_bits() {
        let mut mem = Memory::new();
        mem.set(0o17777, 0o12345);
        assert_eq!(mem.get(0o7777), Some(0o2345));
        assert_eq!(mem.len(), 1);
    }
}
