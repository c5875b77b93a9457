use std::collections::BTreeMap;
use std::io::{self, Write};

use crate::{Memory, MEMORY_WORDS};

// Leader/trailer byte for RIM tapes: 1000 0000.
const RIM_LEADER: u8 = 0o200;

impl Memory {
    /// Object file in the format used by pdpnasm: one octal number per
    /// line. A line with bits 12-15 set moves the origin; the lines after
    /// it are consecutive words from that address. A program starting at
    /// address 0 needs no leading origin line.
    pub fn export_pobj<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut last: i32 = -1;
        for (addr, word) in self.iter() {
            if addr as i32 > last + 1 {
                writeln!(w, "{:o}", addr as i32 | 0o170000)?;
            }
            writeln!(w, "{:o}", word)?;
            last = addr as i32;
        }
        Ok(())
    }

    /// Read-in mode paper tape, the format of the original PDP-8 bootstrap
    /// loader. Each word is four 6-bit frames, strictly ascending by
    /// address: two address bytes (the first with bit 7 set) then two data
    /// bytes, the whole tape framed by leader/trailer bytes.
    pub fn export_rim<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut tape = vec![RIM_LEADER, RIM_LEADER];
        for (addr, word) in self.iter() {
            tape.push(((addr >> 6) & 0o77) as u8 | 0o100);
            tape.push((addr & 0o77) as u8);
            tape.push(((word >> 6) & 0o77) as u8);
            tape.push((word & 0o77) as u8);
        }
        tape.push(RIM_LEADER);
        tape.push(RIM_LEADER);
        w.write_all(&tape)
    }

    /// `base?core=` followed by comma separated octal words; a gap in the
    /// address space is flagged with a `*0<addr>,` marker before the next
    /// word.
    pub fn export_url(&self, base: &str) -> String {
        let mut link = format!("{base}?core=");
        let mut last: i32 = -1;
        let count = self.len();
        for (i, (addr, word)) in self.iter().enumerate() {
            if addr as i32 > last + 1 {
                link.push_str(&format!("*0{addr:o},"));
            }
            if i == count - 1 {
                link.push_str(&format!("0{word:o}"));
            } else {
                link.push_str(&format!("0{word:o},"));
            }
            last = addr as i32;
        }
        link
    }

    /// Tab aligned debug listing: address, word, tag, source fragment,
    /// trailing comment. Rows produced by string statements get an ASCII
    /// annotation for printable word values.
    pub fn export_listing<W: Write>(
        &self,
        w: &mut W,
        listing: &BTreeMap<u16, String>,
        tags: &BTreeMap<u16, String>,
    ) -> io::Result<()> {
        writeln!(w, "Abs\tInst")?;
        writeln!(w, "Addr\tData\tTag\t\tInstruction")?;
        writeln!(w, "-----\t----\t--------\t-----------")?;
        let mut last: i32 = -1;
        for (addr, word) in self.iter() {
            if last >= 0 && addr as i32 - last > 1 {
                writeln!(w, "    :")?;
            }
            let mut line = listing.get(&addr).cloned().unwrap_or_default();
            let tag = match tags.get(&addr) {
                Some(name) => {
                    let mut tag = format!("{name},");
                    if let Some(rest) = line.strip_prefix(tag.as_str()) {
                        line = rest.trim().to_string();
                    }
                    if tag.len() < 8 {
                        tag.push('\t');
                    }
                    tag
                }
                None => "\t".to_string(),
            };
            let mut comment = String::new();
            if let Some(slash) = line.find('/') {
                comment = format!("/ {}", line[slash + 1..].trim());
                line = line[..slash].trim().to_string();
                if line.len() < 8 {
                    line.push_str("\t\t");
                } else if line.len() < 16 {
                    line.push('\t');
                }
            }
            if line.contains('"') {
                // only the row that carries the tag keeps the source text;
                // continuation rows are annotated with their character
                if tag == "\t" {
                    line = "\t\t".to_string();
                    if comment.is_empty() {
                        comment = char_note(word);
                    }
                } else if line.len() < 24 && comment.is_empty() {
                    comment = char_note(word);
                }
            }
            writeln!(w, "{addr:04o},\t{word:04o}\t{tag}\t{line}\t{comment}")?;
            last = addr as i32;
        }
        writeln!(w, "$")
    }

    pub fn export_size(&self) -> String {
        let used = self.len();
        format!(
            "used: {}  free: {}  total: {} (words)",
            used,
            MEMORY_WORDS - used,
            MEMORY_WORDS
        )
    }
}

fn char_note(word: u16) -> String {
    match word {
        0 => "/ NULL".to_string(),
        10 => "/ \"\\n\"".to_string(),
        0x20..=0x7e => format!("/ \"{}\"", word as u8 as char),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Memory {
        let mut mem = Memory::new();
        mem.set(0o200, 0o7200);
        mem.set(0o201, 0o1005);
        mem.set(0o300, 0o5200);
        mem
    }

    #[test]
    fn pobj_marks_origins() {
        let mut out = Vec::new();
        sample().export_pobj(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "170200\n7200\n1005\n170300\n5200\n");
    }

    #[test]
    fn pobj_address_zero_needs_no_origin() {
        let mut mem = Memory::new();
        mem.set(0, 0o7000);
        mem.set(1, 0o7402);
        let mut out = Vec::new();
        mem.export_pobj(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "7000\n7402\n");
    }

    #[test]
    fn rim_frames_each_word() {
        let mut mem = Memory::new();
        mem.set(0o200, 0o1005);
        let mut out = Vec::new();
        mem.export_rim(&mut out).unwrap();
        assert_eq!(
            out,
            vec![0o200, 0o200, 0o102, 0o000, 0o010, 0o005, 0o200, 0o200]
        );
    }

    #[test]
    fn url_marks_gaps() {
        let url = sample().export_url("http://localhost");
        assert_eq!(url, "http://localhost?core=*0200,07200,01005,*0300,05200");
    }

    #[test]
    fn size_report_counts_words() {
        assert_eq!(
            sample().export_size(),
            "used: 3  free: 4093  total: 4096 (words)"
        );
    }

    #[test]
    fn listing_shows_tags_and_gaps() {
        let mut listing = BTreeMap::new();
        listing.insert(0o200, "START, CLA /clear".to_string());
        listing.insert(0o201, "TAD 5".to_string());
        listing.insert(0o300, "JMP START".to_string());
        let mut tags = BTreeMap::new();
        tags.insert(0o200, "START".to_string());
        let mut out = Vec::new();
        sample()
            .export_listing(&mut out, &listing, &tags)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("0200,\t7200\tSTART,\t\tCLA\t\t\t/ clear"));
        assert!(text.contains("0201,\t1005\t\t\tTAD 5\t"));
        assert!(text.contains("    :"));
        assert!(text.ends_with("$\n"));
    }
}
