//! Segments: ordered runs of assembler variables, and the byte-level
//! overlap pass that lets neighboring ELF structures share bytes.
//!
//! A segment owns its variables. Construction installs the addressing
//! invariants — the segment name labels the first variable, `<name>_end`
//! labels past the last — and the head/tail mutators keep them standing.

use crate::asm::syntax::AsmSyntax;
use crate::asm::variable::{AsmVariable, Value, reconstruct};
use crate::elf::{DT_HASH, DT_NEEDED, DT_SYMTAB};
use crate::error::{Error, Result};

/// Turn a library or symbol name into label-safe form: dots become
/// underscores, leading underscores go away.
pub fn friendly_name(name: &str) -> String {
    name.replace('.', "_").trim_start_matches('_').to_string()
}

/// An ordered collection of variables with a name and a trailing end label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmSegment {
    pub name: String,
    pub desc: String,
    pub data: Vec<AsmVariable>,
}

impl AsmSegment {
    pub fn new(name: &str, desc: &str, data: Vec<AsmVariable>) -> Result<AsmSegment> {
        if data.is_empty() {
            return Err(Error::data(format!("segment '{}' is empty", name)));
        }
        let mut ret = AsmSegment {
            name: name.to_string(),
            desc: desc.to_string(),
            data,
        };
        ret.add_name_label();
        ret.add_name_end_label();
        Ok(ret)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total byte size of the segment's variables.
    pub fn byte_size(&self) -> usize {
        self.data
            .iter()
            .map(|var| match &var.value {
                Value::List(items) => items.len() * usize::from(var.size),
                Value::Quoted(qq) => qq.len().saturating_sub(2),
                _ => usize::from(var.size),
            })
            .sum()
    }

    fn add_name_label(&mut self) {
        let name = self.name.clone();
        for var in &mut self.data {
            var.remove_label_pre(&name);
        }
        if let Some(first) = self.data.first_mut() {
            first.add_label_pre(name);
        }
    }

    fn add_name_end_label(&mut self) {
        let end_label = format!("{}_end", self.name);
        for var in &mut self.data {
            var.remove_label_post(&end_label);
        }
        if let Some(last) = self.data.last_mut() {
            last.add_label_post(end_label);
        }
    }

    /// Insert variables at the head, keeping the name label on the first.
    pub fn prepend(&mut self, vars: Vec<AsmVariable>) {
        self.data.splice(0..0, vars);
        self.add_name_label();
    }

    /// Append variables at the tail, keeping the end label on the last.
    pub fn append(&mut self, vars: Vec<AsmVariable>) {
        self.data.extend(vars);
        self.add_name_end_label();
    }

    /// Prepend a DT_NEEDED entry for the given shared object. Tag and value
    /// are address-width entries.
    pub fn add_dt_needed(&mut self, addr_size: u8, library_name: &str) {
        let friendly = friendly_name(library_name);
        let d_tag = AsmVariable::new("d_tag, DT_NEEDED", addr_size, Value::Int(DT_NEEDED.into()));
        let d_un = AsmVariable::new(
            "d_un, library name offset in strtab",
            addr_size,
            Value::sym(format!("strtab_{} - strtab", friendly)),
        );
        self.prepend(vec![d_tag, d_un]);
    }

    /// Prepend a DT_SYMTAB entry pointing at the given label (or 0).
    pub fn add_dt_symtab(&mut self, addr_size: u8, value: Value) {
        let d_tag = AsmVariable::new("d_tag, DT_SYMTAB", addr_size, Value::Int(DT_SYMTAB.into()));
        let d_un = AsmVariable::new("d_un, symbol table address", addr_size, value);
        self.prepend(vec![d_tag, d_un]);
    }

    /// Prepend a DT_HASH entry pointing at the given label.
    pub fn add_dt_hash(&mut self, addr_size: u8, value: Value) {
        let d_tag = AsmVariable::new("d_tag, DT_HASH", addr_size, Value::Int(DT_HASH.into()));
        let d_un = AsmVariable::new("d_un, hash table address", addr_size, value);
        self.prepend(vec![d_tag, d_un]);
    }

    /// Append a null-terminated library name string.
    pub fn add_library_name(&mut self, library_name: &str) {
        let friendly = friendly_name(library_name);
        let libname = AsmVariable::named(
            "library name string",
            1,
            Value::quoted(library_name),
            &friendly,
        );
        let terminator = AsmVariable::new("string terminating zero", 1, Value::Int(0));
        self.append(vec![libname, terminator]);
    }

    /// Append a null-terminated symbol name string.
    pub fn add_symbol_name(&mut self, symbol_name: &str) {
        let friendly = friendly_name(symbol_name);
        let name = AsmVariable::named("symbol name", 1, Value::quoted(symbol_name), &friendly);
        let terminator = AsmVariable::new("string terminating zero", 1, Value::Int(0));
        self.append(vec![name, terminator]);
    }

    /// Emit the segment: a block comment followed by each variable.
    pub fn generate_source(&self, syntax: &AsmSyntax) -> Result<String> {
        let mut ret = syntax.format_block_comment(&self.desc);
        for var in &self.data {
            ret.push_str(&var.generate_source(syntax, 1, Some(&self.name))?);
        }
        Ok(ret)
    }

    /// Split the trailing run of deconstructible variables into byte
    /// fragments, in place. Returns the index where the fragment run
    /// starts.
    fn deconstruct_tail(&mut self) -> usize {
        let mut start = self.data.len();
        while start > 0 && self.data[start - 1].deconstructible() {
            start -= 1;
        }
        let tail: Vec<AsmVariable> = self
            .data
            .drain(start..)
            .flat_map(|var| var.deconstruct().expect("tail run is deconstructible"))
            .collect();
        self.data.extend(tail);
        start
    }

    /// Split the leading run of deconstructible variables into byte
    /// fragments, in place. Returns the number of fragment bytes at the
    /// head.
    fn deconstruct_head(&mut self) -> usize {
        let mut end = 0;
        while end < self.data.len() && self.data[end].deconstructible() {
            end += 1;
        }
        let head: Vec<AsmVariable> = self
            .data
            .drain(..end)
            .flat_map(|var| var.deconstruct().expect("head run is deconstructible"))
            .collect();
        let count = head.len();
        self.data.splice(0..0, head);
        count
    }

    fn rebuild(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.data = reconstruct(data);
    }
}

/// Attempt to overlap the tail of `first` with the head of `second`.
/// Returns true when at least one byte was shared.
fn merge_pair(first: &mut AsmSegment, second: &mut AsmSegment) -> bool {
    let tail_start = first.deconstruct_tail();
    let head_len = second.deconstruct_head();
    let tail_len = first.data.len() - tail_start;

    let mut overlap = 0;
    for candidate in 1..=tail_len.min(head_len) {
        let base = first.data.len() - candidate;
        let all_mergable = (0..candidate).all(|jj| first.data[base + jj].mergable(&second.data[jj]));
        if all_mergable {
            overlap = candidate;
        }
    }
    if overlap == 0 {
        first.rebuild();
        second.rebuild();
        return false;
    }

    log::debug!(
        "merging segments {} and {} with overlap {}",
        first.name,
        second.name,
        overlap
    );
    let base = first.data.len() - overlap;
    for jj in 0..overlap {
        let absorbed = second.data[jj].clone();
        first.data[base + jj].merge(&absorbed);
    }
    second.data.drain(..overlap);
    first.rebuild();
    second.rebuild();
    true
}

/// Run the overlap pass over adjacent segment pairs. Segments emptied by a
/// merge disappear from the list.
pub fn merge_segments(segments: &mut Vec<AsmSegment>) {
    let mut ii = 0;
    while ii + 1 < segments.len() {
        let (head, tail) = segments.split_at_mut(ii + 1);
        let merged = merge_pair(&mut head[ii], &mut tail[0]);
        if merged && segments[ii + 1].is_empty() {
            segments.remove(ii + 1);
        } else {
            ii += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_word(desc: &str) -> AsmVariable {
        AsmVariable::new(desc, 4, Value::Int(0))
    }

    fn segment_bytes(segment: &AsmSegment) -> Vec<u8> {
        let mut ret = Vec::new();
        for var in &segment.data {
            for byte in var
                .deconstruct()
                .expect("test segments hold integer data only")
            {
                if let Value::Int(ii) = byte.value {
                    ret.push(ii as u8);
                }
            }
        }
        ret
    }

    #[test]
    fn name_labels_installed_and_refreshed() {
        let mut seg = AsmSegment::new(
            "dynamic",
            "PT_DYNAMIC",
            vec![zero_word("d_tag"), zero_word("d_un")],
        )
        .unwrap();
        assert!(seg.data[0].label_pre.contains("dynamic"));
        assert!(seg.data[1].label_post.contains("dynamic_end"));
        seg.add_dt_needed(4, "libc.so");
        assert!(seg.data[0].label_pre.contains("dynamic"));
        assert!(!seg.data[2].label_pre.contains("dynamic"));
        assert_eq!(
            seg.data[1].value,
            Value::sym("strtab_libc_so - strtab")
        );
    }

    #[test]
    fn empty_segment_is_rejected() {
        assert!(AsmSegment::new("empty", "", Vec::new()).is_err());
    }

    #[test]
    fn eight_zero_bytes_overlap_fully() {
        let mut first = AsmSegment::new(
            "first",
            "",
            vec![
                AsmVariable::new("payload", 4, Value::Int(0x11111111)),
                zero_word("pad"),
                zero_word("pad"),
            ],
        )
        .unwrap();
        let mut second = AsmSegment::new(
            "second",
            "",
            vec![
                zero_word("pad"),
                zero_word("pad"),
                AsmVariable::new("payload", 4, Value::Int(0x22222222)),
            ],
        )
        .unwrap();
        let before = first.byte_size() + second.byte_size();
        assert!(merge_pair(&mut first, &mut second));
        let after = first.byte_size() + second.byte_size();
        assert_eq!(before - after, 8);
        // The second segment's name label now sits on the first segment's
        // shared tail.
        let tagged: Vec<&AsmVariable> = first
            .data
            .iter()
            .filter(|var| var.label_pre.contains("second"))
            .collect();
        assert_eq!(tagged.len(), 1);
    }

    #[test]
    fn merged_stream_is_suffix_overlap() {
        let mut segments = vec![
            AsmSegment::new(
                "one",
                "",
                vec![AsmVariable::new("", 4, Value::Int(0xaa)), zero_word("")],
            )
            .unwrap(),
            AsmSegment::new(
                "two",
                "",
                vec![zero_word(""), AsmVariable::new("", 4, Value::Int(0xbb))],
            )
            .unwrap(),
        ];
        let plain: Vec<u8> = segments.iter().flat_map(|seg| segment_bytes(seg)).collect();
        merge_segments(&mut segments);
        let merged: Vec<u8> = segments.iter().flat_map(|seg| segment_bytes(seg)).collect();
        // bytes(one) ++ bytes(two)[k..] with k = 4: the zero word overlaps.
        assert_eq!(merged.len() + 4, plain.len());
        assert_eq!(&merged[..8], &plain[..8]);
        assert_eq!(&merged[8..], &plain[12..]);
    }

    #[test]
    fn fully_absorbed_segment_is_dropped() {
        let mut segments = vec![
            AsmSegment::new("one", "", vec![zero_word(""), zero_word("")]).unwrap(),
            AsmSegment::new("two", "", vec![zero_word("")]).unwrap(),
            AsmSegment::new(
                "three",
                "",
                vec![AsmVariable::new("", 4, Value::Int(0x33))],
            )
            .unwrap(),
        ];
        merge_segments(&mut segments);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].name, "one");
        // "two" vanished, its labels live on inside "one".
        let carrier = segments[0]
            .data
            .iter()
            .find(|var| var.label_pre.contains("two"));
        assert!(carrier.is_some());
    }

    #[test]
    fn symbolic_tail_stops_the_overlap() {
        let mut first = AsmSegment::new(
            "first",
            "",
            vec![AsmVariable::new("", 4, Value::sym("end - ehdr"))],
        )
        .unwrap();
        let mut second =
            AsmSegment::new("second", "", vec![zero_word("")]).unwrap();
        assert!(!merge_pair(&mut first, &mut second));
        assert_eq!(second.data.len(), 1);
    }
}
