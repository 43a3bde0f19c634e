//! A single assembler data element.
//!
//! Everything the generated image is made of — ELF header fields, dynamic
//! entries, string table bytes — is an [`AsmVariable`]: a sized value with
//! optional descriptions, an optional name, and ordered label sets emitted
//! before and after the datum. Integer-valued variables can be taken apart
//! into byte fragments and put back together, which is what lets adjacent
//! structures share overlapping bytes.

use indexmap::IndexSet;
use scroll::{LE, Pwrite};

use crate::asm::syntax::AsmSyntax;
use crate::error::{Error, Result};

/// Sentinel for `original_size`: the variable is not a byte fragment.
pub const NOT_DECONSTRUCTED: i8 = -1;

/// The value a variable carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Plain integer, emitted in hex, truncated two's-complement to the
    /// variable's width.
    Int(i128),
    /// String literal in quoted source form, e.g. `"ELF"`.
    Quoted(String),
    /// Symbolic expression resolved by the assembler, e.g. `ehdr_end - ehdr`.
    Sym(String),
    /// Several values sharing one directive line.
    List(Vec<Value>),
}

impl Value {
    pub fn sym(expr: impl Into<String>) -> Value {
        Value::Sym(expr.into())
    }

    pub fn quoted(text: &str) -> Value {
        Value::Quoted(format!("\"{}\"", text))
    }

    pub fn zeroes(count: usize) -> Value {
        Value::List(vec![Value::Int(0); count])
    }

    /// Integer payload(s), if the value is made of nothing else.
    fn as_ints(&self) -> Option<Vec<i128>> {
        match self {
            Value::Int(ii) => Some(vec![*ii]),
            Value::List(items) => items
                .iter()
                .map(|item| match item {
                    Value::Int(ii) => Some(*ii),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }
}

/// Truncate to `size` bytes and render as hex.
fn render_int(value: i128, size: u8) -> String {
    let mask: u128 = if size >= 16 {
        u128::MAX
    } else {
        (1u128 << (u32::from(size) * 8)) - 1
    };
    format!("{:#x}", (value as u128) & mask)
}

/// Little-endian image of an integer, truncated two's-complement.
fn pack_le(value: i128, size: u8) -> Vec<u8> {
    let mut buf = vec![0u8; usize::from(size)];
    match size {
        1 => buf[0] = value as u8,
        2 => {
            buf.pwrite_with(value as u16, 0, LE).unwrap();
        }
        4 => {
            buf.pwrite_with(value as u32, 0, LE).unwrap();
        }
        8 => {
            buf.pwrite_with(value as u64, 0, LE).unwrap();
        }
        _ => unreachable!("deconstruct only splits sizes 1/2/4/8"),
    }
    buf
}

/// One assembler data element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmVariable {
    pub desc: Vec<String>,
    pub size: u8,
    pub value: Value,
    pub name: Option<String>,
    /// Width of the constant this byte was split from, or
    /// [`NOT_DECONSTRUCTED`]. When positive the variable's own size is 1.
    pub original_size: i8,
    pub label_pre: IndexSet<String>,
    pub label_post: IndexSet<String>,
}

impl AsmVariable {
    pub fn new(desc: &str, size: u8, value: Value) -> AsmVariable {
        AsmVariable {
            desc: if desc.is_empty() {
                Vec::new()
            } else {
                vec![desc.to_string()]
            },
            size,
            value,
            name: None,
            original_size: NOT_DECONSTRUCTED,
            label_pre: IndexSet::new(),
            label_post: IndexSet::new(),
        }
    }

    pub fn named(desc: &str, size: u8, value: Value, name: &str) -> AsmVariable {
        let mut ret = AsmVariable::new(desc, size, value);
        ret.name = Some(name.to_string());
        ret
    }

    pub fn add_label_pre(&mut self, label: impl Into<String>) {
        self.label_pre.insert(label.into());
    }

    pub fn add_label_post(&mut self, label: impl Into<String>) {
        self.label_post.insert(label.into());
    }

    pub fn remove_label_pre(&mut self, label: &str) {
        self.label_pre.shift_remove(label);
    }

    pub fn remove_label_post(&mut self, label: &str) {
        self.label_post.shift_remove(label);
    }

    /// Whether [`deconstruct`](Self::deconstruct) can split this variable.
    pub fn deconstructible(&self) -> bool {
        self.value.as_ints().is_some()
    }

    /// Split an integer (or integer-list) variable into byte fragments in
    /// little-endian order. The first byte inherits description, name and
    /// pre-labels; the last inherits post-labels; the leading byte of each
    /// split constant remembers the original width so the fragments can be
    /// rebuilt. Non-integer variables return None, telling the caller its
    /// byte stream stops here.
    pub fn deconstruct(&self) -> Option<Vec<AsmVariable>> {
        let ints = self.value.as_ints()?;
        let mut out: Vec<AsmVariable> = Vec::new();
        for (index, value) in ints.iter().enumerate() {
            for (offset, byte) in pack_le(*value, self.size).into_iter().enumerate() {
                let mut var = AsmVariable::new("", 1, Value::Int(i128::from(byte)));
                if index == 0 && offset == 0 {
                    var.desc = self.desc.clone();
                    var.name = self.name.clone();
                    var.label_pre = self.label_pre.clone();
                }
                if offset == 0 && self.size > 1 {
                    var.original_size = self.size as i8;
                }
                out.push(var);
            }
        }
        if let Some(last) = out.last_mut() {
            last.label_post = self.label_post.clone();
        }
        Some(out)
    }

    /// A byte that cannot be absorbed into a reconstructed constant:
    /// anything carrying its own identity. A post-label is tolerated only
    /// on the final byte of the fragment being rebuilt.
    fn is_plain_byte(&self, is_fragment_end: bool) -> bool {
        self.size == 1
            && self.original_size == NOT_DECONSTRUCTED
            && matches!(self.value, Value::Int(_))
            && self.desc.is_empty()
            && self.name.is_none()
            && self.label_pre.is_empty()
            && (is_fragment_end || self.label_post.is_empty())
    }

    /// Whether the two variables may occupy the same byte: single bytes of
    /// equal numeric value.
    pub fn mergable(&self, other: &AsmVariable) -> bool {
        if self.size != 1 || other.size != 1 {
            return false;
        }
        match (&self.value, &other.value) {
            (Value::Int(lhs), Value::Int(rhs)) => (*lhs as u8) == (*rhs as u8),
            _ => false,
        }
    }

    /// Fold another variable's identity into this one. The labels the other
    /// byte carried stay addressable from here on.
    pub fn merge(&mut self, other: &AsmVariable) {
        self.desc.extend(other.desc.iter().cloned());
        match (&self.name, &other.name) {
            (None, Some(name)) => self.name = Some(name.clone()),
            (Some(mine), Some(theirs)) if mine != theirs => {
                // Keep the second name reachable as a plain label.
                self.label_pre.insert(theirs.clone());
            }
            _ => {}
        }
        for label in &other.label_pre {
            self.label_pre.insert(label.clone());
        }
        for label in &other.label_post {
            self.label_post.insert(label.clone());
        }
    }

    fn render_value(&self) -> String {
        fn render(value: &Value, size: u8) -> String {
            match value {
                Value::Int(ii) => render_int(*ii, size),
                Value::Quoted(qq) => qq.clone(),
                Value::Sym(ss) => ss.clone(),
                Value::List(items) => items
                    .iter()
                    .map(|item| render(item, size))
                    .collect::<Vec<_>>()
                    .join(", "),
            }
        }
        render(&self.value, self.size)
    }

    /// Emit assembler source for this variable. `segment_label` is the
    /// owning segment's name; named string literals get an extra
    /// `<segment>_<name>` label so other structures can reference them.
    pub fn generate_source(
        &self,
        syntax: &AsmSyntax,
        indent: usize,
        segment_label: Option<&str>,
    ) -> Result<String> {
        let indent_str = "  ".repeat(indent);
        let mut ret = String::new();
        for label in &self.label_pre {
            ret.push_str(&syntax.format_label(label));
        }
        if matches!(self.value, Value::Quoted(_)) {
            if let (Some(name), Some(label)) = (&self.name, segment_label) {
                ret.push_str(&syntax.format_label(&format!("{}_{}", label, name)));
            }
        }
        ret.push_str(&syntax.format_comment(self.desc.iter().map(String::as_str), &indent_str));
        match &self.value {
            Value::Quoted(qq) if self.size == 1 => {
                ret.push_str(&syntax.format_string(qq, &indent_str));
            }
            _ => {
                let rendered = self.render_value();
                let line = syntax
                    .format_data(self.size, &rendered, &indent_str)
                    .ok_or_else(|| {
                        Error::data(format!(
                            "cannot export assembler value of size {}",
                            self.size
                        ))
                    })?;
                ret.push_str(&line);
            }
        }
        for label in &self.label_post {
            ret.push_str(&syntax.format_label(label));
        }
        Ok(ret)
    }
}

/// Rebuild wide constants from a deconstructed byte stream. Fragments whose
/// interior bytes picked up labels or other identity stay as single bytes;
/// everything else folds back to its original width.
pub fn reconstruct(vars: Vec<AsmVariable>) -> Vec<AsmVariable> {
    let mut out = Vec::new();
    let mut ii = 0;
    while ii < vars.len() {
        let var = &vars[ii];
        if var.size == 1 && var.original_size > 1 {
            let span = var.original_size as usize;
            // A post-label on the leading byte names the address after that
            // byte; folding it into a wider constant would move it.
            let fits = var.label_post.is_empty()
                && ii + span <= vars.len()
                && vars[ii + 1..ii + span]
                    .iter()
                    .enumerate()
                    .all(|(jj, byte)| byte.is_plain_byte(jj == span - 2));
            if fits {
                let mut word: u128 = 0;
                for (jj, byte) in vars[ii..ii + span].iter().enumerate() {
                    if let Value::Int(bb) = byte.value {
                        word |= u128::from(bb as u8) << (jj * 8);
                    }
                }
                let rebuilt = AsmVariable {
                    desc: var.desc.clone(),
                    size: span as u8,
                    value: Value::Int(word as i128),
                    name: var.name.clone(),
                    original_size: NOT_DECONSTRUCTED,
                    label_pre: var.label_pre.clone(),
                    label_post: vars[ii + span - 1].label_post.clone(),
                };
                out.push(rebuilt);
                ii += span;
                continue;
            }
        }
        out.push(var.clone());
        ii += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labeled(desc: &str, size: u8, value: i128) -> AsmVariable {
        let mut var = AsmVariable::named(desc, size, Value::Int(value), "thing");
        var.add_label_pre("front");
        var.add_label_post("back");
        var
    }

    #[test]
    fn deconstruct_reconstruct_round_trip() {
        for (size, value) in [(2u8, 0x1234i128), (4, 0xdeadbeef), (8, 0x0123456789abcdef)] {
            let var = labeled("field", size, value);
            let bytes = var.deconstruct().unwrap();
            assert_eq!(bytes.len(), usize::from(size));
            assert!(bytes.iter().all(|bb| bb.size == 1));
            let rebuilt = reconstruct(bytes);
            assert_eq!(rebuilt.len(), 1);
            assert_eq!(rebuilt[0], var);
        }
    }

    #[test]
    fn deconstruct_is_little_endian() {
        let var = AsmVariable::new("", 4, Value::Int(0x11223344));
        let bytes = var.deconstruct().unwrap();
        let raw: Vec<i128> = bytes
            .iter()
            .map(|bb| match bb.value {
                Value::Int(ii) => ii,
                _ => panic!("expected int fragment"),
            })
            .collect();
        assert_eq!(raw, [0x44, 0x33, 0x22, 0x11]);
        assert_eq!(bytes[0].original_size, 4);
        assert_eq!(bytes[1].original_size, NOT_DECONSTRUCTED);
    }

    #[test]
    fn negative_values_truncate() {
        let var = AsmVariable::new("", 2, Value::Int(-1));
        let bytes = var.deconstruct().unwrap();
        assert_eq!(bytes[0].value, Value::Int(0xff));
        assert_eq!(bytes[1].value, Value::Int(0xff));
        assert_eq!(var.render_value(), "0xffff");
    }

    #[test]
    fn symbolic_values_do_not_deconstruct() {
        let var = AsmVariable::new("", 4, Value::sym("ehdr_end - ehdr"));
        assert!(!var.deconstructible());
        assert!(var.deconstruct().is_none());
        let quoted = AsmVariable::new("", 1, Value::quoted("ELF"));
        assert!(quoted.deconstruct().is_none());
    }

    #[test]
    fn list_deconstructs_per_element() {
        let var = AsmVariable::new("", 2, Value::List(vec![Value::Int(1), Value::Int(2)]));
        let bytes = var.deconstruct().unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(bytes[0].original_size, 2);
        assert_eq!(bytes[2].original_size, 2);
        let rebuilt = reconstruct(bytes);
        assert_eq!(rebuilt.len(), 2);
        assert_eq!(rebuilt[0].value, Value::Int(1));
        assert_eq!(rebuilt[1].value, Value::Int(2));
    }

    #[test]
    fn labeled_interior_byte_blocks_reconstruction() {
        let var = labeled("field", 4, 0);
        let mut bytes = var.deconstruct().unwrap();
        bytes[2].add_label_pre("stolen");
        let rebuilt = reconstruct(bytes);
        assert_eq!(rebuilt.len(), 4);
    }

    #[test]
    fn merge_unions_identity() {
        let mut lhs = AsmVariable::new("tail zero", 1, Value::Int(0));
        lhs.add_label_post("first_end");
        let mut rhs = AsmVariable::named("head zero", 1, Value::Int(0), "second");
        rhs.add_label_pre("second_start");
        assert!(lhs.mergable(&rhs));
        lhs.merge(&rhs);
        assert_eq!(lhs.desc, ["tail zero", "head zero"]);
        assert_eq!(lhs.name.as_deref(), Some("second"));
        assert!(lhs.label_pre.contains("second_start"));
        assert!(lhs.label_post.contains("first_end"));
        let wide = AsmVariable::new("", 4, Value::Int(0));
        assert!(!wide.mergable(&lhs));
    }

    #[test]
    fn quoted_value_with_name_gets_segment_label() {
        let var = AsmVariable::named("library name", 1, Value::quoted("libc.so"), "libc_so");
        let text = var
            .generate_source(&AsmSyntax::gas(), 1, Some("strtab"))
            .unwrap();
        assert!(text.contains("strtab_libc_so:\n"));
        assert!(text.contains(".ascii \"libc.so\"\n"));
    }
}
