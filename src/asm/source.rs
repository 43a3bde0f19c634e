//! Compiler-emitted assembler source: parsing, crunching, fake `.bss`.
//!
//! The input is whatever the C compiler produced with `-S`. Once normal
//! linking is abandoned, most of its directives are dead weight; the crunch
//! passes strip them, cut the entry prologue and exit epilogue, and lift
//! zero-initialized objects out into an address-only `.bss` built from
//! `.equ` bindings at the end of the image.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::platform::Platform;

/// Fake `.bss` sizes above this need their own PT_LOAD.
pub const BSS_DOUBLE_LOAD_LIMIT: u64 = 128 * 1024 * 1024;

/// Entry offsets inside the fake `.bss` round up to this.
const BSS_ALIGNMENT: u64 = 4;

static SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s+\.section\s+"?\.([A-Za-z0-9_]+)(?:[.\s]|$)"#).unwrap()
});
static DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\.(?:file|globl|ident|section|type|size)\s").unwrap()
});
static BARE_SECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\.(?:bss|data|text)(?:\s|$)").unwrap());
static START_LABEL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*_start:").unwrap());
static PUSH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*push(\S*)\s").unwrap());
static XOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*xor\S*\s").unwrap());
static SUB_SP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)sub([lq]?)\s+\$(\d+)\s*,\s*%([er]sp)").unwrap()
});
static SYSCALL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*syscall").unwrap());
static INTERRUPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*int\s+\$?(\S+)").unwrap());
static LABEL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*[^\s:]+:").unwrap());
static ALIGN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r".*\.align\s").unwrap());
static GLOBL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*\.globl\s+(\S+)").unwrap());
static TYPE_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\.type\s+(\S+?)\s*,\s*@object").unwrap());
static NAME_LABEL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*([^\s:]+):").unwrap());
static ZERO: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*\.zero\s+(\d+)").unwrap());
static LOCAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*\.local\s+(\S+)").unwrap());
static COMM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\.comm\s+(\S+?)\s*,\s*(.*)").unwrap());
static COMM_SIZE_ALIGN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s*,\s*(\d+)").unwrap());

/// One section of a compiler-emitted `.s` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmSection {
    pub name: String,
    /// The original `.section` directive line, kept so an unmodified parse
    /// writes back byte-identically. Cleared by crunching.
    pub tag: Option<String>,
    pub lines: Vec<String>,
}

impl AsmSection {
    fn new(name: &str, tag: Option<String>) -> AsmSection {
        AsmSection {
            name: name.to_string(),
            tag,
            lines: Vec::new(),
        }
    }

    pub fn has_content(&self) -> bool {
        !self.lines.is_empty()
    }

    fn find_from(&self, regex: &Regex, first: usize) -> Option<(usize, String)> {
        self.lines[first..].iter().enumerate().find_map(|(ii, line)| {
            regex
                .captures(line)
                .map(|caps| (first + ii, caps.get(1).map_or(String::new(), |mm| mm.as_str().to_string())))
        })
    }

    /// Strip every directive that only matters to a normal linker, then run
    /// the architecture passes.
    pub fn crunch(&mut self, platform: &Platform) -> Result<()> {
        self.lines
            .retain(|line| !DIRECTIVE.is_match(line) && !BARE_SECTION.is_match(line));
        if platform.is_amd64() {
            self.crunch_entry_prologue(platform)?;
            self.crunch_exit_epilogue(|line| SYSCALL.is_match(line));
        } else if platform.is_ia32() {
            self.crunch_entry_prologue(platform)?;
            self.crunch_exit_epilogue(|line| {
                INTERRUPT
                    .captures(line)
                    .is_some_and(|caps| matches!(&caps[1], "0x80" | "128"))
            });
        }
        self.tag = None;
        Ok(())
    }

    /// Remove the register-save prologue after `_start`. There is no caller
    /// to preserve registers for; a stack-frame `sub` directly after the
    /// pushes absorbs their cumulative offset instead.
    fn crunch_entry_prologue(&mut self, platform: &Platform) -> Result<()> {
        let Some((start, _)) = self.find_from(&START_LABEL, 0) else {
            return Ok(());
        };
        let mut offset: u64 = 0;
        let mut pushes = Vec::new();
        let mut ii = start + 1;
        while ii < self.lines.len() {
            let line = &self.lines[ii];
            if let Some(caps) = PUSH.captures(line) {
                offset += push_width(&caps[1], platform)?;
                pushes.push(ii);
                ii += 1;
            } else if XOR.is_match(line) {
                // Zeroing a register, not stack bookkeeping; stays.
                ii += 1;
            } else {
                break;
            }
        }
        if pushes.is_empty() {
            return Ok(());
        }
        if ii < self.lines.len() {
            let rewritten = match SUB_SP.captures(&self.lines[ii]) {
                Some(caps) => {
                    let immediate: u64 = caps[3].parse().map_err(|_| {
                        Error::parse(format!("bad stack adjustment: {}", &caps[0]))
                    })?;
                    Some(format!(
                        "{}sub{} ${}, %{}",
                        &caps[1],
                        &caps[2],
                        immediate + offset,
                        &caps[4]
                    ))
                }
                None => None,
            };
            if let Some(line) = rewritten {
                self.lines[ii] = line;
            }
        }
        log::debug!("erasing {} prologue push(es) after _start", pushes.len());
        for index in pushes.into_iter().rev() {
            self.lines.remove(index);
        }
        Ok(())
    }

    /// Everything between the exit syscall and the next label is
    /// unreachable; the program has already left.
    fn crunch_exit_epilogue(&mut self, is_exit: impl Fn(&str) -> bool) {
        let Some(exit) = self.lines.iter().position(|line| is_exit(line)) else {
            return;
        };
        let first = exit + 1;
        let last = self.lines[first..]
            .iter()
            .position(|line| LABEL.is_match(line))
            .map_or(self.lines.len(), |ii| first + ii);
        if last > first {
            log::debug!("erasing {} line(s) of exit epilogue", last - first);
            self.lines.drain(first..last);
        }
    }

    /// Replace upstream alignment with the platform minimum.
    fn minimal_align(&mut self, platform: &Platform) -> Result<()> {
        let align = platform.align()?;
        for line in &mut self.lines {
            if ALIGN.is_match(line) {
                *line = format!("  .balign {}", align);
            }
        }
        Ok(())
    }

    /// Pull out the next zero-initialized object destined for `.bss`, in
    /// either of its two shapes. When none remain, normalize alignment and
    /// crunch the leftovers.
    fn extract_bss(&mut self, platform: &Platform) -> Result<Option<(String, u64)>> {
        if let Some(found) = self.extract_globl_object() {
            return Ok(Some(found));
        }
        if let Some(found) = self.extract_comm_object()? {
            return Ok(Some(found));
        }
        self.minimal_align(platform)?;
        self.crunch(platform)?;
        Ok(None)
    }

    /// `.globl NAME` / `.type NAME, @object` / `NAME:` / `.zero SIZE`; the
    /// covered range is erased.
    fn extract_globl_object(&mut self) -> Option<(String, u64)> {
        let mut idx = 0;
        while let Some((gi, name)) = self.find_from(&GLOBL, idx) {
            idx = gi + 1;
            let Some((ti, _)) = self
                .find_from(&TYPE_OBJECT, idx)
                .filter(|(_, tname)| *tname == name)
            else {
                continue;
            };
            let Some((li, _)) = self
                .find_from(&NAME_LABEL, ti + 1)
                .filter(|(_, lname)| *lname == name)
            else {
                continue;
            };
            let Some((zi, size)) = self.find_from(&ZERO, li + 1) else {
                continue;
            };
            let size = size.parse().ok()?;
            self.lines.drain(gi..=zi);
            return Some((name, size));
        }
        None
    }

    /// `.local NAME` / `.comm NAME, SIZE[, ALIGN]`; both lines erased.
    fn extract_comm_object(&mut self) -> Result<Option<(String, u64)>> {
        let mut idx = 0;
        while let Some((ci, name)) = self.find_from(&LOCAL, idx) {
            idx = ci + 1;
            let Some((mi, _)) = self
                .find_from(&COMM, idx)
                .filter(|(_, cname)| *cname == name)
            else {
                continue;
            };
            let rest = COMM
                .captures(&self.lines[mi])
                .map(|caps| caps[2].to_string())
                .unwrap_or_default();
            let size: u64 = if let Some(caps) = COMM_SIZE_ALIGN.captures(&rest) {
                caps[1].parse().map_err(|_| bad_comm(&rest))?
            } else {
                rest.trim().parse().map_err(|_| bad_comm(&rest))?
            };
            self.lines.drain(ci..=mi);
            return Ok(Some((name, size)));
        }
        Ok(None)
    }

    fn write_to(&self, out: &mut String) {
        if let Some(tag) = &self.tag {
            out.push_str(tag);
            out.push('\n');
        }
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
    }
}

fn bad_comm(rest: &str) -> Error {
    Error::parse(format!("cannot read .comm size from '{}'", rest))
}

/// Width of one push instruction in bytes.
fn push_width(suffix: &str, platform: &Platform) -> Result<u64> {
    match suffix {
        "l" => Ok(4),
        "q" => Ok(8),
        "" => Ok(u64::from(platform.addr_size()?)),
        other => Err(Error::parse(format!(
            "unknown push instruction width: push{}",
            other
        ))),
    }
}

/// A parsed `.s` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmSource {
    pub sections: Vec<AsmSection>,
}

impl AsmSource {
    /// Split assembler text into sections. Lines before the first
    /// `.section` directive form a synthetic `text` section.
    pub fn parse(text: &str) -> AsmSource {
        let mut sections = Vec::new();
        let mut current = AsmSection::new("text", None);
        for line in text.lines() {
            if let Some(caps) = SECTION.captures(line) {
                let name = caps[1].to_string();
                sections.push(std::mem::replace(
                    &mut current,
                    AsmSection::new(&name, Some(line.to_string())),
                ));
            } else {
                current.lines.push(line.to_string());
            }
        }
        // Compiler output ends with a bare section tag; a trailing section
        // joins the list only when it carries no content.
        if !current.has_content() {
            sections.push(current);
        }
        log::debug!(
            "read {} section(s): {}",
            sections.len(),
            sections
                .iter()
                .map(|section| section.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        AsmSource { sections }
    }

    pub fn from_path(path: &Path) -> Result<AsmSource> {
        let text = fs::read_to_string(path)?;
        let ret = AsmSource::parse(&text);
        log::info!(
            "read {} section(s) from '{}'",
            ret.sections.len(),
            path.display()
        );
        Ok(ret)
    }

    /// Lift every zero-initialized object out of the sections, crunch what
    /// remains, and append the synthetic `.bss` of `.equ` address bindings.
    /// Returns true when the total size forces a second PT_LOAD.
    pub fn generate_fake_bss(&mut self, platform: &Platform) -> Result<bool> {
        let mut entries = Vec::new();
        for section in &mut self.sections {
            while let Some(entry) = section.extract_bss(platform)? {
                entries.push(entry);
            }
        }
        let mut offset: u64 = 0;
        let mut assignments = Vec::new();
        for (name, size) in entries {
            assignments.push((name, offset));
            offset += size;
            if offset % BSS_ALIGNMENT != 0 {
                offset += BSS_ALIGNMENT - offset % BSS_ALIGNMENT;
            }
        }
        let total = offset;
        let double = total > BSS_DOUBLE_LOAD_LIMIT;
        let bss_offset = if double { platform.memory_page()? } else { 0 };

        let mut bss = AsmSection::new("bss", None);
        bss.lines.push("end:".to_string());
        bss.lines
            .push(format!(".balign {}", platform.addr_size()?));
        bss.lines.push("aligned_end:".to_string());
        bss.lines
            .push(format!(".equ bss_start, aligned_end + {:#x}", bss_offset));
        for (name, entry_offset) in &assignments {
            bss.lines
                .push(format!(".equ {}, bss_start + {}", name, entry_offset));
        }
        bss.lines
            .push(format!(".equ bss_end, bss_start + {}", total));
        self.sections.push(bss);

        log::info!(
            "constructed fake .bss of {} bytes over {} object(s){}",
            total,
            assignments.len(),
            if double { ", second PT_LOAD required" } else { "" }
        );
        Ok(double)
    }

    /// Merge every `rodata` section into the last preceding `text` section.
    /// With a single read-write-execute PT_LOAD, read-only data has no
    /// separate home.
    pub fn remove_rodata(&mut self) -> Result<()> {
        let mut held: Vec<Vec<String>> = Vec::new();
        let mut last_text: Option<usize> = None;
        let mut ii = 0;
        while ii < self.sections.len() {
            match self.sections[ii].name.as_str() {
                "text" => {
                    last_text = Some(ii);
                    ii += 1;
                }
                "rodata" => {
                    let lines = self.sections.remove(ii).lines;
                    if let Some(text) = last_text {
                        self.sections[text].lines.extend(lines);
                    } else {
                        held.push(lines);
                    }
                }
                _ => ii += 1,
            }
        }
        if !held.is_empty() {
            let text = last_text
                .ok_or_else(|| Error::parse("no text section to merge rodata into"))?;
            for lines in held {
                self.sections[text].lines.extend(lines);
            }
        }
        Ok(())
    }

    /// The file as assembler text.
    pub fn to_text(&self) -> String {
        let mut ret = String::new();
        for section in &self.sections {
            section.write_to(&mut ret);
        }
        ret
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_text())?;
        log::info!("wrote assembler source '{}'", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux64() -> Platform {
        Platform::new("Linux", "x86_64")
    }

    fn linux32() -> Platform {
        Platform::new("Linux", "i686")
    }

    #[test]
    fn parse_splits_sections_and_round_trips() {
        let text = "\tmovl $1, %eax\n\t.section .rodata.str1.1,\"aMS\",@progbits,1\n.LC0:\n\t.string \"hi\"\n\t.section .note.GNU-stack,\"\",@progbits\n";
        let source = AsmSource::parse(text);
        let names: Vec<&str> = source
            .sections
            .iter()
            .map(|section| section.name.as_str())
            .collect();
        assert_eq!(names, ["text", "rodata", "note"]);
        assert_eq!(source.to_text(), text);
    }

    #[test]
    fn trailing_section_with_content_is_dropped() {
        let text = "\tret\n\t.section .data.rel,\"aw\"\nstray:\n\t.long 1\n";
        let source = AsmSource::parse(text);
        let names: Vec<&str> = source
            .sections
            .iter()
            .map(|section| section.name.as_str())
            .collect();
        assert_eq!(names, ["text"]);
    }

    #[test]
    fn crunch_strips_linker_directives() {
        let mut section = AsmSection::new("text", None);
        for line in [
            "\t.file\t\"intro.cpp\"",
            "\t.globl\tmain",
            "\t.type\tmain, @function",
            "main:",
            "\tret",
            "\t.size\tmain, .-main",
            "\t.ident\t\"GCC: 13.2\"",
            "\t.text",
        ] {
            section.lines.push(line.to_string());
        }
        section.crunch(&linux64()).unwrap();
        assert_eq!(section.lines, ["main:", "\tret"]);
    }

    #[test]
    fn prologue_pushes_fold_into_stack_adjustment() {
        let mut section = AsmSection::new("text", None);
        for line in [
            "_start:",
            " pushq %rbx",
            " pushq %rbp",
            " pushq %r12",
            " subq $40, %rsp",
            " call main",
        ] {
            section.lines.push(line.to_string());
        }
        section.crunch(&linux64()).unwrap();
        assert_eq!(
            section.lines,
            ["_start:", " subq $64, %rsp", " call main"]
        );
    }

    #[test]
    fn prologue_keeps_zeroing_xor() {
        let mut section = AsmSection::new("text", None);
        for line in [
            "_start:",
            "\tpushq\t%rbp",
            "\txorl\t%ebp, %ebp",
            "\tpushq\t%rbx",
            "\tsubq\t$24, %rsp",
        ] {
            section.lines.push(line.to_string());
        }
        section.crunch(&linux64()).unwrap();
        assert_eq!(
            section.lines,
            ["_start:", "\txorl\t%ebp, %ebp", "\tsubq\t$40, %rsp"]
        );
    }

    #[test]
    fn unknown_push_width_is_fatal() {
        let mut section = AsmSection::new("text", None);
        section.lines.push("_start:".to_string());
        section.lines.push("\tpushw\t%ax".to_string());
        assert!(section.crunch(&linux64()).is_err());
    }

    #[test]
    fn epilogue_after_syscall_is_erased() {
        let mut section = AsmSection::new("text", None);
        for line in [
            "\tmovl\t$60, %eax",
            "\tsyscall",
            "\tpopq\t%rbx",
            "\tret",
            "render:",
            "\tret",
        ] {
            section.lines.push(line.to_string());
        }
        section.crunch(&linux64()).unwrap();
        assert_eq!(
            section.lines,
            ["\tmovl\t$60, %eax", "\tsyscall", "render:", "\tret"]
        );
    }

    #[test]
    fn epilogue_after_interrupt_is_erased_on_ia32() {
        let mut section = AsmSection::new("text", None);
        for line in ["\tint\t$0x80", "\tpopl\t%ebx", "\tret"] {
            section.lines.push(line.to_string());
        }
        section.crunch(&linux32()).unwrap();
        assert_eq!(section.lines, ["\tint\t$0x80"]);
    }

    #[test]
    fn align_is_normalized() {
        let mut section = AsmSection::new("text", None);
        section.lines.push("\t.align 16".to_string());
        section.minimal_align(&linux64()).unwrap();
        assert_eq!(section.lines, ["  .balign 1"]);
    }

    #[test]
    fn single_globl_object_becomes_fake_bss() {
        let text = "\t.globl\tfoo\n\t.type\tfoo, @object\nfoo:\n\t.zero\t17\n\tret\n";
        let mut source = AsmSource::parse(text);
        let double = source.generate_fake_bss(&linux64()).unwrap();
        assert!(!double);
        let bss = source.sections.last().unwrap();
        assert_eq!(bss.name, "bss");
        assert_eq!(
            bss.lines,
            [
                "end:",
                ".balign 8",
                "aligned_end:",
                ".equ bss_start, aligned_end + 0x0",
                ".equ foo, bss_start + 0",
                ".equ bss_end, bss_start + 20",
            ]
        );
        // The object's lines are gone from the text section.
        assert_eq!(source.sections[0].lines, ["\tret"]);
    }

    #[test]
    fn comm_objects_extract_and_offsets_round_up() {
        let text = "\t.local\tbuffer\n\t.comm\tbuffer,6,4\n\t.local\tstate\n\t.comm\tstate, 8\n";
        let mut source = AsmSource::parse(text);
        source.generate_fake_bss(&linux64()).unwrap();
        let bss = source.sections.last().unwrap();
        assert!(bss.lines.contains(&".equ buffer, bss_start + 0".to_string()));
        assert!(bss.lines.contains(&".equ state, bss_start + 8".to_string()));
        assert!(bss.lines.contains(&".equ bss_end, bss_start + 16".to_string()));
    }

    #[test]
    fn oversized_bss_triggers_second_load() {
        let text = "\t.local\thuge\n\t.comm\thuge,136314880,32\n";
        let mut source = AsmSource::parse(text);
        let double = source.generate_fake_bss(&linux64()).unwrap();
        assert!(double);
        let bss = source.sections.last().unwrap();
        assert!(
            bss.lines
                .contains(&".equ bss_start, aligned_end + 0x1000".to_string())
        );
    }

    #[test]
    fn rodata_merges_into_preceding_text() {
        let text = "\tcall render\n\t.section .rodata\n.LC0:\n\t.string \"x\"\n\t.section .text.unlikely\n\tret\n\t.section .note.GNU-stack,\"\",@progbits\n";
        let mut source = AsmSource::parse(text);
        source.remove_rodata().unwrap();
        let names: Vec<&str> = source
            .sections
            .iter()
            .map(|section| section.name.as_str())
            .collect();
        assert_eq!(names, ["text", "text", "note"]);
        assert_eq!(
            source.sections[0].lines,
            ["\tcall render", ".LC0:", "\t.string \"x\""]
        );
    }

    #[test]
    fn early_rodata_lands_in_the_leading_text_section() {
        let text = "\t.section .rodata\n.LC1:\n\t.byte 1\n\t.section .text.startup\n\tret\n\t.section .note.GNU-stack,\"\",@progbits\n";
        let mut source = AsmSource::parse(text);
        source.remove_rodata().unwrap();
        // The synthetic text section preceding all directives picks it up.
        assert_eq!(source.sections[0].name, "text");
        assert_eq!(source.sections[0].lines, [".LC1:", "\t.byte 1"]);
        assert_eq!(source.sections[1].lines, ["\tret"]);
    }
}
