//! Hand-built ELF image templates.
//!
//! The composer owns the segment templates for everything that precedes the
//! program body in the output: ELF header, program headers, the dynamic
//! section and its string/symbol/hash tables. Field widths and orders track
//! the platform's ELF class; every cross-structure reference is a symbolic
//! expression so the overlap pass can move bytes without breaking
//! addressing. Section headers are deliberately absent — the kernel never
//! reads them.

use crate::asm::segment::{AsmSegment, friendly_name, merge_segments};
use crate::asm::variable::{AsmVariable, Value};
use crate::elf::{
    DT_DEBUG, DT_NULL, DT_STRTAB, ELFDATA2LSB, ELFMAG0, ELFMAG_TAIL, ET_EXEC, EV_CURRENT, PF_R,
    PF_W, PF_X, PT_DYNAMIC, PT_INTERP, PT_LOAD, ST_INFO_UND, SYM_SHNDX,
};
use crate::error::{Error, Result};
use crate::platform::{Platform, PlatformValue};

/// UND symbols the host libc insists on finding in the executable.
const UND_SYMBOLS_FREEBSD: &[&str] = &["environ", "__progname"];

/// Builds the segment list for one output image.
#[derive(Debug, Clone)]
pub struct ElfComposer {
    platform: Platform,
    addr_size: u8,
    /// Emitted as `e_phnum`; bumped to 4 when the fake `.bss` needs its own
    /// PT_LOAD.
    phdr_count: u64,
}

impl ElfComposer {
    pub fn new(platform: Platform) -> Result<ElfComposer> {
        let addr_size = platform.addr_size()?;
        let phdr_count = platform.phdr_count()?;
        Ok(ElfComposer {
            platform,
            addr_size,
            phdr_count,
        })
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn phdr_count(&self) -> u64 {
        self.phdr_count
    }

    /// Switch to the double-PT_LOAD layout: code segment plus a separate
    /// read-write segment for the oversized fake `.bss`.
    pub fn require_bss_load(&mut self) {
        self.phdr_count = 4;
    }

    fn double_load(&self) -> bool {
        self.phdr_count == 4
    }

    /// UND symbol names required on this platform.
    pub fn und_symbols(&self) -> &'static [&'static str] {
        if self.platform.is_freebsd() {
            UND_SYMBOLS_FREEBSD
        } else {
            &[]
        }
    }

    fn var_int(&self, name: &str) -> Result<i128> {
        match self.platform.get(name)? {
            PlatformValue::Int(ii) => Ok(i128::from(ii)),
            PlatformValue::Str(ss) => Err(Error::data(format!(
                "platform variable '{}' is not numeric: '{}'",
                name, ss
            ))),
        }
    }

    fn class_name(&self, base: &str) -> String {
        if self.addr_size == 8 {
            format!("Elf64_{}", base)
        } else {
            format!("Elf32_{}", base)
        }
    }

    /// ELF identification and file header.
    fn ehdr(&self) -> Result<AsmSegment> {
        let addr = self.addr_size;
        let vars = vec![
            AsmVariable::new(
                "e_ident[EI_MAG0], magic value 0x7f",
                1,
                Value::Int(ELFMAG0.into()),
            ),
            AsmVariable::new(
                "e_ident[EI_MAG1] to e_ident[EI_MAG3], magic value \"ELF\"",
                1,
                Value::quoted(ELFMAG_TAIL),
            ),
            AsmVariable::new(
                "e_ident[EI_CLASS], ELFCLASS32 = 1, ELFCLASS64 = 2",
                1,
                Value::Int(self.var_int("ei_class")?),
            ),
            AsmVariable::new(
                "e_ident[EI_DATA], ELFDATA2LSB = 1",
                1,
                Value::Int(ELFDATA2LSB.into()),
            ),
            AsmVariable::new(
                "e_ident[EI_VERSION], EV_CURRENT = 1",
                1,
                Value::Int(EV_CURRENT.into()),
            ),
            AsmVariable::new(
                "e_ident[EI_OSABI], ELFOSABI_LINUX = 3, ELFOSABI_FREEBSD = 9",
                1,
                Value::Int(self.var_int("ei_osabi")?),
            ),
            AsmVariable::new("e_ident[EI_PAD], unused", 1, Value::zeroes(8)),
            AsmVariable::new("e_type, ET_EXEC = 2", 2, Value::Int(ET_EXEC.into())),
            AsmVariable::new(
                "e_machine, EM_386 = 3, EM_X86_64 = 62",
                2,
                Value::Int(self.var_int("e_machine")?),
            ),
            AsmVariable::new("e_version, EV_CURRENT = 1", 4, Value::Int(EV_CURRENT.into())),
            AsmVariable::new(
                "e_entry, execution starting point",
                addr,
                Value::sym("_start"),
            ),
            AsmVariable::new(
                "e_phoff, offset from start to program headers",
                addr,
                Value::sym("ehdr_end - ehdr"),
            ),
            AsmVariable::new("e_shoff, no section headers", addr, Value::Int(0)),
            AsmVariable::new("e_flags, unused", 4, Value::Int(0)),
            AsmVariable::new(
                &format!("e_ehsize, {} size", self.class_name("Ehdr")),
                2,
                Value::sym("ehdr_end - ehdr"),
            ),
            AsmVariable::new(
                &format!("e_phentsize, {} size", self.class_name("Phdr")),
                2,
                Value::sym("phdr_load_end - phdr_load"),
            ),
            AsmVariable::new(
                &format!(
                    "e_phnum, {} count, PT_LOAD, [PT_LOAD (bss)], PT_DYNAMIC, PT_INTERP",
                    self.class_name("Phdr")
                ),
                2,
                Value::Int(self.phdr_count.into()),
            ),
            AsmVariable::new("e_shentsize, no section headers", 2, Value::Int(0)),
            AsmVariable::new("e_shnum, no section headers", 2, Value::Int(0)),
            AsmVariable::new("e_shstrndx, no section name string table", 2, Value::Int(0)),
        ];
        AsmSegment::new("ehdr", &self.class_name("Ehdr"), vars)
    }

    /// Program header: fields in class order. `Elf64_Phdr` moves `p_flags`
    /// up next to `p_type`.
    #[allow(clippy::too_many_arguments)]
    fn phdr(
        &self,
        name: &str,
        desc: &str,
        p_type: u32,
        flags: (u32, &str),
        offset: Value,
        vaddr: Value,
        filesz: Value,
        memsz: Value,
        align: i128,
    ) -> Result<AsmSegment> {
        let addr = self.addr_size;
        let mut vars = vec![AsmVariable::new(
            &format!("p_type, {}", pt_desc(p_type)),
            4,
            Value::Int(p_type.into()),
        )];
        let flags_var = AsmVariable::new(
            &format!("p_flags, {}", flags.1),
            4,
            Value::Int(flags.0.into()),
        );
        if addr == 8 {
            vars.push(flags_var.clone());
        }
        vars.push(AsmVariable::new("p_offset, file offset of block", addr, offset));
        vars.push(AsmVariable::new("p_vaddr, virtual address of block", addr, vaddr));
        vars.push(AsmVariable::new("p_paddr, unused", addr, Value::Int(0)));
        vars.push(AsmVariable::new("p_filesz, block size on disk", addr, filesz));
        vars.push(AsmVariable::new("p_memsz, block size in memory", addr, memsz));
        if addr == 4 {
            vars.push(flags_var);
        }
        vars.push(AsmVariable::new("p_align", addr, Value::Int(align)));
        AsmSegment::new(name, desc, vars)
    }

    /// The whole image in one PT_LOAD, fake `.bss` rolled into `p_memsz`.
    fn phdr_load_single(&self) -> Result<AsmSegment> {
        self.phdr(
            "phdr_load",
            &format!("{}, PT_LOAD", self.class_name("Phdr")),
            PT_LOAD,
            (PF_R | PF_W | PF_X, "rwx = 7"),
            Value::Int(0),
            Value::Int(self.var_int("entry")?),
            Value::sym("end - ehdr"),
            Value::sym("bss_end - ehdr"),
            self.var_int("memory_page")?,
        )
    }

    /// Code-only PT_LOAD for the double layout.
    fn phdr_load_double(&self) -> Result<AsmSegment> {
        self.phdr(
            "phdr_load",
            &format!("{}, PT_LOAD", self.class_name("Phdr")),
            PT_LOAD,
            (PF_R | PF_W | PF_X, "rwx = 7"),
            Value::Int(0),
            Value::Int(self.var_int("entry")?),
            Value::sym("end - ehdr"),
            Value::sym("end - ehdr"),
            self.var_int("memory_page")?,
        )
    }

    /// Second PT_LOAD carrying the oversized fake `.bss`: no file bytes,
    /// memory only.
    fn phdr_load_bss(&self) -> Result<AsmSegment> {
        self.phdr(
            "phdr_load_bss",
            &format!("{}, PT_LOAD (.bss)", self.class_name("Phdr")),
            PT_LOAD,
            (PF_R | PF_W, "rw = 6"),
            Value::sym("end - ehdr"),
            Value::sym("bss_start"),
            Value::Int(0),
            Value::sym("bss_end - end"),
            self.var_int("memory_page")?,
        )
    }

    fn phdr_dynamic(&self) -> Result<AsmSegment> {
        self.phdr(
            "phdr_dynamic",
            &format!("{}, PT_DYNAMIC", self.class_name("Phdr")),
            PT_DYNAMIC,
            (0, "ignored"),
            Value::sym("dynamic - ehdr"),
            Value::sym("dynamic"),
            Value::sym("dynamic_end - dynamic"),
            Value::sym("dynamic_end - dynamic"),
            i128::from(self.addr_size),
        )
    }

    fn phdr_interp(&self) -> Result<AsmSegment> {
        self.phdr(
            "phdr_interp",
            &format!("{}, PT_INTERP", self.class_name("Phdr")),
            PT_INTERP,
            (0, "ignored"),
            Value::sym("interp - ehdr"),
            Value::sym("interp"),
            Value::sym("interp_end - interp"),
            Value::sym("interp_end - interp"),
            1,
        )
    }

    /// Minimal DT_HASH: one bucket pointing at the last symbol, a chain
    /// walking down to STN_UNDEF. Entries are 32-bit words in both classes.
    fn hash(&self, symbol_count: usize) -> Result<AsmSegment> {
        let nn = symbol_count as i128;
        let mut vars = vec![
            AsmVariable::new("nbucket", 4, Value::Int(1)),
            AsmVariable::new("nchain", 4, Value::Int(nn + 1)),
            AsmVariable::new("bucket[0]", 4, Value::Int(nn)),
        ];
        let chain: Vec<Value> = (0..=symbol_count)
            .map(|ii| Value::Int(ii.saturating_sub(1) as i128))
            .collect();
        vars.push(AsmVariable::new("chain", 4, Value::List(chain)));
        AsmSegment::new("hash", "DT_HASH", vars)
    }

    /// The dynamic section skeleton: DT_STRTAB, DT_DEBUG, DT_NULL. DT_SYMTAB
    /// is always present (zero without UND symbols); DT_HASH and the
    /// DT_NEEDED entries get prepended by the caller.
    fn dynamic(&self, have_und: bool) -> Result<AsmSegment> {
        let addr = self.addr_size;
        let vars = vec![
            AsmVariable::new("d_tag, DT_STRTAB = 5", addr, Value::Int(DT_STRTAB.into())),
            AsmVariable::new("d_un, string table address", addr, Value::sym("strtab")),
            AsmVariable::new("d_tag, DT_DEBUG = 21", addr, Value::Int(DT_DEBUG.into())),
            AsmVariable::new("d_un, filled in by the runtime linker", addr, Value::Int(0)),
            AsmVariable::new("d_tag, DT_NULL = 0", addr, Value::Int(DT_NULL.into())),
            AsmVariable::new("d_un", addr, Value::Int(0)),
        ];
        let mut segment = AsmSegment::new("dynamic", "PT_DYNAMIC", vars)?;
        let symtab_value = if have_und {
            Value::sym("symtab")
        } else {
            Value::Int(0)
        };
        segment.add_dt_symtab(addr, symtab_value);
        if have_und {
            segment.add_dt_hash(addr, Value::sym("hash"));
        }
        Ok(segment)
    }

    /// One UND entry per required symbol after the null entry. Layouts per
    /// class: 32-bit name/value/size/info/other/shndx, 64-bit
    /// name/info/other/shndx/value/size.
    fn symtab(&self, symbols: &[&str]) -> Result<AsmSegment> {
        let addr = self.addr_size;
        let mut vars = vec![AsmVariable::new("empty symbol, st_name", 4, Value::Int(0))];
        if addr == 8 {
            vars.push(AsmVariable::new("empty symbol, st_info", 1, Value::Int(0)));
            vars.push(AsmVariable::new("empty symbol, st_other", 1, Value::Int(0)));
            vars.push(AsmVariable::new("empty symbol, st_shndx", 2, Value::Int(0)));
            vars.push(AsmVariable::new("empty symbol, st_value", 8, Value::Int(0)));
            vars.push(AsmVariable::new("empty symbol, st_size", 8, Value::Int(0)));
        } else {
            vars.push(AsmVariable::new("empty symbol, st_value", 4, Value::Int(0)));
            vars.push(AsmVariable::new("empty symbol, st_size", 4, Value::Int(0)));
            vars.push(AsmVariable::new("empty symbol, st_info", 1, Value::Int(0)));
            vars.push(AsmVariable::new("empty symbol, st_other", 1, Value::Int(0)));
            vars.push(AsmVariable::new("empty symbol, st_shndx", 2, Value::Int(0)));
        }
        for name in symbols {
            let friendly = friendly_name(name);
            let st_name = AsmVariable::new(
                "st_name",
                4,
                Value::sym(format!("strtab_{} - strtab", friendly)),
            );
            let st_value = AsmVariable::new("st_value", addr, Value::sym(*name));
            let st_size = AsmVariable::new("st_size", addr, Value::Int(i128::from(addr)));
            let st_info = AsmVariable::new(
                "st_info, STB_GLOBAL | STT_OBJECT",
                1,
                Value::Int(ST_INFO_UND.into()),
            );
            let st_other = AsmVariable::new("st_other", 1, Value::Int(0));
            let st_shndx = AsmVariable::new("st_shndx", 2, Value::Int(SYM_SHNDX.into()));
            if addr == 8 {
                vars.extend([st_name, st_info, st_other, st_shndx, st_value, st_size]);
            } else {
                vars.extend([st_name, st_value, st_size, st_info, st_other, st_shndx]);
            }
        }
        AsmSegment::new("symtab", "DT_SYMTAB", vars)
    }

    fn interp(&self) -> Result<AsmSegment> {
        let path = match self.platform.get("interp")? {
            PlatformValue::Str(ss) => ss.to_string(),
            PlatformValue::Int(ii) => {
                return Err(Error::data(format!(
                    "platform interpreter is not a path: {:#x}",
                    ii
                )));
            }
        };
        let vars = vec![
            AsmVariable::new("path to interpreter", 1, Value::Quoted(path)),
            AsmVariable::new("interpreter terminating zero", 1, Value::Int(0)),
        ];
        AsmSegment::new("interp", "PT_INTERP", vars)
    }

    fn strtab(&self) -> Result<AsmSegment> {
        let vars = vec![AsmVariable::new("initial zero", 1, Value::Int(0))];
        AsmSegment::new("strtab", "DT_STRTAB", vars)
    }

    /// Build the full segment list, unmerged: ELF header, program headers,
    /// then the dynamic linking tables. `libraries` are resolved shared
    /// object names, already alphabetized by the caller.
    pub fn segments(&self, libraries: &[String]) -> Result<Vec<AsmSegment>> {
        let addr = self.addr_size;
        let und = self.und_symbols();

        let mut dynamic = self.dynamic(!und.is_empty())?;
        let mut strtab = self.strtab()?;
        for library in libraries {
            dynamic.add_dt_needed(addr, library);
            strtab.add_library_name(library);
        }
        for name in und {
            strtab.add_symbol_name(name);
        }

        let mut ret = vec![self.ehdr()?];
        if self.double_load() {
            ret.push(self.phdr_load_double()?);
            ret.push(self.phdr_load_bss()?);
        } else {
            ret.push(self.phdr_load_single()?);
        }
        ret.push(self.phdr_dynamic()?);
        ret.push(self.phdr_interp()?);
        if !und.is_empty() {
            ret.push(self.hash(und.len())?);
        }
        ret.push(dynamic);
        if !und.is_empty() {
            ret.push(self.symtab(und)?);
        }
        ret.push(self.interp()?);
        ret.push(strtab);
        Ok(ret)
    }

    /// Segment list with the overlap pass applied, ready for emission.
    pub fn compose(&self, libraries: &[String]) -> Result<Vec<AsmSegment>> {
        let mut segments = self.segments(libraries)?;
        let before: usize = segments.iter().map(AsmSegment::byte_size).sum();
        merge_segments(&mut segments);
        let after: usize = segments.iter().map(AsmSegment::byte_size).sum();
        log::info!(
            "composed {} header segments, {} bytes ({} saved by overlap)",
            segments.len(),
            after,
            before - after
        );
        Ok(segments)
    }
}

fn pt_desc(p_type: u32) -> &'static str {
    match p_type {
        PT_LOAD => "PT_LOAD = 1",
        PT_DYNAMIC => "PT_DYNAMIC = 2",
        PT_INTERP => "PT_INTERP = 3",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::syntax::AsmSyntax;

    fn emit(segments: &[AsmSegment]) -> String {
        let syntax = AsmSyntax::gas();
        segments
            .iter()
            .map(|seg| seg.generate_source(&syntax).unwrap())
            .collect()
    }

    fn dynamic_tags(segments: &[AsmSegment]) -> Vec<(i128, Value)> {
        let dynamic = segments
            .iter()
            .find(|seg| seg.name == "dynamic")
            .expect("dynamic segment present");
        dynamic
            .data
            .chunks(2)
            .map(|pair| match pair[0].value {
                Value::Int(tag) => (tag, pair[1].value.clone()),
                _ => panic!("dynamic tag is not an integer"),
            })
            .collect()
    }

    #[test]
    fn linux_amd64_has_no_und_machinery() {
        let composer = ElfComposer::new(Platform::new("Linux", "x86_64")).unwrap();
        let libraries = vec!["libc.so".to_string(), "libGL.so".to_string()];
        let segments = composer.segments(&libraries).unwrap();
        assert!(!segments.iter().any(|seg| seg.name == "hash"));
        assert!(!segments.iter().any(|seg| seg.name == "symtab"));
        let tags = dynamic_tags(&segments);
        let tag_ids: Vec<i128> = tags.iter().map(|(tag, _)| *tag).collect();
        // Two DT_NEEDED in reverse library order, then SYMTAB, STRTAB,
        // DEBUG, NULL; no DT_HASH.
        assert_eq!(
            tag_ids,
            [
                i128::from(crate::elf::DT_NEEDED),
                i128::from(crate::elf::DT_NEEDED),
                i128::from(crate::elf::DT_SYMTAB),
                i128::from(DT_STRTAB),
                i128::from(DT_DEBUG),
                i128::from(DT_NULL),
            ]
        );
        assert_eq!(tags[0].1, Value::sym("strtab_libGL_so - strtab"));
        assert_eq!(tags[1].1, Value::sym("strtab_libc_so - strtab"));
        assert_eq!(tags[2].1, Value::Int(0));
    }

    #[test]
    fn freebsd_amd64_emits_hash_and_symtab() {
        let composer = ElfComposer::new(Platform::new("FreeBSD", "x86_64")).unwrap();
        let segments = composer.segments(&["libc.so".to_string()]).unwrap();
        assert!(segments.iter().any(|seg| seg.name == "hash"));
        let symtab = segments
            .iter()
            .find(|seg| seg.name == "symtab")
            .expect("symtab present");
        let values: Vec<&Value> = symtab.data.iter().map(|var| &var.value).collect();
        assert!(values.contains(&&Value::sym("environ")));
        assert!(values.contains(&&Value::sym("__progname")));
        let tags: Vec<i128> = dynamic_tags(&segments)
            .iter()
            .map(|(tag, _)| *tag)
            .collect();
        assert!(tags.contains(&i128::from(crate::elf::DT_HASH)));
        let text = emit(&segments);
        assert!(text.contains("strtab_progname:\n"));
        assert!(text.contains("strtab_environ:\n"));
    }

    #[test]
    fn hash_table_matches_minimal_layout() {
        let composer = ElfComposer::new(Platform::new("FreeBSD", "i686")).unwrap();
        let segment = composer.hash(2).unwrap();
        assert_eq!(segment.data[0].value, Value::Int(1));
        assert_eq!(segment.data[1].value, Value::Int(3));
        assert_eq!(segment.data[2].value, Value::Int(2));
        assert_eq!(
            segment.data[3].value,
            Value::List(vec![Value::Int(0), Value::Int(0), Value::Int(1)])
        );
    }

    #[test]
    fn phdr_count_tracks_load_layout() {
        let mut composer = ElfComposer::new(Platform::new("Linux", "x86_64")).unwrap();
        assert_eq!(composer.phdr_count(), 3);
        let single = composer.segments(&[]).unwrap();
        assert_eq!(
            single.iter().filter(|seg| seg.name.starts_with("phdr_load")).count(),
            1
        );
        composer.require_bss_load();
        assert_eq!(composer.phdr_count(), 4);
        let double = composer.segments(&[]).unwrap();
        assert_eq!(
            double.iter().filter(|seg| seg.name.starts_with("phdr_load")).count(),
            2
        );
        let bss = double
            .iter()
            .find(|seg| seg.name == "phdr_load_bss")
            .expect("bss load present");
        let values: Vec<&Value> = bss.data.iter().map(|var| &var.value).collect();
        assert!(values.contains(&&Value::sym("bss_start")));
    }

    #[test]
    fn ehdr_layout_follows_class() {
        let amd64 = ElfComposer::new(Platform::new("Linux", "x86_64")).unwrap();
        let ehdr = amd64.ehdr().unwrap();
        assert_eq!(ehdr.data[0].value, Value::Int(0x7f));
        assert_eq!(ehdr.data[1].value, Value::quoted("ELF"));
        assert_eq!(ehdr.data[2].value, Value::Int(2)); // ELFCLASS64
        let entry = ehdr
            .data
            .iter()
            .find(|var| var.value == Value::sym("_start"))
            .expect("e_entry present");
        assert_eq!(entry.size, 8);

        let ia32 = ElfComposer::new(Platform::new("Linux", "i686")).unwrap();
        let ehdr32 = ia32.ehdr().unwrap();
        assert_eq!(ehdr32.data[2].value, Value::Int(1)); // ELFCLASS32
        let entry32 = ehdr32
            .data
            .iter()
            .find(|var| var.value == Value::sym("_start"))
            .expect("e_entry present");
        assert_eq!(entry32.size, 4);
    }

    #[test]
    fn phdr_flags_position_follows_class() {
        let amd64 = ElfComposer::new(Platform::new("Linux", "x86_64")).unwrap();
        let load = amd64.phdr_load_single().unwrap();
        // Elf64: p_type then p_flags.
        assert_eq!(load.data[1].value, Value::Int(7));
        let ia32 = ElfComposer::new(Platform::new("Linux", "i686")).unwrap();
        let load32 = ia32.phdr_load_single().unwrap();
        // Elf32: p_flags is second to last.
        let idx = load32.data.len() - 2;
        assert_eq!(load32.data[idx].value, Value::Int(7));
        assert_eq!(load32.data[2].value, Value::Int(0x200_0000));
    }

    #[test]
    fn merge_keeps_all_segment_labels() {
        let composer = ElfComposer::new(Platform::new("Linux", "x86_64")).unwrap();
        let merged = composer.compose(&["libc.so".to_string()]).unwrap();
        let names = [
            "ehdr",
            "phdr_load",
            "phdr_dynamic",
            "phdr_interp",
            "dynamic",
            "interp",
            "strtab",
        ];
        let text = emit(&merged);
        for name in names {
            assert!(text.contains(&format!("{}:\n", name)), "missing {}", name);
            assert!(
                text.contains(&format!("{}_end:\n", name)),
                "missing {}_end",
                name
            );
        }
    }
}
