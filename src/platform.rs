//! Platform-dependent constants.
//!
//! Every value the emitted image depends on (entry address, ELF machine and
//! ABI codes, dynamic linker path, page size, address width) lives in one
//! table, keyed by OS name, architecture name, an `OS-bits` composite, or
//! `"default"`. Lookup walks the architecture alias chain, so `i686`
//! resolves through `ia32` to `32-bit` bindings.

use std::fmt;

use crate::error::{Error, Result};

/// One binding inside a constant's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformValue {
    Int(u64),
    Str(&'static str),
}

impl fmt::Display for PlatformValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Integer constants always stringify as hex.
            PlatformValue::Int(ii) => write!(f, "{:#x}", ii),
            PlatformValue::Str(ss) => write!(f, "{}", ss),
        }
    }
}

type Bindings = &'static [(&'static str, PlatformValue)];

/// Address width in bytes.
const VAR_ADDR: Bindings = &[
    ("32-bit", PlatformValue::Int(4)),
    ("64-bit", PlatformValue::Int(8)),
];

/// Minimal alignment for code. Upstream `.align` directives get replaced
/// with this; x86 has no alignment requirement worth paying bytes for.
const VAR_ALIGN: Bindings = &[("default", PlatformValue::Int(1))];

/// `e_machine`: EM_386 = 3, EM_X86_64 = 62.
const VAR_E_MACHINE: Bindings = &[
    ("ia32", PlatformValue::Int(3)),
    ("amd64", PlatformValue::Int(62)),
];

/// `e_ident[EI_CLASS]`: ELFCLASS32 = 1, ELFCLASS64 = 2.
const VAR_EI_CLASS: Bindings = &[
    ("32-bit", PlatformValue::Int(1)),
    ("64-bit", PlatformValue::Int(2)),
];

/// `e_ident[EI_OSABI]`: ELFOSABI_LINUX = 3, ELFOSABI_FREEBSD = 9.
const VAR_EI_OSABI: Bindings = &[
    ("FreeBSD", PlatformValue::Int(9)),
    ("Linux", PlatformValue::Int(3)),
];

/// Virtual address the image is linked and loaded at.
const VAR_ENTRY: Bindings = &[
    ("ia32", PlatformValue::Int(0x200_0000)),
    ("amd64", PlatformValue::Int(0x40_0000)),
];

/// Path of the runtime dynamic linker, in quoted source form.
const VAR_INTERP: Bindings = &[
    ("FreeBSD", PlatformValue::Str("\"/libexec/ld-elf.so.1\"")),
    ("Linux-32", PlatformValue::Str("\"/lib/ld-linux.so.2\"")),
    ("Linux-64", PlatformValue::Str("\"/lib64/ld-linux-x86-64.so.2\"")),
];

/// Memory page granularity.
const VAR_MEMORY_PAGE: Bindings = &[("default", PlatformValue::Int(0x1000))];

/// Program header count: PT_LOAD, PT_DYNAMIC, PT_INTERP. The composer bumps
/// its own copy to 4 when the fake `.bss` needs a second PT_LOAD.
const VAR_PHDR_COUNT: Bindings = &[("default", PlatformValue::Int(3))];

const PLATFORM_VARIABLES: &[(&str, Bindings)] = &[
    ("addr", VAR_ADDR),
    ("align", VAR_ALIGN),
    ("e_machine", VAR_E_MACHINE),
    ("ei_class", VAR_EI_CLASS),
    ("ei_osabi", VAR_EI_OSABI),
    ("entry", VAR_ENTRY),
    ("interp", VAR_INTERP),
    ("memory_page", VAR_MEMORY_PAGE),
    ("phdr_count", VAR_PHDR_COUNT),
];

/// Architecture alias chain, e.g. `i686 -> ia32 -> 32-bit`.
const ARCH_MAPPING: &[(&str, &str)] = &[
    ("i386", "ia32"),
    ("i486", "ia32"),
    ("i586", "ia32"),
    ("i686", "ia32"),
    ("x86", "ia32"),
    ("x86_64", "amd64"),
    ("ia32", "32-bit"),
    ("amd64", "64-bit"),
];

fn map_arch(arch: &str) -> Option<&'static str> {
    ARCH_MAPPING
        .iter()
        .find(|(from, _)| *from == arch)
        .map(|(_, to)| *to)
}

/// The `(os, arch)` pair a build targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    os: String,
    arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Platform {
        Platform {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Platform of the running host, with an optional OS override for
    /// cross-targeting.
    pub fn host(os_override: Option<&str>) -> Platform {
        let os = match os_override {
            Some(name) => name.to_string(),
            None => match std::env::consts::OS {
                "linux" => "Linux".to_string(),
                "freebsd" => "FreeBSD".to_string(),
                other => other.to_string(),
            },
        };
        Platform::new(os, std::env::consts::ARCH)
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn is_amd64(&self) -> bool {
        self.key_chain().iter().any(|key| key == "amd64")
    }

    pub fn is_ia32(&self) -> bool {
        self.key_chain().iter().any(|key| key == "ia32")
    }

    pub fn is_freebsd(&self) -> bool {
        self.os == "FreeBSD"
    }

    /// Keys tried against a constant's bindings, most specific first:
    /// OS, `OS-bits` composite, then the architecture alias chain.
    fn key_chain(&self) -> Vec<String> {
        let mut keys = vec![self.os.clone()];
        let mut arch_keys = vec![self.arch.clone()];
        let mut cursor = self.arch.as_str();
        while let Some(next) = map_arch(cursor) {
            arch_keys.push(next.to_string());
            cursor = next;
        }
        if let Some(bits) = arch_keys.iter().find_map(|key| match key.as_str() {
            "32-bit" => Some("32"),
            "64-bit" => Some("64"),
            _ => None,
        }) {
            keys.push(format!("{}-{}", self.os, bits));
        }
        keys.extend(arch_keys);
        keys
    }

    /// Look up a named constant for this platform.
    pub fn get(&self, name: &str) -> Result<PlatformValue> {
        let bindings = PLATFORM_VARIABLES
            .iter()
            .find(|(var, _)| *var == name)
            .map(|(_, bindings)| *bindings)
            .ok_or_else(|| Error::config(format!("unknown platform variable '{}'", name)))?;
        for key in self.key_chain() {
            if let Some((_, value)) = bindings.iter().find(|(kk, _)| *kk == key) {
                return Ok(*value);
            }
        }
        if let Some((_, value)) = bindings.iter().find(|(kk, _)| *kk == "default") {
            return Ok(*value);
        }
        Err(Error::config(format!(
            "platform ({}, {}) not supported for variable '{}'",
            self.os, self.arch, name
        )))
    }

    fn get_int(&self, name: &str) -> Result<u64> {
        match self.get(name)? {
            PlatformValue::Int(ii) => Ok(ii),
            PlatformValue::Str(ss) => Err(Error::data(format!(
                "platform variable '{}' is not numeric: '{}'",
                name, ss
            ))),
        }
    }

    /// Address width in bytes (4 or 8).
    pub fn addr_size(&self) -> Result<u8> {
        match self.get_int("addr")? {
            4 => Ok(4),
            8 => Ok(8),
            other => Err(Error::data(format!("unsupported address size {}", other))),
        }
    }

    pub fn align(&self) -> Result<u64> {
        self.get_int("align")
    }

    pub fn entry(&self) -> Result<u64> {
        self.get_int("entry")
    }

    pub fn memory_page(&self) -> Result<u64> {
        self.get_int("memory_page")
    }

    pub fn phdr_count(&self) -> Result<u64> {
        self.get_int("phdr_count")
    }
}
