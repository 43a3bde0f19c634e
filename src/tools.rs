//! External tool plumbing: probing for executables, driving the compiler,
//! assembler, linker and strip, compressing the result.
//!
//! Every invocation blocks until the child exits with stdout and stderr
//! captured in full; a nonzero exit status is fatal and carries the
//! captured stderr. Intermediate artifacts are named files next to the
//! output, left on disk for inspection.

use std::fs;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::asm::AsmSyntax;
use crate::error::{Error, Result};
use crate::platform::{Platform, PlatformValue};

pub const DEFAULT_ASSEMBLER_LIST: &[&str] = &["/usr/local/bin/as", "as"];
pub const DEFAULT_COMPILER_LIST: &[&str] = &["g++", "clang++"];
pub const DEFAULT_LINKER_LIST: &[&str] = &["/usr/local/bin/ld", "ld"];
pub const DEFAULT_STRIP_LIST: &[&str] = &["/usr/local/bin/strip", "strip"];
pub const DEFAULT_READELF_LIST: &[&str] = &["readelf"];

static LINKER_SCRIPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)linker script\S+\s*\n=+\s+(.*)\s+=+\s*\n").unwrap()
});
static SCRIPT_END_SYMBOLS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\n([^\n]+)(_end|_edata|__bss_start)(\s*=[^\n]+)\n").unwrap()
});
static GROUP_DIRECTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"GROUP\s*\(\s*(\S+)\s").unwrap());
static PT_LOAD_FILESZ: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"LOAD\s+0x[0-9a-fA-F]+\s+0x[0-9a-fA-F]+\s+0x[0-9a-fA-F]+\s+(0x[0-9a-fA-F]+)")
        .unwrap()
});

/// Run a command to completion, capturing output. Nonzero exit is fatal.
pub fn run_command(args: &[String]) -> Result<(Vec<u8>, String)> {
    log::debug!("executing command: {}", args.join(" "));
    let output = Command::new(&args[0])
        .args(&args[1..])
        .output()
        .map_err(|err| Error::config(format!("could not run '{}': {}", args[0], err)))?;
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(Error::Tool {
            command: args.join(" "),
            status: output.status.code().unwrap_or(-1),
            stderr,
        });
    }
    if !stderr.is_empty() {
        log::debug!("{}", stderr.trim_end());
    }
    Ok((output.stdout, stderr))
}

/// Check whether a single executable can be spawned at all.
pub fn check_executable(candidate: &str) -> bool {
    let spawned = Command::new(candidate)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    match spawned {
        Ok(mut child) => {
            let _ = child.kill();
            let _ = child.wait();
            log::debug!("trying binary '{}'... found", candidate);
            true
        }
        Err(_) => {
            log::debug!("trying binary '{}'... not found", candidate);
            false
        }
    }
}

/// Probe a candidate list for a working executable. Entries already tried
/// are skipped, and the default compiler list is always consulted as a
/// final fallback.
pub fn search_executable(candidates: &[&str]) -> Option<String> {
    let mut checked: Vec<&str> = Vec::new();
    for candidate in candidates.iter().chain(DEFAULT_COMPILER_LIST).copied() {
        if checked.contains(&candidate) {
            continue;
        }
        if check_executable(candidate) {
            return Some(candidate.to_string());
        }
        checked.push(candidate);
    }
    None
}

/// Resolve one tool: an explicit path must work, otherwise the default
/// list is searched.
pub fn find_tool(explicit: Option<&str>, defaults: &[&str], what: &str) -> Result<String> {
    if let Some(path) = explicit {
        if check_executable(path) {
            return Ok(path.to_string());
        }
        return Err(Error::config(format!(
            "could not use supplied {} '{}'",
            what, path
        )));
    }
    search_executable(defaults)
        .ok_or_else(|| Error::config(format!("suitable {} not found", what)))
}

fn basename(command: &str) -> String {
    Path::new(command)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| command.to_string())
}

/// Whether a file holds nothing but 7-bit text; shared objects that are
/// really linker scripts do.
fn file_is_ascii_text(path: &Path) -> bool {
    match fs::read(path) {
        Ok(bytes) => bytes.iter().all(|byte| byte.is_ascii()),
        Err(_) => false,
    }
}

/// Resolve the shared object actually linked for `-l<name>`. A linker
/// script standing in for the library names the real object in its GROUP
/// directive.
pub fn resolve_library_name(library_directories: &[String], name: &str) -> String {
    let libname = format!("lib{}.so", name);
    for directory in library_directories {
        let candidate = Path::new(directory).join(&libname);
        if candidate.is_file() && file_is_ascii_text(&candidate) {
            if let Ok(text) = fs::read_to_string(&candidate) {
                if let Some(caps) = GROUP_DIRECTIVE.captures(&text) {
                    let real = basename(&caps[1]);
                    log::debug!("using shared library '{}' instead of '{}'", real, libname);
                    return real;
                }
            }
        }
    }
    libname
}

/// The compiler, used for preprocessing, compiling to assembler source and
/// full compile-and-link builds.
#[derive(Debug, Clone)]
pub struct Compiler {
    command: String,
    basename: String,
    compiler_flags: Vec<String>,
    extra_flags: Vec<String>,
    definitions: Vec<String>,
    include_directories: Vec<String>,
    linker_flags: Vec<String>,
    libraries: Vec<String>,
    library_directories: Vec<String>,
}

impl Compiler {
    pub fn new(command: String) -> Compiler {
        let basename = basename(&command);
        Compiler {
            command,
            basename,
            compiler_flags: Vec::new(),
            extra_flags: Vec::new(),
            definitions: Vec::new(),
            include_directories: Vec::new(),
            linker_flags: Vec::new(),
            libraries: Vec::new(),
            library_directories: Vec::new(),
        }
    }

    /// Extra flags from outside (sdl-config output); duplicates of known
    /// include directories and definitions are skipped.
    pub fn add_extra_flags(&mut self, flags: &[String]) {
        for flag in flags {
            if !self.include_directories.contains(flag)
                && !self.definitions.contains(flag)
                && !self.extra_flags.contains(flag)
            {
                self.extra_flags.push(flag.clone());
            }
        }
    }

    pub fn set_definitions(&mut self, definitions: &[&str]) {
        self.definitions = definitions
            .iter()
            .map(|def| format!("-D{}", def))
            .collect();
    }

    /// Keep only directories that exist; an include directory that also
    /// arrived through the extra flags is deduplicated.
    pub fn set_include_dirs(&mut self, directories: &[String]) {
        self.include_directories.clear();
        for directory in directories {
            if Path::new(directory).is_dir() {
                let flag = format!("-I{}", directory);
                self.extra_flags.retain(|existing| *existing != flag);
                self.include_directories.push(flag);
            }
        }
    }

    /// The canned size-optimizing flag set for the compiler family.
    pub fn generate_compiler_flags(&mut self, platform: &Platform) -> Result<()> {
        self.compiler_flags.clear();
        let common = [
            "-Os",
            "-ffast-math",
            "-fno-asynchronous-unwind-tables",
            "-fno-exceptions",
            "-fno-rtti",
            "-fno-threadsafe-statics",
            "-fomit-frame-pointer",
        ];
        if self.basename.starts_with("g++") || self.basename.starts_with("gcc") {
            self.compiler_flags.extend(common.iter().map(|ss| ss.to_string()));
            self.compiler_flags
                .extend(["-fsingle-precision-constant", "-fwhole-program"].map(String::from));
        } else if self.basename.starts_with("clang") {
            self.compiler_flags.extend(common.iter().map(|ss| ss.to_string()));
        } else {
            return Err(Error::config(format!(
                "compilation not supported with compiler '{}'",
                self.basename
            )));
        }
        if platform.is_ia32() {
            self.compiler_flags
                .extend(["-march=pentium4", "-mpreferred-stack-boundary=2"].map(String::from));
        }
        Ok(())
    }

    pub fn generate_linker_flags(&mut self, platform: &Platform) -> Result<()> {
        self.linker_flags = family_linker_flags(&self.basename, platform)?;
        Ok(())
    }

    pub fn set_libraries(&mut self, libraries: &[String]) {
        self.libraries = libraries.to_vec();
    }

    pub fn set_library_directories(&mut self, directories: &[String]) {
        self.library_directories = directories
            .iter()
            .filter(|directory| Path::new(directory).is_dir())
            .cloned()
            .collect();
    }

    fn library_directory_args(&self) -> Vec<String> {
        self.library_directories
            .iter()
            .map(|directory| format!("-L{}", directory))
            .collect()
    }

    fn library_args(&self) -> Vec<String> {
        self.libraries
            .iter()
            .map(|library| format!("-l{}", library))
            .collect()
    }

    /// Preprocess a source file, returning the expanded text.
    pub fn preprocess(&self, source: &Path) -> Result<String> {
        let mut cmd = vec![self.command.clone(), source.display().to_string()];
        cmd.extend(self.extra_flags.iter().cloned());
        cmd.extend(self.definitions.iter().cloned());
        cmd.extend(self.include_directories.iter().cloned());
        cmd.push("-E".to_string());
        let (stdout, _) = run_command(&cmd)?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    /// Compile a source file into assembler source.
    pub fn compile_asm(&self, source: &Path, output: &Path) -> Result<()> {
        let mut cmd = vec![
            self.command.clone(),
            "-S".to_string(),
            source.display().to_string(),
            "-o".to_string(),
            output.display().to_string(),
        ];
        cmd.extend(self.compiler_flags.iter().cloned());
        cmd.extend(self.extra_flags.iter().cloned());
        cmd.extend(self.definitions.iter().cloned());
        cmd.extend(self.include_directories.iter().cloned());
        run_command(&cmd).map(|_| ())
    }

    /// Compile and link in one go; used by the modes that keep a normal
    /// object format.
    pub fn compile_and_link(&self, source: &Path, output: &Path) -> Result<()> {
        let mut cmd = vec![
            self.command.clone(),
            source.display().to_string(),
            "-o".to_string(),
            output.display().to_string(),
        ];
        cmd.extend(self.compiler_flags.iter().cloned());
        cmd.extend(self.extra_flags.iter().cloned());
        cmd.extend(self.definitions.iter().cloned());
        cmd.extend(self.include_directories.iter().cloned());
        cmd.extend(self.linker_flags.iter().cloned());
        cmd.extend(self.library_directory_args());
        cmd.extend(self.library_args());
        run_command(&cmd).map(|_| ())
    }
}

fn family_linker_flags(basename: &str, platform: &Platform) -> Result<Vec<String>> {
    if basename.starts_with("g++") || basename.starts_with("gcc") {
        Ok(["-nostartfiles", "-nostdlib", "-Xlinker", "--strip-all"]
            .map(String::from)
            .to_vec())
    } else if basename.starts_with("clang") {
        Ok(["-nostdlib", "-Xlinker", "--strip-all"]
            .map(String::from)
            .to_vec())
    } else if basename.starts_with("ld") {
        let interp = match platform.get("interp")? {
            PlatformValue::Str(ss) => ss.trim_matches('"').to_string(),
            PlatformValue::Int(_) => String::new(),
        };
        Ok(vec![
            "-nostdlib".to_string(),
            "--strip-all".to_string(),
            format!("--dynamic-linker={}", interp),
        ])
    } else {
        Err(Error::config(format!(
            "linking not supported with tool '{}'",
            basename
        )))
    }
}

/// The linker, used both for ordinary links and for the raw-binary link of
/// the hand-built image.
#[derive(Debug, Clone)]
pub struct Linker {
    command: String,
    basename: String,
    linker_flags: Vec<String>,
    linker_script: Vec<String>,
    libraries: Vec<String>,
    library_directories: Vec<String>,
}

impl Linker {
    pub fn new(command: String) -> Linker {
        let basename = basename(&command);
        Linker {
            command,
            basename,
            linker_flags: Vec::new(),
            linker_script: Vec::new(),
            libraries: Vec::new(),
            library_directories: Vec::new(),
        }
    }

    pub fn generate_linker_flags(&mut self, platform: &Platform) -> Result<()> {
        self.linker_flags = family_linker_flags(&self.basename, platform)?;
        Ok(())
    }

    pub fn set_libraries(&mut self, libraries: &[String]) {
        self.libraries = libraries.to_vec();
    }

    pub fn set_library_directories(&mut self, directories: &[String]) {
        self.library_directories = directories
            .iter()
            .filter(|directory| Path::new(directory).is_dir())
            .cloned()
            .collect();
    }

    pub fn set_linker_script(&mut self, script: &Path) {
        self.linker_script = vec!["-T".to_string(), script.display().to_string()];
    }

    pub fn resolve_library(&self, name: &str) -> String {
        resolve_library_name(&self.library_directories, name)
    }

    fn library_directory_args(&self) -> Vec<String> {
        let mut ret: Vec<String> = self
            .library_directories
            .iter()
            .map(|directory| format!("-L{}", directory))
            .collect();
        if self.basename.starts_with("ld") {
            ret.push("-rpath-link".to_string());
            ret.push(self.library_directories.join(":"));
        }
        ret
    }

    /// Link a file; extra arguments slot in before any linker script.
    pub fn link(&self, source: &Path, output: &Path, extra: &[&str]) -> Result<String> {
        let mut cmd = vec![
            self.command.clone(),
            source.display().to_string(),
            "-o".to_string(),
            output.display().to_string(),
        ];
        cmd.extend(self.linker_flags.iter().cloned());
        cmd.extend(self.library_directory_args());
        cmd.extend(self.libraries.iter().map(|library| format!("-l{}", library)));
        cmd.extend(extra.iter().map(|arg| arg.to_string()));
        cmd.extend(self.linker_script.iter().cloned());
        let (stdout, _) = run_command(&cmd)?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    /// Link verbosely to capture the internal linker script.
    pub fn get_linker_script(&self, source: &Path, output: &Path) -> Result<String> {
        self.link(source, output, &["--verbose"])
    }

    /// Link the hand-built image as a headerless flat binary at the
    /// platform entry address.
    pub fn link_binary(&self, source: &Path, output: &Path, entry: u64) -> Result<()> {
        let cmd = vec![
            self.command.clone(),
            "--oformat=binary".to_string(),
            format!("--entry={:#x}", entry),
            source.display().to_string(),
            "-o".to_string(),
            output.display().to_string(),
        ];
        run_command(&cmd).map(|_| ())
    }
}

/// Extract the linker script from `--verbose` output and comment out the
/// end-of-image symbol assignments our fake `.bss` provides itself.
pub fn generate_linker_script(verbose_output: &str, destination: &Path) -> Result<()> {
    let caps = LINKER_SCRIPT.captures(verbose_output).ok_or_else(|| {
        Error::parse("could not extract script from linker output")
    })?;
    let script = SCRIPT_END_SYMBOLS
        .replace_all(&caps[1], "\n$1/*$2$3*/\n")
        .into_owned();
    fs::write(destination, script)?;
    log::info!("wrote linker script '{}'", destination.display());
    Ok(())
}

/// The backend assembler.
#[derive(Debug, Clone)]
pub struct Assembler {
    command: String,
    pub syntax: AsmSyntax,
}

impl Assembler {
    pub fn new(command: String) -> Assembler {
        let syntax = AsmSyntax::for_executable(&command);
        Assembler { command, syntax }
    }

    pub fn assemble(&self, source: &Path, output: &Path) -> Result<()> {
        let cmd = vec![
            self.command.clone(),
            source.display().to_string(),
            "-o".to_string(),
            output.display().to_string(),
        ];
        run_command(&cmd).map(|_| ())
    }
}

/// Strip with the canned keep/remove lists; applied to the conventionally
/// linked modes.
pub fn strip_binary(strip: &str, target: &Path) -> Result<()> {
    let mut cmd = vec![strip.to_string()];
    for section in [".bss", ".text", ".data"] {
        cmd.push("-K".to_string());
        cmd.push(section.to_string());
    }
    for section in [
        ".comment",
        ".eh_frame",
        ".eh_frame_hdr",
        ".fini",
        ".gnu.hash",
        ".gnu.version",
        ".jcr",
        ".note",
        ".note.ABI-tag",
        ".note.tag",
    ] {
        cmd.push("-R".to_string());
        cmd.push(section.to_string());
    }
    cmd.push(target.display().to_string());
    run_command(&cmd).map(|_| ())
}

/// Cut the raw-linked file down to its PT_LOAD file size; the linker pads
/// past `end` with bytes nothing will ever map.
pub fn truncate_to_pt_load(readelf: &str, target: &Path) -> Result<()> {
    let cmd = vec![
        readelf.to_string(),
        "-l".to_string(),
        target.display().to_string(),
    ];
    let (stdout, _) = run_command(&cmd)?;
    let text = String::from_utf8_lossy(&stdout);
    let filesz = PT_LOAD_FILESZ
        .captures(&text)
        .and_then(|caps| u64::from_str_radix(&caps[1][2..], 16).ok())
        .ok_or_else(|| {
            Error::parse(format!(
                "could not extract PT_LOAD file size for '{}'",
                target.display()
            ))
        })?;
    let file = fs::OpenOptions::new().write(true).open(target)?;
    file.set_len(filesz)?;
    log::info!("truncated '{}' to {} bytes", target.display(), filesz);
    Ok(())
}

/// Self-extracting compression flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Lzma,
    Xz,
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(text: &str) -> Result<Compression> {
        match text {
            "lzma" => Ok(Compression::Lzma),
            "xz" => Ok(Compression::Xz),
            other => Err(Error::config(format!(
                "unknown unpack header '{}'",
                other
            ))),
        }
    }
}

impl Compression {
    fn command(self, source: &Path) -> Vec<String> {
        let mut cmd = vec!["xz".to_string()];
        match self {
            Compression::Lzma => {
                cmd.push("--format=lzma".to_string());
                cmd.push("--lzma1=preset=9e,lc=1,lp=0,pb=0".to_string());
            }
            Compression::Xz => {
                cmd.push("--format=xz".to_string());
                cmd.push("--lzma2=preset=9e,lc=1,pb=0".to_string());
            }
        }
        cmd.push("--stdout".to_string());
        cmd.push(source.display().to_string());
        cmd
    }

    pub fn unpack_header(self) -> &'static str {
        match self {
            Compression::Lzma => "i=/tmp/i;tail -n+2 $0|lzcat>$i;chmod +x $i;$i;rm $i;exit",
            Compression::Xz => "i=/tmp/i;tail -n+2 $0|xzcat>$i;chmod +x $i;$i;rm $i;exit",
        }
    }
}

/// Compress a binary into a self-extracting executable: one shell stub
/// line, a newline, then the compressed payload.
pub fn compress_file(compression: Compression, source: &Path, destination: &Path) -> Result<()> {
    let (compressed, _) = run_command(&compression.command(source))?;
    let mut file = fs::File::create(destination)?;
    file.write_all(compression.unpack_header().as_bytes())?;
    file.write_all(b"\n")?;
    file.write_all(&compressed)?;
    drop(file);
    make_executable(destination)?;
    let size = fs::metadata(destination)?.len();
    log::info!("wrote '{}': {} bytes", destination.display(), size);
    Ok(())
}

pub fn make_executable(target: &Path) -> Result<()> {
    let mut permissions = fs::metadata(target)?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    fs::set_permissions(target, permissions)?;
    Ok(())
}

/// Search for a file downward from each path in the list.
pub fn find_file(name: &str, search_paths: &[String]) -> Option<PathBuf> {
    search_paths
        .iter()
        .find_map(|path| locate(Path::new(path), name))
}

fn locate(directory: &Path, name: &str) -> Option<PathBuf> {
    let direct = directory.join(name);
    if direct.is_file() {
        return Some(direct);
    }
    let entries = fs::read_dir(directory).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = locate(&path, name) {
                return Some(found);
            }
        }
    }
    None
}

/// Create an empty file if nothing is there yet.
pub fn touch(target: &Path) -> Result<()> {
    if !target.exists() {
        log::debug!("creating nonexistent file '{}'", target.display());
        fs::File::create(target)?;
        return Ok(());
    }
    if !target.is_file() {
        return Err(Error::config(format!(
            "'{}' exists but is not a normal file",
            target.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linker_script_extraction_and_rewrite() {
        let verbose = "GNU ld\nusing internal linker script:\n==================================================\nSECTIONS\n{\n  . = ALIGN(4);\n  _end = .;\n  .data : { *(.data) }\n  PROVIDE (__bss_start = .);\n  .text : { *(.text) }\n}\n==================================================\nmore output\n";
        let caps = LINKER_SCRIPT.captures(verbose).unwrap();
        let script = SCRIPT_END_SYMBOLS.replace_all(&caps[1], "\n$1/*$2$3*/\n");
        assert!(script.contains("/*_end = .;*/"));
        assert!(script.contains("PROVIDE (/*__bss_start = .);*/"));
        assert!(script.contains(".text : { *(.text) }"));
    }

    #[test]
    fn missing_linker_script_marker_is_fatal() {
        assert!(generate_linker_script("no script here", Path::new("/dev/null")).is_err());
    }

    #[test]
    fn pt_load_filesz_parses_both_classes() {
        let elf32 = "  LOAD           0x000000 0x02000000 0x02000000 0x00294 0x01294 RWE 0x1000\n";
        let caps = PT_LOAD_FILESZ.captures(elf32).unwrap();
        assert_eq!(&caps[1], "0x00294");
        let elf64 = "  LOAD           0x0000000000000000 0x0000000000400000 0x0000000000400000\n                 0x00000000000002d8 0x00000000080002d8  RWE    0x1000\n";
        let caps = PT_LOAD_FILESZ.captures(elf64).unwrap();
        assert_eq!(&caps[1], "0x00000000000002d8");
    }

    #[test]
    fn unpack_headers_match_the_stub_format() {
        assert_eq!(
            Compression::Lzma.unpack_header(),
            "i=/tmp/i;tail -n+2 $0|lzcat>$i;chmod +x $i;$i;rm $i;exit"
        );
        assert_eq!(
            Compression::Xz.unpack_header(),
            "i=/tmp/i;tail -n+2 $0|xzcat>$i;chmod +x $i;$i;rm $i;exit"
        );
        assert!("lzma".parse::<Compression>().is_ok());
        assert!("gzip".parse::<Compression>().is_err());
    }

    #[test]
    fn family_flags_per_linker() {
        let plat = Platform::new("Linux", "x86_64");
        let flags = family_linker_flags("ld", &plat).unwrap();
        assert!(flags.contains(&"--dynamic-linker=/lib64/ld-linux-x86-64.so.2".to_string()));
        let gcc = family_linker_flags("g++", &plat).unwrap();
        assert!(gcc.contains(&"-nostartfiles".to_string()));
        assert!(family_linker_flags("mold-wrapper", &plat).is_err());
    }
}
