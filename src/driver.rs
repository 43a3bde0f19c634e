//! Pipeline orchestration.
//!
//! One [`Config`] value carries everything a run depends on; there is no
//! process-global state. The pipeline always generates the loader header;
//! when an output file is requested it also builds, shrinks and compresses
//! the executable with the method-specific tool chain.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use regex::Regex;

use crate::asm::AsmSource;
use crate::elf::ElfComposer;
use crate::error::{Error, Result};
use crate::header::HeaderEmitter;
use crate::platform::Platform;
use crate::symbol::find_symbols;
use crate::tools::{
    Assembler, Compiler, Compression, DEFAULT_ASSEMBLER_LIST, DEFAULT_COMPILER_LIST,
    DEFAULT_LINKER_LIST, DEFAULT_READELF_LIST, DEFAULT_STRIP_LIST, Linker, check_executable,
    compress_file, find_file, find_tool, generate_linker_script, resolve_library_name,
    run_command, strip_binary, touch, truncate_to_pt_load,
};

/// How hard to squeeze the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Produce the binary normally; only the unpack header applies.
    Vanilla,
    /// dlopen/dlsym loading, independent of the object format.
    Dlfcn,
    /// Import by hash without violating the object format specification.
    Hash,
    /// Everything, including the hand-built ELF image.
    Maximum,
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(text: &str) -> Result<Method> {
        match text {
            "vanilla" => Ok(Method::Vanilla),
            "dlfcn" => Ok(Method::Dlfcn),
            "hash" => Ok(Method::Hash),
            "maximum" => Ok(Method::Maximum),
            other => Err(Error::config(format!("unknown method '{}'", other))),
        }
    }
}

/// Everything one pipeline run depends on.
#[derive(Debug, Clone)]
pub struct Config {
    pub method: Method,
    pub platform: Platform,
    /// Preprocessor guard for the safe mechanism.
    pub definition: String,
    /// Call prefix identifying the calls to redirect.
    pub prefix: String,
    /// Header file to generate.
    pub target: String,
    /// Paths searched for an existing target header.
    pub search_paths: Vec<String>,
    pub include_directories: Vec<String>,
    pub libraries: Vec<String>,
    pub library_directories: Vec<String>,
    pub source_files: Vec<PathBuf>,
    pub output_file: Option<PathBuf>,
    /// Derive the output filename from the source file instead.
    pub create_binary: bool,
    pub compression: Compression,
    pub assembler: Option<String>,
    pub compiler: Option<String>,
    pub linker: Option<String>,
    pub strip: Option<String>,
}

impl Config {
    pub fn new(platform: Platform) -> Config {
        Config {
            method: Method::Maximum,
            platform,
            definition: "USE_LD".to_string(),
            prefix: "dnload_".to_string(),
            target: "dnload.h".to_string(),
            search_paths: Vec::new(),
            include_directories: [
                "/usr/include/SDL",
                "/usr/local/include",
                "/usr/local/include/SDL",
            ]
            .map(String::from)
            .to_vec(),
            libraries: Vec::new(),
            library_directories: ["/lib", "/usr/lib", "/usr/local/lib"]
                .map(String::from)
                .to_vec(),
            source_files: Vec::new(),
            output_file: None,
            create_binary: false,
            compression: Compression::Lzma,
            assembler: None,
            compiler: None,
            linker: None,
            strip: None,
        }
    }
}

/// Scan preprocessed source for prefixed call names.
fn analyze_source(prefix: &str, text: &str) -> Result<BTreeSet<String>> {
    let pattern = format!(
        r"[\s:;&|<>=^+\-*/()?]{}([a-zA-Z0-9_]+)",
        regex::escape(prefix)
    );
    let symbol_re = Regex::new(&pattern)
        .map_err(|err| Error::config(format!("bad call prefix '{}': {}", prefix, err)))?;
    Ok(symbol_re
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect())
}

/// Locate (or create) the target header, returning (path, directory).
fn resolve_target(config: &Config) -> Result<(PathBuf, PathBuf)> {
    let target = Path::new(&config.target);
    if target.parent().is_some_and(|parent| !parent.as_os_str().is_empty()) {
        log::debug!("using explicit target header file '{}'", target.display());
        touch(target)?;
        let directory = target.parent().unwrap_or(Path::new(".")).to_path_buf();
        return Ok((target.to_path_buf(), directory));
    }
    let search_paths = if config.search_paths.is_empty() {
        vec![".".to_string()]
    } else {
        config.search_paths.clone()
    };
    let name = target.display().to_string();
    let found = find_file(&name, &search_paths).ok_or_else(|| {
        Error::config(format!(
            "no information where to put header file '{}' - not found in path(s) {:?}",
            name, search_paths
        ))
    })?;
    let directory = found.parent().unwrap_or(Path::new(".")).to_path_buf();
    log::debug!(
        "header file '{}' found in path '{}'",
        name,
        directory.display()
    );
    Ok((found, directory))
}

/// Discover source files next to the header when none were given.
fn discover_sources(directory: &Path) -> Result<Vec<PathBuf>> {
    let mut ret: Vec<PathBuf> = fs::read_dir(directory)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("c") | Some("cpp")
            )
        })
        .collect();
    ret.sort();
    if ret.is_empty() {
        return Err(Error::config(format!(
            "could not find any source files in '{}'",
            directory.display()
        )));
    }
    Ok(ret)
}

/// Resolve the requested output path; a bare filename lands next to the
/// header.
fn resolve_output(config: &Config, target_directory: &Path, source: &Path) -> Option<PathBuf> {
    if let Some(output) = &config.output_file {
        if output.parent().is_some_and(|parent| !parent.as_os_str().is_empty()) {
            return Some(output.clone());
        }
        return Some(target_directory.join(output));
    }
    if config.create_binary {
        return Some(source.with_extension(""));
    }
    None
}

fn stage_path(output: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", output.display(), suffix))
}

/// Run the whole pipeline.
pub fn run(config: &Config) -> Result<()> {
    // All downstream ordering leans on the alphabetized library list.
    let mut libraries = config.libraries.clone();
    libraries.sort();

    let (target, target_directory) = resolve_target(config)?;
    let source_files = if config.source_files.is_empty() {
        discover_sources(&target_directory)?
    } else {
        config.source_files.clone()
    };

    let compiler_command = find_tool(config.compiler.as_deref(), DEFAULT_COMPILER_LIST, "compiler")?;
    let mut compiler = Compiler::new(compiler_command);
    if check_executable("sdl-config") {
        let (stdout, _) = run_command(&["sdl-config".to_string(), "--cflags".to_string()])?;
        let flags: Vec<String> = String::from_utf8_lossy(&stdout)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        compiler.add_extra_flags(&flags);
    }
    compiler.set_include_dirs(&config.include_directories);

    // Scan every source for prefixed calls with the header disabled.
    compiler.set_definitions(&["DNLOAD_H"]);
    let mut names: BTreeSet<String> = BTreeSet::new();
    for source in &source_files {
        log::info!("analyzing source file '{}'", source.display());
        let preprocessed = compiler.preprocess(source)?;
        names.extend(analyze_source(&config.prefix, &preprocessed)?);
    }
    let symbols = find_symbols(names.iter().map(String::as_str))?;
    log::info!(
        "symbols found: [{}]",
        symbols
            .iter()
            .map(|sym| format!("'{}'", sym))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let emitter = HeaderEmitter {
        method: config.method,
        definition: &config.definition,
        prefix: &config.prefix,
    };
    let library_directories = config.library_directories.clone();
    let header_text = emitter.generate(&symbols, |library| {
        resolve_library_name(&library_directories, library)
    });
    fs::write(&target, header_text)?;
    log::info!("wrote header file '{}'", target.display());

    let Some(output) = resolve_output(config, &target_directory, &source_files[0]) else {
        return Ok(());
    };
    if source_files.len() > 1 {
        return Err(Error::config(
            "only one source file supported when generating output file",
        ));
    }
    build(config, &libraries, &mut compiler, &source_files[0], &output)
}

/// Build, shrink and compress one executable.
fn build(
    config: &Config,
    libraries: &[String],
    compiler: &mut Compiler,
    source: &Path,
    output: &Path,
) -> Result<()> {
    let platform = &config.platform;
    let assembler_command =
        find_tool(config.assembler.as_deref(), DEFAULT_ASSEMBLER_LIST, "assembler")?;
    let assembler = Assembler::new(assembler_command);
    let linker_command = find_tool(config.linker.as_deref(), DEFAULT_LINKER_LIST, "linker")?;
    let mut linker = Linker::new(linker_command);
    let strip = find_tool(config.strip.as_deref(), DEFAULT_STRIP_LIST, "strip executable")?;

    compiler.generate_compiler_flags(platform)?;
    compiler.generate_linker_flags(platform)?;
    compiler.set_definitions(&[]);
    compiler.set_libraries(libraries);
    compiler.set_library_directories(&config.library_directories);
    linker.generate_linker_flags(platform)?;
    linker.set_libraries(libraries);
    linker.set_library_directories(&config.library_directories);

    let stripped = stage_path(output, ".stripped");
    match config.method {
        Method::Maximum => {
            let readelf = find_tool(None, DEFAULT_READELF_LIST, "readelf")?;
            let asm_path = stage_path(output, ".S");
            compiler.compile_asm(source, &asm_path)?;

            let mut composer = ElfComposer::new(platform.clone())?;
            let mut asm = AsmSource::from_path(&asm_path)?;
            asm.remove_rodata()?;
            if asm.generate_fake_bss(platform)? {
                log::info!("more than 128M of memory used, second PT_LOAD required");
                composer.require_bss_load();
            }
            let resolved: Vec<String> = libraries
                .iter()
                .map(|library| linker.resolve_library(library))
                .collect();
            let segments = composer.compose(&resolved)?;

            let final_path = stage_path(output, ".final.S");
            let mut text = String::new();
            for segment in &segments {
                text.push_str(&segment.generate_source(&assembler.syntax)?);
            }
            text.push_str(&assembler.syntax.format_block_comment("Program"));
            text.push_str(&asm.to_text());
            fs::write(&final_path, text)?;
            log::info!("wrote assembler source '{}'", final_path.display());

            let object = stage_path(output, ".o");
            assembler.assemble(&final_path, &object)?;
            linker.link_binary(&object, &stripped, platform.entry()?)?;
            truncate_to_pt_load(&readelf, &stripped)?;
        }
        Method::Hash => {
            let asm_path = stage_path(output, ".S");
            compiler.compile_asm(source, &asm_path)?;
            let mut asm = AsmSource::from_path(&asm_path)?;
            asm.remove_rodata()?;
            let final_path = stage_path(output, ".final.S");
            asm.write_file(&final_path)?;

            let object = stage_path(output, ".o");
            assembler.assemble(&final_path, &object)?;
            let unprocessed = stage_path(output, ".unprocessed");
            let script_output = linker.get_linker_script(&object, &unprocessed)?;
            let script_path = stage_path(output, ".ld");
            generate_linker_script(&script_output, &script_path)?;
            linker.set_linker_script(&script_path);
            linker.link(&object, &unprocessed, &[])?;

            fs::copy(&unprocessed, &stripped)?;
            strip_binary(&strip, &stripped)?;
        }
        Method::Vanilla | Method::Dlfcn => {
            let unprocessed = stage_path(output, ".unprocessed");
            compiler.compile_and_link(source, &unprocessed)?;
            fs::copy(&unprocessed, &stripped)?;
            strip_binary(&strip, &stripped)?;
        }
    }
    compress_file(config.compression, &stripped, output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_parse() {
        assert_eq!("vanilla".parse::<Method>().unwrap(), Method::Vanilla);
        assert_eq!("dlfcn".parse::<Method>().unwrap(), Method::Dlfcn);
        assert_eq!("hash".parse::<Method>().unwrap(), Method::Hash);
        assert_eq!("maximum".parse::<Method>().unwrap(), Method::Maximum);
        assert!("medium".parse::<Method>().is_err());
    }

    #[test]
    fn source_scan_requires_a_separator_before_the_prefix() {
        let text = "int main() { dnload_glClear(0); x=dnload_malloc(4); nodnload_free(x); }";
        let names = analyze_source("dnload_", text).unwrap();
        let found: Vec<&str> = names.iter().map(String::as_str).collect();
        assert_eq!(found, ["glClear", "malloc"]);
    }

    #[test]
    fn source_scan_honors_custom_prefix() {
        let text = " call_puts(\"hi\"); (call_rand());";
        let names = analyze_source("call_", text).unwrap();
        let found: Vec<&str> = names.iter().map(String::as_str).collect();
        assert_eq!(found, ["puts", "rand"]);
    }

    #[test]
    fn bare_output_name_lands_next_to_the_header() {
        let mut config = Config::new(Platform::new("Linux", "x86_64"));
        config.output_file = Some(PathBuf::from("intro"));
        let output = resolve_output(&config, Path::new("src/intro"), Path::new("src/intro/intro.cpp"));
        assert_eq!(output, Some(PathBuf::from("src/intro/intro")));

        config.output_file = Some(PathBuf::from("build/intro"));
        let output = resolve_output(&config, Path::new("src/intro"), Path::new("src/intro/intro.cpp"));
        assert_eq!(output, Some(PathBuf::from("build/intro")));
    }

    #[test]
    fn create_binary_derives_from_the_source() {
        let mut config = Config::new(Platform::new("Linux", "x86_64"));
        config.create_binary = true;
        let output = resolve_output(&config, Path::new("."), Path::new("demo/intro.cpp"));
        assert_eq!(output, Some(PathBuf::from("demo/intro")));
    }

    #[test]
    fn stage_paths_append_suffixes() {
        let output = PathBuf::from("build/intro");
        assert_eq!(stage_path(&output, ".final.S"), PathBuf::from("build/intro.final.S"));
    }
}
