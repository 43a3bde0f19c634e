//! Command line entry point.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use smelt::driver::{self, Config};
use smelt::platform::Platform;
use smelt::tools::Compression;

#[derive(Parser)]
#[command(name = "smelt", version)]
#[command(about = "Size-optimized executable generator for *nix platforms")]
#[command(long_about = "Preprocesses given source file(s) looking for \
specifically marked function calls, then generates a dynamic loader header \
file that can be used within these same source files to decrease executable \
size.\n\nOptionally also perform the actual compilation of a size-optimized \
binary after generating the header.")]
struct Cli {
    /// Try to use given assembler executable as opposed to autodetect.
    #[arg(short = 'A', long)]
    assembler: Option<String>,

    /// Compile a binary, deriving the output filename from the input file.
    #[arg(short = 'c', long)]
    create_binary: bool,

    /// Try to use given compiler executable as opposed to autodetect.
    #[arg(short = 'C', long)]
    compiler: Option<String>,

    /// Definition to use for checking whether to use the safe mechanism
    /// instead of dynamic loading.
    #[arg(short = 'd', long, default_value = "USE_LD", value_name = "DEFINITION")]
    define: String,

    /// Add an include directory to be searched for header files when
    /// preprocessing.
    #[arg(short = 'I', long = "include-directory", value_name = "DIRECTORY")]
    include_directories: Vec<String>,

    /// Try to use given linker executable as opposed to autodetect.
    #[arg(short = 'k', long)]
    linker: Option<String>,

    /// Add a library to be linked against.
    #[arg(short = 'l', long = "library", value_name = "LIBRARY")]
    libraries: Vec<String>,

    /// Add a library directory to be searched for libraries when linking.
    #[arg(short = 'L', long = "library-directory", value_name = "DIRECTORY")]
    library_directories: Vec<String>,

    /// Method to use for decreasing output file size: vanilla, dlfcn, hash
    /// or maximum.
    #[arg(short = 'm', long, default_value = "maximum")]
    method: String,

    /// Compile a named binary, do not only create a header. A name with a
    /// path is used verbatim; a bare name lands next to the source.
    #[arg(short = 'o', long, value_name = "FILE")]
    output_file: Option<PathBuf>,

    /// Cross-target operating system name.
    #[arg(short = 'O', long, value_name = "OS")]
    operating_system: Option<String>,

    /// Call prefix to identify the calls to redirect.
    #[arg(short = 'P', long, default_value = "dnload_", value_name = "PREFIX")]
    call_prefix: String,

    /// Directory to search for the header file to generate. Current path is
    /// used if not given.
    #[arg(short = 's', long = "search-path", value_name = "DIRECTORY")]
    search_paths: Vec<String>,

    /// Try to use given strip executable as opposed to autodetect.
    #[arg(short = 'S', long = "strip-binary", value_name = "STRIP")]
    strip: Option<String>,

    /// Target header file to generate.
    #[arg(short = 't', long, default_value = "dnload.h", value_name = "HEADER")]
    target: String,

    /// Unpack header to use: lzma or xz.
    #[arg(short = 'u', long, default_value = "lzma", value_name = "FORMAT")]
    unpack_header: String,

    /// Print more about what is being done.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Source files to process.
    #[arg(value_name = "SOURCE")]
    sources: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let verbosity: usize = if cli.verbose { 3 } else { 1 };
    stderrlog::new()
        .verbosity(verbosity)
        .init()
        .context("could not initialize logging")?;

    let platform = Platform::host(cli.operating_system.as_deref());
    let mut config = Config::new(platform);
    config.method = cli.method.parse()?;
    config.compression = cli.unpack_header.parse::<Compression>()?;
    config.definition = cli.define;
    config.prefix = cli.call_prefix;
    config.target = cli.target;
    config.search_paths = cli.search_paths;
    config.include_directories.extend(cli.include_directories);
    config.libraries = cli.libraries;
    config.library_directories.extend(cli.library_directories);
    config.source_files = cli.sources;
    config.output_file = cli.output_file;
    config.create_binary = cli.create_binary;
    config.assembler = cli.assembler;
    config.compiler = cli.compiler;
    config.linker = cli.linker;
    config.strip = cli.strip;

    driver::run(&config).context("build failed")?;
    Ok(())
}
