//! Size-optimized executable generator for 32-bit and 64-bit x86 *nix
//! platforms.
//!
//! Given a C/C++ source that routes its library calls through a generated
//! header, this crate scans the source for the calls it makes, writes a
//! loader header that resolves them at startup, and optionally builds the
//! program into an executable an order of magnitude smaller than
//! conventional linker output: the assembler source is crunched, the ELF
//! image is assembled by hand without section headers, zero-initialized
//! data becomes address-only bindings past the end of the image, adjacent
//! header structures share overlapping bytes, and the result is wrapped in
//! a self-extracting shell stub.

pub mod asm;
pub mod driver;
pub mod elf;
pub mod error;
pub mod header;
pub mod platform;
pub mod symbol;
pub mod tools;

pub use driver::{Config, Method};
pub use error::{Error, Result};
pub use platform::Platform;
