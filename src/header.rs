//! Generation of the C loader header.
//!
//! The header gives every catalogued call a renamed alias behind the user's
//! "safe mechanism" guard, declares the symbol table struct, and plants one
//! of three `dnload()` bodies: vanilla (the OS linker does everything),
//! dlfcn (dlopen/dlsym over a packed string), or import-by-hash (walk the
//! runtime linker's link map and match SDBM hashes against the dynamic
//! symbol tables).

use crate::driver::Method;
use crate::symbol::Symbol;

/// Emits one header file's text.
#[derive(Debug, Clone, Copy)]
pub struct HeaderEmitter<'a> {
    pub method: Method,
    /// Preprocessor guard selecting the safe mechanism, e.g. `USE_LD`.
    pub definition: &'a str,
    /// Rename prefix, e.g. `dnload_`.
    pub prefix: &'a str,
}

const TOOL_NAME: &str = "smelt";

fn header_begin(definition: &str) -> String {
    format!(
        r#"#ifndef DNLOAD_H
#define DNLOAD_H

/** \file
 * \brief Dynamic loader header stub.
 *
 * This file was automatically generated by '{}'.
 */

#if defined({})
#if defined(WIN32)
#include "windows.h"
#include "GL/glew.h"
#include "GL/glu.h"
#include "SDL.h"
#elif defined(__APPLE__)
#include "GL/glew.h"
#include "GL/glu.h"
#include "SDL/SDL.h"
#else
#include "GL/glew.h"
#include "GL/glu.h"
#include "SDL.h"
#endif
#include "bsd_rand.h"
#else
/** \cond */
#define GL_GLEXT_PROTOTYPES
/** \endcond */
#include "GL/gl.h"
#include "GL/glext.h"
#include "GL/glu.h"
#include "SDL.h"
#include "asm_exit.h"
#endif

#if defined(GLEWAPIENTRY)
/** \cond */
#define DNLOADAPIENTRY GLEWAPIENTRY
/** \endcond */
#else
/** \cond */
#define DNLOADAPIENTRY
/** \endcond */
#endif

#if defined(WIN32)
/** \cond */
#define _USE_MATH_DEFINES
/** \endcond */
#endif
#if defined(__cplusplus)
#include <cmath>
#else
#include <math.h>
#endif

#if defined(__cplusplus)
extern "C" {{
#endif
"#,
        TOOL_NAME, definition
    )
}

const HEADER_END: &str = r#"
#if defined(__cplusplus)
}
#endif

#endif
"#;

/// Zero-initialized libc hooks. These must be objects in the program image:
/// the crunched build assigns them fake `.bss` addresses and exports them
/// through the hand-built symbol table.
const FREEBSD_LIBC_OBJECTS: &str = r#"#if defined(__FreeBSD__)
/** \brief Address of environment, required by libc. */
void *environ;
/** \brief Program name, required by libc. */
const char *__progname = 0;
#endif
"#;

const LOADER_VANILLA: &str = r#"/** \cond */
#define dnload()
/** \endcond */"#;

impl HeaderEmitter<'_> {
    /// Produce the complete header text. `resolve_library` maps a catalog
    /// library name to the shared object actually linked (`c` to
    /// `libc.so.7` and the like).
    pub fn generate(
        &self,
        symbols: &[Symbol],
        resolve_library: impl Fn(&str) -> String,
    ) -> String {
        let mut ret = header_begin(self.definition);
        ret.push_str(&self.symbol_definitions(symbols));
        ret.push_str(&self.symbol_struct(symbols));
        ret.push_str(&self.loader(symbols, resolve_library));
        ret.push_str(HEADER_END);
        ret
    }

    /// Rename macros: the direct set for safe builds, the tabled set
    /// routing through `g_symbol_table` otherwise.
    fn symbol_definitions(&self, symbols: &[Symbol]) -> String {
        let direct: Vec<String> = symbols
            .iter()
            .map(|sym| sym.rename_direct(self.prefix))
            .collect();
        let tabled: Vec<String> = if self.method == Method::Vanilla {
            direct.clone()
        } else {
            symbols
                .iter()
                .map(|sym| sym.rename_tabled(self.prefix))
                .collect()
        };
        format!(
            "\n#if defined({})\n/** \\cond */\n{}\n/** \\endcond */\n#else\n/** \\cond */\n{}\n/** \\endcond */\n#endif\n",
            self.definition,
            direct.join("\n"),
            tabled.join("\n")
        )
    }

    /// The symbol table struct. Members hold SDBM hashes of their names at
    /// startup except in dlfcn mode, where `dnload()` fills them in
    /// declaration order.
    fn symbol_struct(&self, symbols: &[Symbol]) -> String {
        if self.method == Method::Vanilla {
            return String::new();
        }
        let definitions: Vec<String> = symbols
            .iter()
            .map(|sym| format!("  {};", sym.definition()))
            .collect();
        let initializer = if self.method == Method::Dlfcn {
            String::new()
        } else {
            let hashes: Vec<String> = symbols
                .iter()
                .map(|sym| format!("  {}{:#x},", sym.prototype(), sym.hash()))
                .collect();
            format!(" =\n{{\n{}\n}}", hashes.join("\n"))
        };
        format!(
            "\n#if !defined({})\n/** \\brief Symbol table structure.\n *\n * Contains all the symbols required for dynamic linking.\n */\nstatic struct SymbolTableStruct\n{{\n{}\n}} g_symbol_table{};\n#endif\n",
            self.definition,
            definitions.join("\n"),
            initializer
        )
    }

    /// The `dnload()` body for the chosen method, inside the guard.
    fn loader(&self, symbols: &[Symbol], resolve_library: impl Fn(&str) -> String) -> String {
        let mut body = String::new();
        if self.method != Method::Vanilla {
            body.push_str(FREEBSD_LIBC_OBJECTS);
        }
        match self.method {
            Method::Vanilla => body.push_str(LOADER_VANILLA),
            Method::Dlfcn => body.push_str(&loader_dlfcn(symbols, resolve_library)),
            Method::Hash | Method::Maximum => body.push_str(&loader_hash(symbols.len())),
        }
        format!(
            "\n#if defined({})\n/** \\cond */\n#define dnload()\n/** \\endcond */\n#else\n{}\n#endif\n",
            self.definition, body
        )
    }
}

/// dlopen/dlsym loader: walk a packed string of the form
/// `lib1\0sym\0sym\0\0lib2\0sym\0\0\0`, filling the symbol table in
/// declaration order. Requires the symbols sorted by library.
fn loader_dlfcn(symbols: &[Symbol], resolve_library: impl Fn(&str) -> String) -> String {
    let mut packed = String::new();
    let mut current: Option<&str> = None;
    for sym in symbols {
        if current != Some(sym.library) {
            if current.is_some() {
                packed.push_str(&format!("\"\\0{}\\0\"\n", resolve_library(sym.library)));
            } else {
                packed.push_str(&format!("\"{}\\0\"\n", resolve_library(sym.library)));
            }
            current = Some(sym.library);
        }
        packed.push_str(&format!("\"{}\\0\"\n", sym.name));
    }
    packed.push_str("\"\\0\"");
    format!(
        r#"#include <dlfcn.h>
static const char g_dynstr[] = ""
{};
/** \brief Perform init.
 *
 * dlopen/dlsym -style.
 */
static void dnload(void)
{{
  char *src = (char*)g_dynstr;
  void **dst = (void**)&g_symbol_table;
  do {{
    void *handle = dlopen(src, RTLD_LAZY);
    for(;;)
    {{
      while(*(src++));
      if(!*(src))
      {{
        break;
      }}
      *dst++ = dlsym(handle, src);
    }}
  }} while(*(++src));
}}"#,
        packed
    )
}

/// Import-by-hash loader: resolve every symbol by walking the runtime
/// linker's link map, starting from our own program headers at the known
/// load address. There is no error checking; a missing symbol walks off the
/// end of the map and crashes.
fn loader_hash(symbol_count: usize) -> String {
    format!(
        r#"#include <stdint.h>
#if defined(__FreeBSD__)
#include <sys/link_elf.h>
#elif defined(__linux__)
#include <elf.h>
#include <link.h>
#else
#error "no import by hash procedure defined for current operating system"
#endif

#if defined(__x86_64)
/** Base address the executable is linked and loaded at. */
#define DNLOAD_BASE_ADDRESS 0x400000
/** \cond */
typedef Elf64_Ehdr dnload_elf_ehdr_t;
typedef Elf64_Phdr dnload_elf_phdr_t;
typedef Elf64_Dyn dnload_elf_dyn_t;
typedef Elf64_Sym dnload_elf_sym_t;
/** \endcond */
#elif defined(__i386)
/** Base address the executable is linked and loaded at. */
#define DNLOAD_BASE_ADDRESS 0x2000000
/** \cond */
typedef Elf32_Ehdr dnload_elf_ehdr_t;
typedef Elf32_Phdr dnload_elf_phdr_t;
typedef Elf32_Dyn dnload_elf_dyn_t;
typedef Elf32_Sym dnload_elf_sym_t;
/** \endcond */
#else
#error "no import by hash procedure defined for current architecture"
#endif

/** \brief SDBM hash over a string.
 *
 * \param op String to hash.
 * \return Hash of the string.
 */
static uint32_t dnload_hash(const uint8_t *op)
{{
  uint32_t ret = 0;
  for(; (*op); ++op)
  {{
    ret = ret * 65599 + *op;
  }}
  return ret;
}}

/** \brief Transform a dynamic section address.
 *
 * FreeBSD keeps unrelocated addresses in loaded dynamic sections, they must
 * be offset by the object's load address. Linux stores run-time addresses.
 *
 * \param lmap Link map entry the address came from.
 * \param ptr Address read from the dynamic section.
 * \return Usable address.
 */
static const void* dnload_elf_address(const struct link_map *lmap, const void *ptr)
{{
#if defined(__FreeBSD__)
  return (const uint8_t*)ptr + (size_t)lmap->l_addr;
#else
  (void)lmap;
  return ptr;
#endif
}}

/** \brief Find a dynamic section entry by tag.
 *
 * \param dynamic Dynamic section to search.
 * \param tag Tag to look for.
 * \return Entry value, or 0 if not found.
 */
static const void* dnload_elf_tag(const dnload_elf_dyn_t *dynamic, int64_t tag)
{{
  const dnload_elf_dyn_t *ii = dynamic;
  for(; (DT_NULL != ii->d_tag); ++ii)
  {{
    if(tag == (int64_t)ii->d_tag)
    {{
      return (const void*)ii->d_un.d_ptr;
    }}
  }}
  return 0;
}}

/** \brief Find a symbol over every loaded shared object.
 *
 * Starts from our own program headers, reaches the runtime linker's
 * link map through DT_DEBUG, then walks each object's DT_HASH chain
 * comparing name hashes.
 *
 * \param hash Hash of the symbol name to find.
 * \return Symbol address.
 */
static void* dnload_find_symbol(uint32_t hash)
{{
  const struct link_map *lmap;
  {{
    const dnload_elf_ehdr_t *ehdr = (const dnload_elf_ehdr_t*)DNLOAD_BASE_ADDRESS;
    const dnload_elf_phdr_t *phdr = (const dnload_elf_phdr_t*)((const uint8_t*)ehdr + ehdr->e_phoff);
    const dnload_elf_dyn_t *dynamic;
    const struct r_debug *debug = 0;
    for(; (PT_DYNAMIC != phdr->p_type); ++phdr) {{ }}
    for(dynamic = (const dnload_elf_dyn_t*)phdr->p_vaddr; (DT_NULL != dynamic->d_tag); ++dynamic)
    {{
      if(DT_DEBUG == dynamic->d_tag)
      {{
        debug = (const struct r_debug*)dynamic->d_un.d_ptr;
      }}
    }}
    lmap = debug->r_map;
  }}
#if defined(__linux__) && defined(__x86_64)
  /* First object after the executable is the vDSO, it has no tables for us. */
  lmap = lmap->l_next->l_next;
#else
  lmap = lmap->l_next;
#endif
  for(;;)
  {{
    const dnload_elf_dyn_t *dynamic = (const dnload_elf_dyn_t*)lmap->l_ld;
    const char *strtab = (const char*)dnload_elf_address(lmap, dnload_elf_tag(dynamic, DT_STRTAB));
    const dnload_elf_sym_t *symtab = (const dnload_elf_sym_t*)dnload_elf_address(lmap, dnload_elf_tag(dynamic, DT_SYMTAB));
    const uint32_t *hashtable = (const uint32_t*)dnload_elf_address(lmap, dnload_elf_tag(dynamic, DT_HASH));
    uint32_t numchains = hashtable[1];
    uint32_t ii;
    for(ii = 0; (numchains > ii); ++ii)
    {{
      const dnload_elf_sym_t *sym = &symtab[ii];
      const char *name = &strtab[sym->st_name];
      if(dnload_hash((const uint8_t*)name) == hash)
      {{
        return (uint8_t*)sym->st_value + (size_t)lmap->l_addr;
      }}
    }}
    lmap = lmap->l_next;
  }}
}}

/** \brief Perform init.
 *
 * Import by hash - style.
 */
static void dnload(void)
{{
  unsigned ii;
  for(ii = 0; ({} > ii); ++ii)
  {{
    void **iter = ((void**)&g_symbol_table) + ii;
    *iter = dnload_find_symbol(*(uint32_t*)iter);
  }}
}}"#,
        symbol_count
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::find_symbols;

    fn emitter(method: Method) -> HeaderEmitter<'static> {
        HeaderEmitter {
            method,
            definition: "USE_LD",
            prefix: "dnload_",
        }
    }

    fn resolve(lib: &str) -> String {
        format!("lib{}.so", lib)
    }

    #[test]
    fn vanilla_renames_directly_in_both_branches() {
        let symbols = find_symbols(["rand", "glClear"]).unwrap();
        let text = emitter(Method::Vanilla).generate(&symbols, resolve);
        assert!(text.contains("#define dnload_rand bsd_rand"));
        assert!(!text.contains("g_symbol_table"));
        assert!(text.contains("#define dnload()"));
    }

    #[test]
    fn hash_mode_stores_hashes_in_the_struct() {
        let symbols = find_symbols(["glClear", "malloc"]).unwrap();
        let text = emitter(Method::Hash).generate(&symbols, resolve);
        assert!(text.contains("#define dnload_malloc g_symbol_table.malloc"));
        assert!(text.contains("void (DNLOADAPIENTRY *glClear)(GLbitfield);"));
        assert!(text.contains("(void (DNLOADAPIENTRY *)(GLbitfield))0x1fd92088,"));
        assert!(text.contains("dnload_find_symbol"));
        assert!(text.contains("for(ii = 0; (2 > ii); ++ii)"));
        assert!(text.contains("void *environ;"));
    }

    #[test]
    fn dlfcn_packs_symbols_under_their_libraries() {
        let symbols = find_symbols(["SDL_Init", "glClear", "glCreateProgram", "rand"]).unwrap();
        let text = emitter(Method::Dlfcn).generate(&symbols, resolve);
        let expected = "\"libGL.so\\0\"\n\"glClear\\0\"\n\"glCreateProgram\\0\"\n\"\\0libSDL.so\\0\"\n\"SDL_Init\\0\"\n\"\\0libc.so\\0\"\n\"rand\\0\"\n\"\\0\"";
        assert!(text.contains(expected), "packed string malformed");
        // dlfcn fills the table at runtime, no initializer.
        assert!(text.contains("} g_symbol_table;"));
        assert!(text.contains("dlopen(src, RTLD_LAZY)"));
    }

    #[test]
    fn maximum_uses_the_hash_loader() {
        let symbols = find_symbols(["glClear"]).unwrap();
        let text = emitter(Method::Maximum).generate(&symbols, resolve);
        assert!(text.contains("dnload_find_symbol"));
    }

    #[test]
    fn guard_name_is_configurable() {
        let symbols = find_symbols(["malloc"]).unwrap();
        let custom = HeaderEmitter {
            method: Method::Hash,
            definition: "SAFE_BUILD",
            prefix: "call_",
        };
        let text = custom.generate(&symbols, resolve);
        assert!(text.contains("#if defined(SAFE_BUILD)"));
        assert!(text.contains("#define call_malloc"));
        assert!(!text.contains("USE_LD"));
    }
}
