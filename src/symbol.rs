//! The static library-symbol catalog and the hash used to find entries at
//! runtime.
//!
//! The catalog is a frozen table: (library, return type, name, parameters)
//! for every call a program may route through the generated header. A few
//! entries carry a rename for platforms whose libc exposes the call under a
//! different entry point (FreeBSD's portability shim turns `rand` into
//! `bsd_rand`).

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

/// SDBM string hash, truncated to 32 bits: `h := h * 65599 + c`.
///
/// Well known for having one of the shortest usable implementations, which
/// matters when the hash loop ships inside the binary being shrunk.
pub fn sdbm_hash(name: &str) -> u32 {
    let mut ret: u32 = 0;
    for cc in name.bytes() {
        ret = ret.wrapping_mul(65599).wrapping_add(u32::from(cc));
    }
    ret
}

/// Catalog row: return type, name, optional rename, parameter types.
struct Entry(
    &'static str,
    &'static str,
    Option<&'static str>,
    &'static [&'static str],
);

struct LibraryDef {
    name: &'static str,
    symbols: &'static [Entry],
}

static LIBRARY_C: LibraryDef = LibraryDef {
    name: "c",
    symbols: &[
        Entry("void*", "malloc", None, &["size_t"]),
        Entry("int", "puts", None, &["const char*"]),
        Entry("int", "rand", Some("bsd_rand"), &[]),
        Entry("void", "srand", Some("bsd_srand"), &["unsigned int"]),
    ],
};

static LIBRARY_GL: LibraryDef = LibraryDef {
    name: "GL",
    symbols: &[
        Entry("void", "glActiveTexture", None, &["GLenum"]),
        Entry("void", "glAttachShader", None, &["GLuint", "GLuint"]),
        Entry("void", "glBindFramebuffer", None, &["GLenum", "GLuint"]),
        Entry("void", "glBindTexture", None, &["GLenum", "GLuint"]),
        Entry("void", "glClear", None, &["GLbitfield"]),
        Entry(
            "void",
            "glClearColor",
            None,
            &["GLclampf", "GLclampf", "GLclampf", "GLclampf"],
        ),
        Entry("void", "glCompileShader", None, &["GLuint"]),
        Entry("GLuint", "glCreateProgram", None, &[]),
        Entry("GLuint", "glCreateShader", None, &["GLenum"]),
        Entry("void", "glDisable", None, &["GLenum"]),
        Entry("void", "glDisableVertexAttribArray", None, &["GLuint"]),
        Entry("void", "glDrawArrays", None, &["GLenum", "GLint", "GLsizei"]),
        Entry("void", "glEnable", None, &["GLenum"]),
        Entry("void", "glEnableVertexAttribArray", None, &["GLuint"]),
        Entry(
            "void",
            "glFramebufferTexture2D",
            None,
            &["GLenum", "GLenum", "GLenum", "GLuint", "GLint"],
        ),
        Entry("void", "glGenerateMipmap", None, &["GLenum"]),
        Entry("void", "glGenFramebuffers", None, &["GLsizei", "GLuint*"]),
        Entry("void", "glGenTextures", None, &["GLsizei", "GLuint*"]),
        Entry(
            "GLint",
            "glGetAttribLocation",
            None,
            &["GLuint", "const GLchar*"],
        ),
        Entry(
            "GLint",
            "glGetUniformLocation",
            None,
            &["GLuint", "const GLchar*"],
        ),
        Entry("void", "glLineWidth", None, &["GLfloat"]),
        Entry("void", "glLinkProgram", None, &["GLuint"]),
        Entry(
            "void",
            "glRectf",
            None,
            &["GLfloat", "GLfloat", "GLfloat", "GLfloat"],
        ),
        Entry(
            "void",
            "glRects",
            None,
            &["GLshort", "GLshort", "GLshort", "GLshort"],
        ),
        Entry(
            "void",
            "glShaderSource",
            None,
            &["GLuint", "GLsizei", "const GLchar**", "const GLint*"],
        ),
        Entry(
            "void",
            "glTexImage2D",
            None,
            &[
                "GLenum",
                "GLint",
                "GLint",
                "GLsizei",
                "GLsizei",
                "GLint",
                "GLenum",
                "GLenum",
                "const GLvoid*",
            ],
        ),
        Entry(
            "void",
            "glTexImage2DMultisample",
            None,
            &[
                "GLenum",
                "GLsizei",
                "GLint",
                "GLsizei",
                "GLsizei",
                "GLboolean",
            ],
        ),
        Entry(
            "void",
            "glTexImage3D",
            None,
            &[
                "GLenum",
                "GLint",
                "GLint",
                "GLsizei",
                "GLsizei",
                "GLsizei",
                "GLint",
                "GLenum",
                "GLenum",
                "const GLvoid*",
            ],
        ),
        Entry("void", "glTexParameteri", None, &["GLenum", "GLenum", "GLint"]),
        Entry("void", "glUseProgram", None, &["GLuint"]),
        Entry("void", "glUniform1i", None, &["GLint", "GLint"]),
        Entry("void", "glUniform1f", None, &["GLint", "GLfloat"]),
        Entry("void", "glUniform2i", None, &["GLint", "GLint", "GLint"]),
        Entry(
            "void",
            "glUniform3f",
            None,
            &["GLint", "GLfloat", "GLfloat", "GLfloat"],
        ),
        Entry(
            "void",
            "glUniform3i",
            None,
            &["GLint", "GLint", "GLint", "GLint"],
        ),
        Entry(
            "void",
            "glUniform4i",
            None,
            &["GLint", "GLint", "GLint", "GLint", "GLint"],
        ),
        Entry(
            "void",
            "glUniform1fv",
            None,
            &["GLint", "GLsizei", "const GLfloat*"],
        ),
        Entry(
            "void",
            "glUniform2fv",
            None,
            &["GLint", "GLsizei", "const GLfloat*"],
        ),
        Entry(
            "void",
            "glUniform3fv",
            None,
            &["GLint", "GLsizei", "const GLfloat*"],
        ),
        Entry(
            "void",
            "glUniform4fv",
            None,
            &["GLint", "GLsizei", "const GLfloat*"],
        ),
        Entry(
            "void",
            "glUniformMatrix3fv",
            None,
            &["GLint", "GLsizei", "GLboolean", "const GLfloat*"],
        ),
        Entry(
            "void",
            "glVertexAttribPointer",
            None,
            &[
                "GLuint",
                "GLint",
                "GLenum",
                "GLboolean",
                "GLsizei",
                "const GLvoid*",
            ],
        ),
        Entry(
            "void",
            "glViewport",
            None,
            &["GLint", "GLint", "GLsizei", "GLsizei"],
        ),
    ],
};

static LIBRARY_GLU: LibraryDef = LibraryDef {
    name: "GLU",
    symbols: &[Entry(
        "GLint",
        "gluBuild3DMipmaps",
        None,
        &[
            "GLenum",
            "GLint",
            "GLsizei",
            "GLsizei",
            "GLsizei",
            "GLenum",
            "GLenum",
            "const void*",
        ],
    )],
};

static LIBRARY_M: LibraryDef = LibraryDef {
    name: "m",
    symbols: &[
        Entry("double", "acos", None, &["double"]),
        Entry("float", "acosf", None, &["float"]),
        Entry("float", "powf", None, &["float", "float"]),
        Entry("float", "tanhf", None, &["float"]),
    ],
};

static LIBRARY_SDL: LibraryDef = LibraryDef {
    name: "SDL",
    symbols: &[
        Entry("void", "SDL_GL_SwapBuffers", None, &[]),
        Entry("int", "SDL_Init", None, &["Uint32"]),
        Entry(
            "int",
            "SDL_OpenAudio",
            None,
            &["SDL_AudioSpec*", "SDL_AudioSpec*"],
        ),
        Entry("void", "SDL_PauseAudio", None, &["int"]),
        Entry("int", "SDL_PollEvent", None, &["SDL_Event*"]),
        Entry("void", "SDL_Quit", None, &[]),
        Entry(
            "SDL_Surface*",
            "SDL_SetVideoMode",
            None,
            &["int", "int", "int", "Uint32"],
        ),
        Entry("int", "SDL_ShowCursor", None, &["int"]),
    ],
};

static LIBRARY_DEFINITIONS: &[&LibraryDef] =
    &[&LIBRARY_C, &LIBRARY_GL, &LIBRARY_GLU, &LIBRARY_M, &LIBRARY_SDL];

/// One function symbol resolved from the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub returntype: &'static str,
    pub name: &'static str,
    pub rename: &'static str,
    pub parameters: &'static [&'static str],
    pub library: &'static str,
}

impl Symbol {
    /// Struct member declaration body, e.g.
    /// `void (DNLOADAPIENTRY *glClear)(GLbitfield)`.
    pub fn definition(&self) -> String {
        format!(
            "{} ({}*{})({})",
            self.returntype,
            self.apientry(),
            self.name,
            self.parameter_list()
        )
    }

    /// Cast form of the function pointer type, e.g.
    /// `(void (DNLOADAPIENTRY *)(GLbitfield))`.
    pub fn prototype(&self) -> String {
        format!(
            "({} ({}*)({}))",
            self.returntype,
            self.apientry(),
            self.parameter_list()
        )
    }

    /// Rename macro for builds where the OS linker resolves everything.
    pub fn rename_direct(&self, prefix: &str) -> String {
        format!("#define {}{} {}", prefix, self.name, self.rename)
    }

    /// Rename macro routing the call through the symbol table.
    pub fn rename_tabled(&self, prefix: &str) -> String {
        format!("#define {}{} g_symbol_table.{}", prefix, self.name, self.name)
    }

    pub fn hash(&self) -> u32 {
        sdbm_hash(self.name)
    }

    fn apientry(&self) -> &'static str {
        // GL entry points need the calling-convention macro.
        if self.name.starts_with("gl") {
            "DNLOADAPIENTRY "
        } else {
            ""
        }
    }

    fn parameter_list(&self) -> String {
        if self.parameters.is_empty() {
            "void".to_string()
        } else {
            self.parameters.join(", ")
        }
    }
}

impl Ord for Symbol {
    fn cmp(&self, rhs: &Symbol) -> Ordering {
        self.library
            .cmp(rhs.library)
            .then_with(|| self.name.cmp(rhs.name))
    }
}

impl PartialOrd for Symbol {
    fn partial_cmp(&self, rhs: &Symbol) -> Option<Ordering> {
        Some(self.cmp(rhs))
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Find a single symbol by name across all libraries.
pub fn find_symbol(name: &str) -> Result<Symbol> {
    for lib in LIBRARY_DEFINITIONS {
        if let Some(entry) = lib.symbols.iter().find(|entry| entry.1 == name) {
            return Ok(Symbol {
                returntype: entry.0,
                name: entry.1,
                rename: entry.2.unwrap_or(entry.1),
                parameters: entry.3,
                library: lib.name,
            });
        }
    }
    Err(Error::data(format!(
        "symbol '{}' not known, please add it to the catalog",
        name
    )))
}

/// Resolve a batch of names, sorted by (library, name) so every consumer
/// sees the same deterministic order.
pub fn find_symbols<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Vec<Symbol>> {
    let mut ret = Vec::new();
    for name in names {
        ret.push(find_symbol(name)?);
    }
    ret.sort();
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdbm_known_values() {
        assert_eq!(sdbm_hash(""), 0);
        assert_eq!(sdbm_hash("glClear"), 0x1fd9_2088);
        assert_eq!(sdbm_hash("malloc"), 0x03f3_1de8);
    }

    #[test]
    fn renames_fall_back_to_name() {
        let malloc = find_symbol("malloc").unwrap();
        assert_eq!(malloc.rename, "malloc");
        let rand = find_symbol("rand").unwrap();
        assert_eq!(rand.rename, "bsd_rand");
        assert_eq!(rand.library, "c");
    }

    #[test]
    fn unknown_symbol_is_fatal() {
        assert!(find_symbol("glBogus").is_err());
    }

    #[test]
    fn symbols_sort_by_library_then_name() {
        let syms = find_symbols(["glClear", "malloc", "SDL_Init", "acosf"]).unwrap();
        let order: Vec<&str> = syms.iter().map(|sym| sym.name).collect();
        assert_eq!(order, ["glClear", "SDL_Init", "malloc", "acosf"]);
    }

    #[test]
    fn gl_definitions_carry_apientry() {
        let clear = find_symbol("glClear").unwrap();
        assert_eq!(
            clear.definition(),
            "void (DNLOADAPIENTRY *glClear)(GLbitfield)"
        );
        let create = find_symbol("glCreateProgram").unwrap();
        assert_eq!(create.prototype(), "(GLuint (DNLOADAPIENTRY *)(void))");
        let malloc = find_symbol("malloc").unwrap();
        assert_eq!(malloc.definition(), "void* (*malloc)(size_t)");
    }
}
