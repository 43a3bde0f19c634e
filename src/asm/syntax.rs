//! Assembler dialect formatting.
//!
//! The backend assembler decides the dialect: anything whose basename starts
//! with `nasm` gets NASM directives, everything else is assumed to speak
//! GNU-AS.

use std::path::Path;

/// Directive set for one assembler dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmSyntax {
    comment: &'static str,
    byte: &'static str,
    short: &'static str,
    word: &'static str,
    quad: &'static str,
    string: &'static str,
}

const GAS: AsmSyntax = AsmSyntax {
    comment: "#",
    byte: ".byte",
    short: ".short",
    word: ".long",
    quad: ".quad",
    string: ".ascii",
};

const NASM: AsmSyntax = AsmSyntax {
    comment: ";",
    byte: "db",
    short: "dw",
    word: "dd",
    quad: "dq",
    string: "db",
};

/// Width of a block comment ruler.
const BLOCK_COMMENT_LENGTH: usize = 40;

impl AsmSyntax {
    /// Pick a dialect from the assembler executable's path.
    pub fn for_executable(executable: &str) -> AsmSyntax {
        let basename = Path::new(executable)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if basename.starts_with("nasm") {
            NASM
        } else {
            GAS
        }
    }

    pub fn gas() -> AsmSyntax {
        GAS
    }

    pub fn nasm() -> AsmSyntax {
        NASM
    }

    /// Data directive for the given element width, or None for widths the
    /// dialect cannot express.
    fn directive(&self, size: u8) -> Option<&'static str> {
        match size {
            1 => Some(self.byte),
            2 => Some(self.short),
            4 => Some(self.word),
            8 => Some(self.quad),
            _ => None,
        }
    }

    /// One data line, value already rendered to source form.
    pub fn format_data(&self, size: u8, value: &str, indent: &str) -> Option<String> {
        self.directive(size)
            .map(|directive| format!("{}{} {}\n", indent, directive, value))
    }

    /// One string literal line; the value keeps its quoted source form.
    pub fn format_string(&self, value: &str, indent: &str) -> String {
        format!("{}{} {}\n", indent, self.string, value)
    }

    pub fn format_equ(&self, name: &str, value: &str) -> String {
        format!(".equ {}, {}\n", name, value)
    }

    pub fn format_label(&self, name: &str) -> String {
        format!("{}:\n", name)
    }

    /// Comment lines, one per description entry.
    pub fn format_comment<'a>(
        &self,
        desc: impl IntoIterator<Item = &'a str>,
        indent: &str,
    ) -> String {
        let mut ret = String::new();
        for line in desc {
            if !line.is_empty() {
                ret.push_str(&format!("{}{} {}\n", indent, self.comment, line));
            }
        }
        ret
    }

    /// A three-line comment ruler with the description centered in the
    /// middle row.
    pub fn format_block_comment(&self, desc: &str) -> String {
        let ruler = self.comment.repeat(BLOCK_COMMENT_LENGTH);
        let mut mid = self.comment.to_string();
        if !desc.is_empty() {
            mid.push(' ');
            mid.push_str(desc);
            mid.push(' ');
        }
        while mid.len() < BLOCK_COMMENT_LENGTH {
            mid.push_str(self.comment);
        }
        format!("{}\n{}\n{}\n", ruler, mid, ruler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_from_executable() {
        assert_eq!(AsmSyntax::for_executable("/usr/bin/as"), AsmSyntax::gas());
        assert_eq!(
            AsmSyntax::for_executable("/usr/local/bin/nasm-2.16"),
            AsmSyntax::nasm()
        );
    }

    #[test]
    fn data_directives() {
        let gas = AsmSyntax::gas();
        assert_eq!(gas.format_data(1, "0x7f", "  ").unwrap(), "  .byte 0x7f\n");
        assert_eq!(gas.format_data(8, "0x1", "").unwrap(), ".quad 0x1\n");
        assert!(gas.format_data(3, "0", "").is_none());
        let nasm = AsmSyntax::nasm();
        assert_eq!(nasm.format_data(4, "0x2", "  ").unwrap(), "  dd 0x2\n");
        assert_eq!(nasm.format_string("\"ELF\"", ""), "db \"ELF\"\n");
    }

    #[test]
    fn block_comment_shape() {
        let text = AsmSyntax::gas().format_block_comment("Elf32_Ehdr");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].len(), 40);
        assert_eq!(lines[2].len(), 40);
        assert!(lines[1].starts_with("# Elf32_Ehdr "));
        assert_eq!(lines[1].len(), 40);
    }
}
