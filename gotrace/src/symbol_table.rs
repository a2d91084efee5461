use crate::error::ResolveError;
use log::{debug, info};
use memmap2::Mmap;
use object::{Architecture, Object, ObjectSection, ObjectSymbol, SectionKind, SymbolKind};
use std::{fs::File, path::Path};

/// One entry of the object file symbol table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSymbol {
    pub name: String,
    pub address: u64,
    pub size: u64,
    /// Index of the section the symbol claims to live in
    pub section_index: Option<usize>,
    pub kind: SymbolKind,
}

impl RawSymbol {
    pub fn is_function(&self) -> bool {
        self.kind == SymbolKind::Text
    }
}

/// Executable section contents, copied out of the mapped binary
#[derive(Debug, Clone)]
pub struct CodeSection {
    pub index: usize,
    pub name: String,
    pub address: u64,
    pub data: Vec<u8>,
}

impl CodeSection {
    pub fn end(&self) -> u64 {
        self.address + self.data.len() as u64
    }

    /// Bytes of `[address, address + size)` if the whole range lies inside the section
    pub fn bytes(&self, address: u64, size: u64) -> Option<&[u8]> {
        let end = address.checked_add(size)?;
        if address < self.address || end > self.end() {
            return None;
        }
        let start = (address - self.address) as usize;
        Some(&self.data[start..start + size as usize])
    }
}

/// Symbols and executable sections of one binary
#[derive(Debug, Clone)]
pub struct SymbolTable {
    pub architecture: Architecture,
    pub symbols: Vec<RawSymbol>,
    pub code_sections: Vec<CodeSection>,
}

impl SymbolTable {
    /// Read the symbol table and executable sections of the binary at `path`
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ResolveError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ResolveError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mmap = unsafe {
            Mmap::map(&file).map_err(|source| ResolveError::Open {
                path: path.to_path_buf(),
                source,
            })?
        };
        Self::parse(path, &mmap)
    }

    /// Parse an already loaded image; `path` is only used for error reporting
    pub fn parse(path: &Path, data: &[u8]) -> Result<Self, ResolveError> {
        let parse_err = |source| ResolveError::Parse {
            path: path.to_path_buf(),
            source,
        };
        let obj = object::File::parse(data).map_err(parse_err)?;

        if obj.symbol_table().is_none() {
            return Err(ResolveError::MissingSymbolTable(path.to_path_buf()));
        }

        let mut code_sections = Vec::new();
        for section in obj.sections() {
            if section.kind() != SectionKind::Text {
                continue;
            }
            let data = section.data().map_err(parse_err)?;
            let name = section.name().unwrap_or("<unnamed>").to_string();
            debug!(
                "Code section {} ({}): 0x{:x}, {} bytes",
                section.index().0,
                name,
                section.address(),
                data.len()
            );
            code_sections.push(CodeSection {
                index: section.index().0,
                name,
                address: section.address(),
                data: data.to_vec(),
            });
        }
        if code_sections.is_empty() {
            return Err(ResolveError::MissingCodeSection(path.to_path_buf()));
        }

        let mut symbols = Vec::new();
        for symbol in obj.symbols() {
            let Ok(name) = symbol.name() else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            symbols.push(RawSymbol {
                name: name.to_string(),
                address: symbol.address(),
                size: symbol.size(),
                section_index: symbol.section_index().map(|index| index.0),
                kind: symbol.kind(),
            });
        }

        info!(
            "Loaded {} symbols and {} code sections from {}",
            symbols.len(),
            code_sections.len(),
            path.display()
        );

        Ok(SymbolTable {
            architecture: obj.architecture(),
            symbols,
            code_sections,
        })
    }

    pub fn code_section(&self, index: usize) -> Option<&CodeSection> {
        self.code_sections.iter().find(|section| section.index == index)
    }

    /// Function symbols that claim to live in an executable section
    pub fn functions(&self) -> impl Iterator<Item = &RawSymbol> {
        self.symbols.iter().filter(|symbol| {
            symbol.is_function()
                && symbol
                    .section_index
                    .is_some_and(|index| self.code_section(index).is_some())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_code_section_bytes() {
        let section = CodeSection {
            index: 1,
            name: ".text".to_string(),
            address: 0x1000,
            data: vec![0x90, 0x90, 0xc3, 0xcc],
        };

        assert_eq!(section.end(), 0x1004);
        assert_eq!(section.bytes(0x1001, 2), Some(&[0x90, 0xc3][..]));
        assert_eq!(section.bytes(0x1000, 4), Some(&section.data[..]));
        assert_eq!(section.bytes(0x1002, 4), None);
        assert_eq!(section.bytes(0xfff, 1), None);
        assert_eq!(section.bytes(u64::MAX, 2), None);
    }

    #[test]
    fn test_read_missing_file() {
        let err = SymbolTable::read("/nonexistent/gotrace-binary").unwrap_err();
        assert!(matches!(err, ResolveError::Open { .. }));
    }

    #[test]
    fn test_read_garbage_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"definitely not an object file").unwrap();
        temp_file.flush().unwrap();

        let err = SymbolTable::read(temp_file.path()).unwrap_err();
        assert!(matches!(err, ResolveError::Parse { .. }));
    }

    #[test]
    fn test_read_own_executable() {
        // The test harness binary is an unstripped object file with a symbol table
        let exe = std::env::current_exe().unwrap();
        let table = SymbolTable::read(&exe).unwrap();

        assert!(!table.code_sections.is_empty());
        assert!(table.functions().next().is_some());
        for function in table.functions() {
            let index = function.section_index.unwrap();
            assert!(table.code_section(index).is_some());
        }
    }
}
